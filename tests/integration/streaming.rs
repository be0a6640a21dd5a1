//! Chunk round trips through locally hosted sessions.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use fxgrid::prelude::*;
use fxgrid::protocol::chunk::{read_chunk_payload, write_chunk};
use fxgrid::{ChunkHeader, HandshakeResponse, HandshakeStatus};
use std::net::TcpStream;

#[test]
fn test_silence_round_trip() {
    let (server, addr) = start_server(test_config());
    let mut client = StreamClient::connect(addr, stereo_request()).unwrap();
    let mut midi = MidiBuffer::new();

    for _ in 0..10 {
        let mut block = AudioBlock::<f32>::new(2, TEST_BLOCK_SIZE as usize);
        client.process(&mut block, &mut midi).unwrap();
        assert_eq!(block.num_channels(), 2);
        assert_eq!(block.num_samples(), TEST_BLOCK_SIZE as usize);
        assert!(block.is_silent());
    }
    server.shutdown();
}

/// Talks to the server without the client to check the raw response headers.
#[test]
fn test_response_mirrors_header() {
    let (server, addr) = start_server(test_config());
    let stream = TcpStream::connect(addr).unwrap();
    fxgrid::protocol::protocol::write_frame(&stream, &stereo_request()).unwrap();
    let response: HandshakeResponse = fxgrid::protocol::protocol::read_frame(&stream).unwrap();
    assert_eq!(response.status, HandshakeStatus::Local);

    let mut scratch = Vec::new();
    for samples in [512usize, 64, 1] {
        let block = constant_block(2, samples, 0.25);
        write_chunk(&stream, &block, &MidiBuffer::new(), &mut scratch).unwrap();

        let header = ChunkHeader::read_from(&stream).unwrap();
        assert_eq!(header.channels, 2);
        assert_eq!(header.samples, samples as i32);
        assert!(!header.is_double);

        let mut out = AudioBlock::<f32>::default();
        let mut midi = MidiBuffer::new();
        read_chunk_payload(&stream, &header, &mut out, &mut midi, &mut scratch).unwrap();
        assert!(out.channel(1).iter().all(|&s| (s - 0.25).abs() < FLOAT_EPSILON));
    }
    server.shutdown();
}

#[test]
fn test_double_precision_gain() {
    let (server, addr) = start_server(test_config());
    let request = stereo_request().sample_format(SampleFormat::Float64);
    let mut client = StreamClient::connect(addr, request).unwrap();

    only_session(&server)
        .add_plugin("builtin:gain?db=6.0206")
        .unwrap();

    let ramp: Vec<f64> = (0..TEST_BLOCK_SIZE).map(|i| i as f64 / 1024.0).collect();
    let mut block = AudioBlock::from_channels(vec![ramp.clone(), ramp.clone()]);
    client.process(&mut block, &mut MidiBuffer::new()).unwrap();

    for ch in 0..2 {
        for (out, input) in block.channel(ch).iter().zip(&ramp) {
            assert!((out - input * 2.0).abs() < DSP_EPSILON_F64);
        }
    }
    server.shutdown();
}

#[test]
fn test_client_refuses_wrong_precision() {
    let (server, addr) = start_server(test_config());
    let mut client = StreamClient::connect(addr, stereo_request()).unwrap();
    let mut block = AudioBlock::<f64>::new(2, 64);
    assert!(client.process(&mut block, &mut MidiBuffer::new()).is_err());
    server.shutdown();
}

#[test]
fn test_inactive_inputs_are_skipped() {
    let (server, addr) = start_server(test_config());
    let mut active = ActiveChannels::from_bits(0);
    active.set_active(0, true);
    active.set_active(2, true);
    let request = HandshakeRequest::new("test-host", TEST_SAMPLE_RATE, 64)
        .channels(4, 2, 0)
        .active_channels(active);
    let mut client = StreamClient::connect(addr, request).unwrap();

    let mut block = AudioBlock::from_channels(vec![
        vec![1.0f32; 64],
        vec![5.0; 64],
        vec![2.0; 64],
        vec![7.0; 64],
    ]);
    client.process(&mut block, &mut MidiBuffer::new()).unwrap();

    // Active inputs 0 and 2 feed outputs 0 and 1; the rest comes back silent.
    assert!(block.channel(0).iter().all(|&s| s == 1.0));
    assert!(block.channel(1).iter().all(|&s| s == 2.0));
    assert_eq!(peak(block.channel(2)), 0.0);
    assert_eq!(peak(block.channel(3)), 0.0);
    server.shutdown();
}

#[test]
fn test_midi_passes_through_chain() {
    let (server, addr) = start_server(test_config());
    let mut client = StreamClient::connect(addr, stereo_request()).unwrap();
    only_session(&server).add_plugin("builtin:passthrough").unwrap();

    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_on(0, 0, 60, 100));
    midi.push(MidiEvent::note_off(256, 0, 60));
    let mut block = AudioBlock::<f32>::new(2, TEST_BLOCK_SIZE as usize);
    client.process(&mut block, &mut midi).unwrap();

    assert_eq!(midi.len(), 2);
    assert!(midi[0].is_note_on());
    assert_eq!(midi[1].frame_offset, 256);
    server.shutdown();
}
