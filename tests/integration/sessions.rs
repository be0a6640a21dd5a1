//! Session lifecycle, malformed input and chain edits.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use fxgrid::prelude::*;
use fxgrid::protocol::protocol::{read_frame, write_frame};
use fxgrid::server::WorkerState;
use fxgrid::HandshakeResponse;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

fn raw_session(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    write_frame(&stream, &stereo_request()).unwrap();
    let _: HandshakeResponse = read_frame(&stream).unwrap();
    stream
}

#[test]
fn test_malformed_header_ends_only_that_session() {
    let (server, addr) = start_server(test_config());
    let mut healthy = StreamClient::connect(addr, stereo_request()).unwrap();
    let mut broken = raw_session(addr);
    assert!(wait_until(|| server.num_sessions() == 2));

    // 3 channels in a stereo session.
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&3i32.to_le_bytes());
    header[4..8].copy_from_slice(&64i32.to_le_bytes());
    broken.write_all(&header).unwrap();

    broken
        .set_read_timeout(Some(SETTLE_TIMEOUT))
        .unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(broken.read(&mut buf), Ok(0) | Err(_)));
    assert!(wait_until(|| server.num_sessions() == 1));

    let mut block = constant_block(2, 64, 0.5);
    healthy.process(&mut block, &mut MidiBuffer::new()).unwrap();
    assert!((block.channel(0)[0] - 0.5).abs() < FLOAT_EPSILON);

    // The server still accepts new sessions.
    let mut late = StreamClient::connect(addr, stereo_request()).unwrap();
    late.process(&mut constant_block(2, 8, 0.0), &mut MidiBuffer::new())
        .unwrap();
    server.shutdown();
}

#[test]
fn test_bad_plugin_leaves_chain_unchanged() {
    let (server, addr) = start_server(test_config());
    let _client = StreamClient::connect(addr, stereo_request()).unwrap();
    let session = only_session(&server);

    session.add_plugin("builtin:passthrough").unwrap();
    let err = session.add_plugin("bad-id").unwrap_err();
    assert!(!err.is_empty());
    assert_eq!(session.size(), 1);
    server.shutdown();
}

#[test]
fn test_edits_apply_between_blocks() {
    let (server, addr) = start_server(test_config());
    let mut client = StreamClient::connect(addr, stereo_request()).unwrap();
    let session = only_session(&server);
    let mut midi = MidiBuffer::new();

    let mut block = constant_block(2, 256, 1.0);
    client.process(&mut block, &mut midi).unwrap();
    assert!((peak(block.channel(0)) - 1.0).abs() < DSP_EPSILON);

    session.add_plugin("builtin:gain?db=6.0206").unwrap();
    session.add_plugin("builtin:delay?samples=16").unwrap();
    assert_eq!(session.size(), 2);
    assert_eq!(session.latency_samples(), 16);
    assert_eq!(session.processor(0).unwrap().name, "Gain");

    let mut block = constant_block(2, 256, 1.0);
    client.process(&mut block, &mut midi).unwrap();
    // Every sample of the block saw the whole chain.
    assert!(block.channel(0)[..16].iter().all(|&s| s == 0.0));
    assert!(block.channel(0)[16..].iter().all(|&s| (s - 2.0).abs() < DSP_EPSILON));

    session.exchange_plugins(0, 1).unwrap();
    assert_eq!(session.processor(0).unwrap().name, "Delay");
    session.del_plugin(0).unwrap();
    assert!(session.del_plugin(5).is_err());
    assert_eq!(session.latency_samples(), 0);
    assert!((session.parameter_value(0, 0).unwrap() - 6.0206).abs() < DSP_EPSILON);

    session.clear().unwrap();
    assert_eq!(session.size(), 0);
    server.shutdown();
}

#[test]
fn test_edits_while_streaming() {
    const EDITS: i32 = 4;
    let (server, addr) = start_server(test_config());
    let mut client = StreamClient::connect(addr, stereo_request()).unwrap();
    let session = only_session(&server);

    // Each edit doubles the level, so every block shows how many edits it saw.
    let editor = thread::spawn(move || {
        for _ in 0..EDITS {
            session.add_plugin("builtin:gain?db=6.0206").unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        session.size()
    });

    let mut midi = MidiBuffer::new();
    let mut doublings = Vec::new();
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let done = editor.is_finished();
        let mut block = constant_block(2, 128, 0.5);
        client.process(&mut block, &mut midi).unwrap();

        let level = block.channel(0)[0];
        let k = (level / 0.5).log2().round() as i32;
        let expected = 0.5 * 2f32.powi(k);
        assert!((level - expected).abs() < 1e-3 * expected, "level {} is not 0.5 * 2^k", level);
        for ch in 0..2 {
            assert!(
                block.channel(ch).iter().all(|&s| (s - level).abs() < DSP_EPSILON),
                "block changed level mid-block"
            );
        }
        doublings.push(k);

        if done {
            break;
        }
        assert!(Instant::now() < deadline, "edits did not finish");
    }

    assert_eq!(editor.join().unwrap(), EDITS as usize);
    assert!(doublings.windows(2).all(|w| w[0] <= w[1]), "{:?}", doublings);
    assert_eq!(doublings.last(), Some(&EDITS));
    server.shutdown();
}

#[test]
fn test_shutdown_unblocks_mid_chunk() {
    let (server, addr) = start_server(test_config());
    let mut stream = raw_session(addr);
    let session = only_session(&server);

    // Header of a full block, then nothing.
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&2i32.to_le_bytes());
    header[4..8].copy_from_slice(&512i32.to_le_bytes());
    stream.write_all(&header).unwrap();
    assert!(wait_until(|| session.state() == WorkerState::ReadingPayload));

    let started = Instant::now();
    let stopper = {
        let session = session.clone();
        thread::spawn(move || session.shutdown())
    };
    stopper.join().unwrap();
    session.join();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(session.is_finished());

    session.shutdown();
    assert_eq!(
        session.add_plugin("builtin:gain").unwrap_err(),
        GridError::SessionClosed.to_string()
    );
    server.shutdown();
    server.shutdown();
}

#[test]
fn test_recents_shared_per_host() {
    let (server, addr) = start_server(test_config());
    let _a = StreamClient::connect(addr, stereo_request()).unwrap();
    let first = only_session(&server);
    let _b = StreamClient::connect(addr, stereo_request()).unwrap();
    assert!(wait_until(|| server.num_sessions() == 2));
    let second = server
        .sessions()
        .into_iter()
        .find(|s| s.id() != first.id())
        .unwrap();

    first.add_plugin("builtin:gain").unwrap();
    first.add_plugin("builtin:delay").unwrap();
    second.add_plugin("builtin:gain?db=-3").unwrap();

    let names: Vec<_> = second.recents_list().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["Gain", "Delay"]);
    assert_eq!(server.recents().recents("other-host").len(), 0);
    server.shutdown();
}
