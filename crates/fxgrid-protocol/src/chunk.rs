//! Audio chunk framing.
//!
//! Every audio block travels as a fixed 12-byte header followed by the planar,
//! channel-major samples and a length-prefixed MIDI sub-block:
//!
//! ```text
//! | channels: i32 LE | samples: i32 LE | is_double: u8 | pad: [u8; 3] |
//! | channels * samples samples, LE, width selected by is_double       |
//! | midi_len: u32 LE | bincode(MidiBuffer)                             |
//! ```
//!
//! The response to a chunk mirrors the request header.

use crate::error::{GridError, Result};
use crate::protocol::{MidiBuffer, SampleFormat};
use std::io::{Read, Write};

/// Upper bound for the encoded MIDI sub-block of one chunk.
pub const MAX_MIDI_BLOCK_LEN: usize = 1024 * 1024;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Sample precision carried by a session. Implemented for `f32` and `f64` only.
pub trait Sample:
    sealed::Sealed + Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    const FORMAT: SampleFormat;
    const WIDTH: usize;

    /// Writes `WIDTH` little-endian bytes.
    fn put(self, out: &mut [u8]);

    /// Reads `WIDTH` little-endian bytes.
    fn get(bytes: &[u8]) -> Self;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::Float32;
    const WIDTH: usize = 4;

    fn put(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn get(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(raw)
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for f64 {
    const FORMAT: SampleFormat = SampleFormat::Float64;
    const WIDTH: usize = 8;

    fn put(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn get(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(raw)
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

/// Channel-major sample storage, reused across blocks.
///
/// Storage only grows; shrinking the active size keeps the allocation.
#[derive(Debug, Clone, Default)]
pub struct AudioBlock<T> {
    channels: Vec<Vec<T>>,
    num_channels: usize,
    num_samples: usize,
}

impl<T: Sample> AudioBlock<T> {
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        let mut block = Self {
            channels: Vec::new(),
            num_channels: 0,
            num_samples: 0,
        };
        block.ensure_size(num_channels, num_samples);
        block
    }

    pub fn from_channels(channels: Vec<Vec<T>>) -> Self {
        let num_samples = channels.iter().map(Vec::len).min().unwrap_or(0);
        Self {
            num_channels: channels.len(),
            channels,
            num_samples,
        }
    }

    /// Resizes the active region, allocating only when the storage is too small.
    pub fn ensure_size(&mut self, num_channels: usize, num_samples: usize) {
        while self.channels.len() < num_channels {
            self.channels.push(vec![T::default(); num_samples]);
        }
        for ch in &mut self.channels[..num_channels] {
            if ch.len() < num_samples {
                ch.resize(num_samples, T::default());
            }
        }
        self.num_channels = num_channels;
        self.num_samples = num_samples;
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn channel(&self, ch: usize) -> &[T] {
        &self.channels[ch][..self.num_samples]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [T] {
        let n = self.num_samples;
        &mut self.channels[ch][..n]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [T]> {
        let n = self.num_samples;
        self.channels[..self.num_channels]
            .iter_mut()
            .map(move |ch| &mut ch[..n])
    }

    /// Zeroes the active region.
    pub fn clear(&mut self) {
        for ch in self.channels_mut() {
            ch.fill(T::default());
        }
    }

    pub fn is_silent(&self) -> bool {
        (0..self.num_channels).all(|ch| self.channel(ch).iter().all(|&s| s == T::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub channels: i32,
    pub samples: i32,
    pub is_double: bool,
}

impl ChunkHeader {
    pub const SIZE: usize = 12;

    pub fn new(channels: usize, samples: usize, format: SampleFormat) -> Self {
        Self {
            channels: channels as i32,
            samples: samples as i32,
            is_double: format.is_double(),
        }
    }

    pub fn format(&self) -> SampleFormat {
        SampleFormat::from_is_double(self.is_double)
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.channels.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.samples.to_le_bytes());
        bytes[8] = self.is_double as u8;
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        let channels = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let samples = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let is_double = match bytes[8] {
            0 => false,
            1 => true,
            other => {
                return Err(GridError::InvalidChunk(format!(
                    "precision flag must be 0 or 1, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            channels,
            samples,
            is_double,
        })
    }

    pub fn read_from<R: Read>(mut r: R) -> Result<Self> {
        let mut bytes = [0u8; Self::SIZE];
        r.read_exact(&mut bytes)?;
        Self::decode(&bytes)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(&self.encode())?;
        Ok(())
    }

    /// Checks the header against the negotiated session layout.
    pub fn validate(
        &self,
        expected_channels: usize,
        max_samples: usize,
        format: SampleFormat,
    ) -> Result<()> {
        if self.channels <= 0 || self.samples <= 0 {
            return Err(GridError::InvalidChunk(format!(
                "non-positive block size: {} channels x {} samples",
                self.channels, self.samples
            )));
        }
        if self.channels as usize != expected_channels {
            return Err(GridError::InvalidChunk(format!(
                "declared {} channels, session has {}",
                self.channels, expected_channels
            )));
        }
        if self.samples as usize > max_samples {
            return Err(GridError::InvalidChunk(format!(
                "declared {} samples, block size is {}",
                self.samples, max_samples
            )));
        }
        if self.format() != format {
            return Err(GridError::InvalidChunk(format!(
                "declared {:?}, session negotiated {:?}",
                self.format(),
                format
            )));
        }
        Ok(())
    }

    /// Audio payload size in bytes, MIDI sub-block excluded.
    pub fn payload_len(&self) -> usize {
        self.channels.max(0) as usize * self.samples.max(0) as usize * self.format().width()
    }
}

/// Encodes header, audio and MIDI of one block and writes it in a single call.
pub fn write_chunk<W: Write, T: Sample>(
    mut w: W,
    block: &AudioBlock<T>,
    midi: &MidiBuffer,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let header = ChunkHeader::new(block.num_channels(), block.num_samples(), T::FORMAT);

    scratch.clear();
    scratch.extend_from_slice(&header.encode());

    let audio_start = scratch.len();
    scratch.resize(audio_start + header.payload_len(), 0);
    let mut offset = audio_start;
    for ch in 0..block.num_channels() {
        for &sample in block.channel(ch) {
            sample.put(&mut scratch[offset..offset + T::WIDTH]);
            offset += T::WIDTH;
        }
    }

    let len_pos = scratch.len();
    scratch.extend_from_slice(&[0u8; 4]);
    bincode::serialize_into(&mut *scratch, midi)?;
    let midi_len = (scratch.len() - len_pos - 4) as u32;
    scratch[len_pos..len_pos + 4].copy_from_slice(&midi_len.to_le_bytes());

    w.write_all(scratch)?;
    w.flush()?;
    Ok(())
}

/// Reads the payload that follows `header` into `block` and `midi`.
///
/// The header must already be validated; its precision must match `T`.
pub fn read_chunk_payload<R: Read, T: Sample>(
    mut r: R,
    header: &ChunkHeader,
    block: &mut AudioBlock<T>,
    midi: &mut MidiBuffer,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    if header.format() != T::FORMAT {
        return Err(GridError::InvalidChunk(format!(
            "payload is {:?}, buffer is {:?}",
            header.format(),
            T::FORMAT
        )));
    }
    let channels = header.channels.max(0) as usize;
    let samples = header.samples.max(0) as usize;
    block.ensure_size(channels, samples);

    scratch.resize(header.payload_len(), 0);
    r.read_exact(scratch)?;
    let mut offset = 0;
    for ch in 0..channels {
        for sample in block.channel_mut(ch) {
            *sample = T::get(&scratch[offset..offset + T::WIDTH]);
            offset += T::WIDTH;
        }
    }

    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let midi_len = u32::from_le_bytes(len_bytes) as usize;
    if midi_len > MAX_MIDI_BLOCK_LEN {
        return Err(GridError::InvalidChunk(format!(
            "MIDI block of {} bytes exceeds limit",
            midi_len
        )));
    }
    scratch.resize(midi_len, 0);
    r.read_exact(scratch)?;
    *midi = bincode::deserialize(scratch)?;
    Ok(())
}
