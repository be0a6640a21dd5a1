//! Handshake, MIDI and control-channel messages.

use crate::error::{GridError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_SERVER_PORT: u16 = 55055;

/// Upper bound for one handshake or control frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Width of the active-channel mask.
pub const MAX_INPUT_CHANNELS: usize = 64;

/// Most output channels a session may request.
pub const MAX_OUTPUT_CHANNELS: usize = 64;

/// Largest block a session may negotiate, in samples.
pub const MAX_BLOCK_SIZE: u32 = 65536;

const MIDI_STACK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Float32,
    Float64,
}

#[allow(clippy::derivable_impls)]
impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::Float32
    }
}

impl SampleFormat {
    pub fn from_is_double(is_double: bool) -> Self {
        if is_double {
            SampleFormat::Float64
        } else {
            SampleFormat::Float32
        }
    }

    pub fn is_double(self) -> bool {
        self == SampleFormat::Float64
    }

    /// Bytes per sample on the wire.
    pub fn width(self) -> usize {
        match self {
            SampleFormat::Float32 => 4,
            SampleFormat::Float64 => 8,
        }
    }
}

/// Which of the client's input (and sidechain) channels carry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveChannels(u64);

impl ActiveChannels {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Every channel below `count` active.
    pub fn all(count: usize) -> Self {
        if count >= MAX_INPUT_CHANNELS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_active(self, channel: usize) -> bool {
        channel < MAX_INPUT_CHANNELS && self.0 & (1u64 << channel) != 0
    }

    pub fn set_active(&mut self, channel: usize, active: bool) {
        if channel >= MAX_INPUT_CHANNELS {
            return;
        }
        if active {
            self.0 |= 1u64 << channel;
        } else {
            self.0 &= !(1u64 << channel);
        }
    }

    /// Number of active channels below `limit`.
    pub fn count_below(self, limit: usize) -> usize {
        (0..limit.min(MAX_INPUT_CHANNELS))
            .filter(|&ch| self.is_active(ch))
            .count()
    }

    /// Active channel indices below `limit`, ascending.
    pub fn iter_below(self, limit: usize) -> impl Iterator<Item = usize> {
        (0..limit.min(MAX_INPUT_CHANNELS)).filter(move |&ch| self.is_active(ch))
    }

    /// True if no bit is set at or above `limit`.
    pub fn fits(self, limit: usize) -> bool {
        limit >= MAX_INPUT_CHANNELS || self.0 >> limit == 0
    }
}

/// Raw MIDI message positioned inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame_offset: u32,
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub fn from_bytes(frame_offset: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            frame_offset,
            data,
            len: len as u8,
        }
    }

    pub fn note_on(frame_offset: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x90 | (channel & 0x0f), note, velocity])
    }

    pub fn note_off(frame_offset: u32, channel: u8, note: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x80 | (channel & 0x0f), note, 0])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn is_note_on(&self) -> bool {
        self.len == 3 && self.data[0] & 0xf0 == 0x90 && self.data[2] > 0
    }
}

pub type MidiBuffer = SmallVec<[MidiEvent; MIDI_STACK_CAPACITY]>;

/// Session parameters proposed by the client at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u32,
    /// Client host identity, also the key of the recents list.
    pub host: String,
    pub client_id: u64,
    pub channels_in: u32,
    pub channels_out: u32,
    pub channels_sc: u32,
    pub active_channels: ActiveChannels,
    pub sample_rate: f64,
    pub block_size: u32,
    pub sample_format: SampleFormat,
    pub sandboxing: bool,
}

impl HandshakeRequest {
    /// Stereo in/out, all channels active, single precision, no sandbox.
    pub fn new(host: impl Into<String>, sample_rate: f64, block_size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            host: host.into(),
            client_id: 0,
            channels_in: 2,
            channels_out: 2,
            channels_sc: 0,
            active_channels: ActiveChannels::all(2),
            sample_rate,
            block_size,
            sample_format: SampleFormat::Float32,
            sandboxing: false,
        }
    }

    pub fn client_id(mut self, id: u64) -> Self {
        self.client_id = id;
        self
    }

    /// Resets the active mask to all input and sidechain channels.
    pub fn channels(mut self, inputs: u32, outputs: u32, sidechain: u32) -> Self {
        self.channels_in = inputs;
        self.channels_out = outputs;
        self.channels_sc = sidechain;
        self.active_channels = ActiveChannels::all(self.input_channels());
        self
    }

    pub fn active_channels(mut self, active: ActiveChannels) -> Self {
        self.active_channels = active;
        self
    }

    pub fn sample_format(mut self, format: SampleFormat) -> Self {
        self.sample_format = format;
        self
    }

    pub fn sandboxed(mut self, sandboxing: bool) -> Self {
        self.sandboxing = sandboxing;
        self
    }

    /// Physical input channels, sidechain included.
    pub fn input_channels(&self) -> usize {
        (self.channels_in as usize).saturating_add(self.channels_sc as usize)
    }

    /// Channel count of every chunk exchanged in this session.
    pub fn buffer_channels(&self) -> usize {
        self.input_channels().max(self.channels_out as usize)
    }

    pub fn validate(&self) -> Result<()> {
        let reject = |reason: String| Err(GridError::HandshakeRejected(reason));

        if self.version != PROTOCOL_VERSION {
            return reject(format!(
                "protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, self.version
            ));
        }
        if self.input_channels() > MAX_INPUT_CHANNELS {
            return reject(format!(
                "{} input channels exceed the maximum of {}",
                self.input_channels(),
                MAX_INPUT_CHANNELS
            ));
        }
        if self.channels_out as usize > MAX_OUTPUT_CHANNELS {
            return reject(format!(
                "{} output channels exceed the maximum of {}",
                self.channels_out, MAX_OUTPUT_CHANNELS
            ));
        }
        if self.buffer_channels() == 0 {
            return reject("session has no channels".to_string());
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return reject(format!("invalid sample rate {}", self.sample_rate));
        }
        if self.block_size == 0 {
            return reject("block size must be positive".to_string());
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return reject(format!(
                "block size {} exceeds the maximum of {}",
                self.block_size, MAX_BLOCK_SIZE
            ));
        }
        if !self.active_channels.fits(self.input_channels()) {
            return reject(format!(
                "active channel mask {:#x} exceeds {} input channels",
                self.active_channels.bits(),
                self.input_channels()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    /// Stream on this connection.
    Local,
    /// Reconnect to `port` on the same host and stream there.
    Sandbox { port: u16 },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub version: u32,
    pub status: HandshakeStatus,
}

impl HandshakeResponse {
    pub fn local() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status: HandshakeStatus::Local,
        }
    }

    pub fn sandbox(port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status: HandshakeStatus::Sandbox { port },
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status: HandshakeStatus::Rejected {
                reason: reason.into(),
            },
        }
    }
}

/// Opaque application traffic between a sandbox and its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxMessage {
    /// Plugins currently loaded across all sessions of the sandbox.
    LoadedCount { count: u32 },
    Custom { kind: String, payload: Vec<u8> },
}

/// Master to sandbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterMessage {
    Handoff {
        handoff_id: u64,
        request: HandshakeRequest,
    },
    Application(SandboxMessage),
    Shutdown,
}

/// Sandbox to master message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SlaveMessage {
    Ready { pid: u32 },
    HandoffAccepted { handoff_id: u64, port: u16 },
    HandoffFailed { handoff_id: u64, message: String },
    Application(SandboxMessage),
}

/// Writes one length-prefixed bincode frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(mut w: W, msg: &T) -> Result<()> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(GridError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }
    w.write_all(&(data.len() as u32).to_be_bytes())?;
    w.write_all(&data)?;
    w.flush()?;
    Ok(())
}

/// Reads one length-prefixed bincode frame from a blocking stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(mut r: R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(GridError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(bincode::deserialize(&data)?)
}
