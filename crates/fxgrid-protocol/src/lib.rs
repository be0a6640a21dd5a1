//! Wire protocol for fxgrid remote effect processing
//!
//! This crate holds everything both ends of a session agree on: the chunk
//! codec used for streaming audio and MIDI, the handshake that negotiates a
//! session, the control-channel messages exchanged between the server and its
//! sandbox processes, and plugin descriptions. The server lives in
//! `fxgrid-server`.
//!
//! ## Usage
//!
//! ```ignore
//! use fxgrid_protocol::{AudioBlock, HandshakeRequest, MidiBuffer, StreamClient};
//!
//! let request = HandshakeRequest::new("studio", 48000.0, 512).channels(2, 2, 0);
//! let mut client = StreamClient::connect("127.0.0.1:55055", request)?;
//!
//! let mut block = AudioBlock::<f32>::new(2, 512);
//! let mut midi = MidiBuffer::new();
//! client.process(&mut block, &mut midi)?;
//! ```

pub mod error;
pub use error::{GridError, Result};

pub mod chunk;
pub use chunk::{AudioBlock, ChunkHeader, Sample};

mod client;
pub use client::StreamClient;

mod metadata;
pub use metadata::{PluginDescription, PluginFormat};

pub mod protocol;
pub use protocol::{
    ActiveChannels, HandshakeRequest, HandshakeResponse, HandshakeStatus, MasterMessage,
    MidiBuffer, MidiEvent, SampleFormat, SandboxMessage, SlaveMessage, DEFAULT_SERVER_PORT,
    PROTOCOL_VERSION,
};

pub mod transport;
pub use transport::{MessageReader, MessageTransport, MessageWriter};
