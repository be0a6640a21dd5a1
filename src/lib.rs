//! # fxgrid - Remote Audio Effect Processing
//!
//! Stream audio and MIDI to a server that runs it through a chain of effect
//! plugins and sends the processed blocks back.
//!
//! ## Architecture
//!
//! fxgrid is an umbrella crate over:
//! - **fxgrid-protocol** - Chunk codec, handshake, sandbox control channel, streaming client
//! - **fxgrid-server** - Session server, session workers, sandboxes, plugin catalog
//!
//! ## Quick Start
//!
//! ```ignore
//! use fxgrid::prelude::*;
//!
//! // Server
//! let server = SessionServer::builder(ServerConfig::default()).build()?;
//! server.initialize()?;
//! let addr = server.start()?;
//!
//! // Client
//! let request = HandshakeRequest::new("studio", 48000.0, 512).channels(2, 2, 0);
//! let mut client = StreamClient::connect(addr, request)?;
//! let mut block = AudioBlock::<f32>::new(2, 512);
//! client.process(&mut block, &mut MidiBuffer::new())?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Client and server
//! - `server` - Session server, sandboxes and plugin scanning

/// Re-export of fxgrid-protocol for direct access
pub use fxgrid_protocol as protocol;

#[cfg(feature = "server")]
/// Re-export of fxgrid-server for direct access
pub use fxgrid_server as server;

// Wire types and client
pub use fxgrid_protocol::{
    ActiveChannels, AudioBlock, ChunkHeader, GridError, HandshakeRequest, HandshakeResponse,
    HandshakeStatus, MidiBuffer, MidiEvent, PluginDescription, PluginFormat, Result, Sample,
    SampleFormat, StreamClient, DEFAULT_SERVER_PORT, PROTOCOL_VERSION,
};

// Server side
#[cfg(feature = "server")]
pub use fxgrid_server::{
    EffectChain, EffectProcessor, PluginLoader, RecentsCache, ServerConfig, ServerRole,
    SessionHandle, SessionServer, SessionWorker,
};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{
        ActiveChannels, AudioBlock, GridError, HandshakeRequest, MidiBuffer, MidiEvent,
        PluginDescription, Result, SampleFormat, StreamClient,
    };

    #[cfg(feature = "server")]
    pub use crate::{ServerConfig, SessionHandle, SessionServer};
}
