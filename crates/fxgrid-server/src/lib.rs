//! Session server for fxgrid
//!
//! This crate hosts the server side of remote effect processing. A
//! [`SessionServer`] accepts client connections, negotiates each session and
//! runs it on a [`SessionWorker`] thread that streams audio and MIDI through an
//! [`EffectChain`]. Sessions that ask for isolation are handed to a sandbox
//! process supervised by a [`SandboxMaster`], so a crashing plugin only takes
//! its own sandbox down.
//!
//! Plugin hosting engines plug in through [`PluginLoader`] and
//! [`FormatScanner`]; the built-in processors in [`builtin`] need neither.
//!
//! ## Usage
//!
//! ```ignore
//! use fxgrid_server::{ServerConfig, SessionServer};
//!
//! let server = SessionServer::builder(ServerConfig::default()).build()?;
//! server.initialize()?;
//! server.run()?;
//! ```

pub mod builtin;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod recents;
pub mod sandbox;
pub mod server;
pub mod worker;

pub use catalog::{FolderScanner, FormatScanner, PluginCatalog, PluginScanner, ScanIsolation};
pub use chain::{
    ActiveChannelMapper, ChannelMapper, EffectChain, EffectProcessor, PluginLoader,
    ProcessingLayout, ProcessorChain,
};
pub use config::ServerConfig;
pub use recents::RecentsCache;
pub use sandbox::{
    ChildProcessLauncher, SandboxEvents, SandboxLauncher, SandboxMaster, SandboxSlave,
    ThreadLauncher, EXIT_MASTER_LOST,
};
pub use server::{default_sandbox_key, SandboxKeyFn, ServerRole, SessionServer, SessionServerBuilder};
pub use worker::{ChainObserver, ChainSnapshot, SessionHandle, SessionWorker, WorkerState};

// Re-export shared types from fxgrid-protocol
pub use fxgrid_protocol::{
    AudioBlock, GridError, HandshakeRequest, HandshakeResponse, HandshakeStatus, MidiBuffer,
    MidiEvent, PluginDescription, PluginFormat, Result, Sample, SampleFormat, StreamClient,
};
