//! Test helpers and fixtures for fxgrid integration tests
//!
//! Servers bind an ephemeral loopback port and launch sandboxes on threads
//! of the test process, so no test depends on the server binary.

pub mod tolerances;

use fxgrid::prelude::*;
use fxgrid::server::builtin::BuiltinLoader;
use fxgrid::server::ThreadLauncher;
use fxgrid::RecentsCache;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Default test sample rate
pub const TEST_SAMPLE_RATE: f64 = 48000.0;

/// Standard block size
pub const TEST_BLOCK_SIZE: u32 = 512;

/// Loopback config on an ephemeral port.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        vst_no_standard_folders: true,
        scan_for_plugins: false,
        ..ServerConfig::default()
    }
}

/// Loopback config with sandboxing enabled.
pub fn sandbox_config() -> ServerConfig {
    ServerConfig {
        sandboxing: true,
        ..test_config()
    }
}

pub fn thread_launcher(config: &ServerConfig) -> Arc<ThreadLauncher> {
    Arc::new(ThreadLauncher::new(
        Arc::new(BuiltinLoader),
        Arc::new(RecentsCache::default()),
        config.clone(),
    ))
}

/// Starts a server whose sandboxes run on threads.
pub fn start_server(config: ServerConfig) -> (Arc<SessionServer>, SocketAddr) {
    let launcher = thread_launcher(&config);
    start_server_with(config, launcher)
}

pub fn start_server_with(
    config: ServerConfig,
    launcher: Arc<dyn fxgrid::server::SandboxLauncher>,
) -> (Arc<SessionServer>, SocketAddr) {
    let server = SessionServer::builder(config)
        .launcher(launcher)
        .build()
        .expect("Failed to build test server");
    server.initialize().expect("Failed to initialize test server");
    let addr = server.start().expect("Failed to start test server");
    (server, addr)
}

/// Stereo request at the test rate and block size.
pub fn stereo_request() -> HandshakeRequest {
    HandshakeRequest::new("test-host", TEST_SAMPLE_RATE, TEST_BLOCK_SIZE).channels(2, 2, 0)
}

/// Polls `cond` until it holds or the settle timeout passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + tolerances::SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    false
}

/// The only local session of `server`.
pub fn only_session(server: &SessionServer) -> SessionHandle {
    assert!(
        wait_until(|| server.num_sessions() == 1),
        "expected exactly one session"
    );
    server.sessions().pop().expect("session vanished")
}

/// Block of `channels` x `samples` filled with `value`.
pub fn constant_block(channels: usize, samples: usize, value: f32) -> AudioBlock<f32> {
    AudioBlock::from_channels(vec![vec![value; samples]; channels])
}

/// Peak amplitude of a channel.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}
