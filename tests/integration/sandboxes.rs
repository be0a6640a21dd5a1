//! Sandbox handoff, crash cleanup and loaded-plugin counters.

use crate::helpers::*;
use fxgrid::prelude::*;
use fxgrid::protocol::protocol::{read_frame, write_frame};
use fxgrid::protocol::{MasterMessage, SlaveMessage};
use fxgrid::server::{SandboxLauncher, ThreadLauncher};
use std::net::{SocketAddr, TcpStream};
use std::process::Child;
use std::sync::Arc;
use std::thread;

fn sandboxed(client_id: u64) -> HandshakeRequest {
    stereo_request().client_id(client_id).sandboxed(true)
}

#[test]
fn test_sandboxed_session_streams() {
    let (server, addr) = start_server(sandbox_config());
    let mut client = StreamClient::connect(addr, sandboxed(1)).unwrap();
    assert!(client.sandbox_port().is_some());
    assert_eq!(server.num_sandboxes(), 1);
    // Sandboxed sessions do not run in the server.
    assert_eq!(server.num_sessions(), 0);

    let mut midi = MidiBuffer::new();
    for _ in 0..10 {
        let mut block = AudioBlock::<f32>::new(2, TEST_BLOCK_SIZE as usize);
        client.process(&mut block, &mut midi).unwrap();
        assert_eq!(block.num_samples(), TEST_BLOCK_SIZE as usize);
        assert!(block.is_silent());
    }
    server.shutdown();
}

#[test]
fn test_loaded_counts_per_sandbox() {
    let config = sandbox_config();
    let launcher = thread_launcher(&config);
    let (server, addr) = start_server_with(config, launcher.clone());

    let _a = StreamClient::connect(addr, sandboxed(1)).unwrap();
    let _b = StreamClient::connect(addr, sandboxed(2)).unwrap();
    assert_eq!(server.num_sandboxes(), 2);

    let slaves = launcher.slaves();
    assert_eq!(slaves.len(), 2);
    assert!(wait_until(|| slaves.iter().all(|s| s.num_sessions() == 1)));
    for (slave, plugins) in slaves.iter().zip([1, 2]) {
        let session = slave.sessions().pop().unwrap();
        for _ in 0..plugins {
            session.add_plugin("builtin:passthrough").unwrap();
        }
    }

    assert!(wait_until(|| server.num_loaded_by_sandboxes() == 3));
    let mut counts: Vec<_> = server
        .sandbox_keys()
        .iter()
        .filter_map(|key| server.loaded_by_sandbox(key))
        .collect();
    counts.sort();
    assert_eq!(counts, vec![1, 2]);
    server.shutdown();
}

/// Sandboxes for client 666 die on their first handoff; all others run on
/// threads.
struct CrashOnHandoff {
    healthy: ThreadLauncher,
}

impl SandboxLauncher for CrashOnHandoff {
    fn launch(&self, key: &str, control_addr: SocketAddr) -> fxgrid::Result<Option<Child>> {
        if !key.ends_with(":666") {
            return self.healthy.launch(key, control_addr);
        }
        thread::spawn(move || {
            let stream = TcpStream::connect(control_addr).unwrap();
            write_frame(&stream, &SlaveMessage::Ready { pid: 666 }).unwrap();
            let _: MasterMessage = read_frame(&stream).unwrap();
        });
        Ok(None)
    }
}

#[test]
fn test_crashed_sandbox_reaped_others_unaffected() {
    let config = fxgrid::ServerConfig {
        reap_interval_ms: 60_000,
        ..sandbox_config()
    };
    let launcher = Arc::new(CrashOnHandoff {
        healthy: ThreadLauncher::new(
            Arc::new(fxgrid::server::builtin::BuiltinLoader),
            Arc::new(fxgrid::RecentsCache::default()),
            config.clone(),
        ),
    });
    let (server, addr) = start_server_with(config, launcher.clone());

    let mut survivor = StreamClient::connect(addr, sandboxed(1)).unwrap();
    let slave = launcher.healthy.slaves().pop().unwrap();
    assert!(wait_until(|| slave.num_sessions() == 1));
    slave
        .sessions()
        .pop()
        .unwrap()
        .add_plugin("builtin:passthrough")
        .unwrap();
    assert!(wait_until(|| server.num_loaded_by_sandboxes() == 1));

    match StreamClient::connect(addr, sandboxed(666)) {
        Err(GridError::HandshakeRejected(reason)) => assert!(reason.contains("terminated")),
        Err(other) => panic!("Expected rejection, got {:?}", other),
        Ok(_) => panic!("Expected rejection"),
    }

    assert!(wait_until(|| server.num_sandboxes() == 1));
    assert_eq!(server.reap_sandboxes(), 1);
    assert_eq!(server.reap_sandboxes(), 0);
    assert_eq!(server.sandbox_keys(), vec!["test-host:1"]);
    assert_eq!(server.num_loaded_by_sandboxes(), 1);

    let mut block = constant_block(2, 64, 0.5);
    survivor.process(&mut block, &mut MidiBuffer::new()).unwrap();
    assert_eq!(block.channel(1)[63], 0.5);
    server.shutdown();
}
