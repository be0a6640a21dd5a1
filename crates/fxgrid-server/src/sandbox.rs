//! Sandboxed sessions.
//!
//! A [`SandboxMaster`] lives in the server and supervises one sandbox: it
//! listens on a loopback port for the sandbox's control connection, forwards
//! session handoffs, and reports messages and disconnects to its owner. The
//! sandbox side is a [`SandboxSlave`]; for every handoff it opens a streaming
//! port, the server redirects the client there, and from then on the session
//! runs in the sandbox exactly as it would locally.
//!
//! Each master runs its control channel on a dedicated thread with a
//! single-threaded tokio runtime.

use crate::chain::PluginLoader;
use crate::config::ServerConfig;
use crate::recents::RecentsCache;
use crate::worker::{SessionHandle, SessionWorker};
use fxgrid_protocol::protocol::write_frame;
use fxgrid_protocol::{
    GridError, HandshakeRequest, HandshakeResponse, MasterMessage, MessageTransport, Result,
    SandboxMessage, SlaveMessage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Exit code of a sandbox that lost its master.
pub const EXIT_MASTER_LOST: i32 = 3;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Starts the process (or thread) hosting a sandbox.
pub trait SandboxLauncher: Send + Sync {
    /// The sandbox must connect to `control_addr`. Returns the child process
    /// when there is one to supervise.
    fn launch(&self, key: &str, control_addr: SocketAddr) -> Result<Option<Child>>;
}

/// Runs each sandbox as a child process of the server binary.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    exe: PathBuf,
    listen_host: String,
    config_path: Option<PathBuf>,
}

impl ChildProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>, listen_host: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            listen_host: listen_host.into(),
            config_path: None,
        }
    }

    /// Launches the running executable.
    pub fn current_exe(listen_host: impl Into<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, listen_host))
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

impl SandboxLauncher for ChildProcessLauncher {
    fn launch(&self, key: &str, control_addr: SocketAddr) -> Result<Option<Child>> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("sandbox")
            .arg("--control-addr")
            .arg(control_addr.to_string())
            .arg("--key")
            .arg(key)
            .arg("--listen-host")
            .arg(&self.listen_host);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        let child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| GridError::SandboxFailed(format!("failed to launch sandbox: {}", e)))?;
        tracing::info!("Launched sandbox {} (pid {})", key, child.id());
        Ok(Some(child))
    }
}

/// Runs each sandbox on a thread of the current process.
///
/// Sessions still go through the full handoff, but a crashing plugin takes the
/// whole process down.
pub struct ThreadLauncher {
    loader: Arc<dyn PluginLoader>,
    recents: Arc<RecentsCache>,
    config: ServerConfig,
    listen_host: String,
    launched: Mutex<Vec<Arc<SandboxSlave>>>,
}

impl ThreadLauncher {
    pub fn new(
        loader: Arc<dyn PluginLoader>,
        recents: Arc<RecentsCache>,
        config: ServerConfig,
    ) -> Self {
        Self {
            loader,
            recents,
            config,
            listen_host: "127.0.0.1".to_string(),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Every sandbox launched so far.
    pub fn slaves(&self) -> Vec<Arc<SandboxSlave>> {
        self.launched.lock().clone()
    }
}

impl SandboxLauncher for ThreadLauncher {
    fn launch(&self, key: &str, control_addr: SocketAddr) -> Result<Option<Child>> {
        let slave = SandboxSlave::new(
            control_addr,
            key,
            self.listen_host.clone(),
            Arc::clone(&self.loader),
            Arc::clone(&self.recents),
            self.config.clone(),
        );
        self.launched.lock().push(Arc::clone(&slave));
        thread::Builder::new()
            .name(format!("sandbox-{}", key))
            .spawn(move || {
                if let Err(e) = slave.run() {
                    tracing::warn!("Sandbox {} ended: {}", slave.key(), e);
                }
            })?;
        Ok(None)
    }
}

/// Receives what a sandbox reports to the server.
pub trait SandboxEvents: Send + Sync {
    fn handle_message_from_sandbox(&self, master: &Arc<SandboxMaster>, message: SandboxMessage);

    /// Called from the master's own thread; must not tear the master down.
    fn handle_disconnect_from_sandbox(&self, master: &Arc<SandboxMaster>);
}

/// Server-side proxy of one sandbox.
pub struct SandboxMaster {
    id: u64,
    key: String,
    outbound: mpsc::UnboundedSender<MasterMessage>,
    pending: Mutex<HashMap<u64, TcpStream>>,
    next_handoff: AtomicU64,
    loaded: AtomicU32,
    pid: AtomicU32,
    connected: AtomicBool,
    closed: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_signal: Notify,
    child: Mutex<Option<Child>>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SandboxMaster {
    /// Opens the control port, launches the sandbox and starts the pump thread.
    pub fn spawn(
        id: u64,
        key: &str,
        launcher: &dyn SandboxLauncher,
        events: Weak<dyn SandboxEvents>,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let control_addr = listener.local_addr()?;

        let child = launcher.launch(key, control_addr)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let master = Arc::new(Self {
            id,
            key: key.to_string(),
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            next_handoff: AtomicU64::new(1),
            loaded: AtomicU32::new(0),
            pid: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            child: Mutex::new(child),
            pump: Mutex::new(None),
        });

        let pump_master = Arc::clone(&master);
        let pump = thread::Builder::new()
            .name(format!("sandbox-master-{}", id))
            .spawn(move || {
                let result = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(pump_master.pump(listener, rx, connect_timeout, &events)),
                    Err(e) => Err(GridError::Io(e)),
                };
                if let Err(e) = result {
                    if !pump_master.shutdown_requested.load(Ordering::Acquire) {
                        tracing::warn!("Sandbox {} control channel failed: {}", pump_master.key, e);
                    }
                }
                pump_master.finish(&events);
            });
        match pump {
            Ok(handle) => *master.pump.lock() = Some(handle),
            Err(e) => {
                master.kill_child();
                return Err(GridError::SandboxFailed(format!(
                    "failed to start sandbox pump: {}",
                    e
                )));
            }
        }
        Ok(master)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Process id the sandbox reported, 0 until it connected.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn loaded_count(&self) -> u32 {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Hands a negotiated session to the sandbox. The client connection is
    /// answered with the sandbox port once the sandbox accepted, or rejected.
    pub fn handoff(&self, request: HandshakeRequest, client: TcpStream) -> Result<()> {
        if !self.is_alive() {
            return Err(GridError::SandboxFailed(format!(
                "sandbox {} is gone",
                self.key
            )));
        }
        let handoff_id = self.next_handoff.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(handoff_id, client);
        if self
            .outbound
            .send(MasterMessage::Handoff {
                handoff_id,
                request,
            })
            .is_err()
        {
            self.pending.lock().remove(&handoff_id);
            return Err(GridError::SandboxFailed(format!(
                "sandbox {} is gone",
                self.key
            )));
        }
        tracing::debug!("Handoff {} queued for sandbox {}", handoff_id, self.key);
        Ok(())
    }

    pub fn send(&self, message: SandboxMessage) -> Result<()> {
        self.outbound
            .send(MasterMessage::Application(message))
            .map_err(|_| GridError::SandboxFailed(format!("sandbox {} is gone", self.key)))
    }

    /// Asks the sandbox to exit and waits for the pump thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Shutting down sandbox {}", self.key);
        self.shutdown_signal.notify_one();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if pump.thread().id() != thread::current().id() {
                let _ = pump.join();
            }
        }
    }

    async fn pump(
        self: &Arc<Self>,
        listener: TcpListener,
        mut outbound: mpsc::UnboundedReceiver<MasterMessage>,
        connect_timeout: Duration,
        events: &Weak<dyn SandboxEvents>,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let accepted = tokio::select! {
            accepted = tokio::time::timeout(connect_timeout, listener.accept()) => accepted,
            _ = self.shutdown_signal.notified() => return Ok(()),
        };
        let (stream, _) = accepted.map_err(|_| GridError::Timeout {
            operation: format!("sandbox {} connect", self.key),
            duration_ms: connect_timeout.as_millis() as u64,
        })??;
        drop(listener);
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = MessageTransport::new(stream).split();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                let msg = reader.recv_slave_message().await;
                let failed = msg.is_err();
                if inbound_tx.send(msg).is_err() || failed {
                    break;
                }
            }
        });

        let result = loop {
            tokio::select! {
                _ = self.shutdown_signal.notified() => {
                    let _ = writer.send_master_message(&MasterMessage::Shutdown).await;
                    break Ok(());
                }
                msg = outbound.recv(), if self.is_connected() => match msg {
                    Some(msg) => {
                        if let Err(e) = writer.send_master_message(&msg).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                msg = inbound.recv() => match msg {
                    Some(Ok(msg)) => self.handle_slave_message(msg, events),
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }
        };
        reader_task.abort();
        result
    }

    fn handle_slave_message(self: &Arc<Self>, msg: SlaveMessage, events: &Weak<dyn SandboxEvents>) {
        match msg {
            SlaveMessage::Ready { pid } => {
                self.pid.store(pid, Ordering::Release);
                self.connected.store(true, Ordering::Release);
                tracing::info!("Sandbox {} ready (pid {})", self.key, pid);
            }
            SlaveMessage::HandoffAccepted { handoff_id, port } => {
                self.answer(handoff_id, HandshakeResponse::sandbox(port));
            }
            SlaveMessage::HandoffFailed {
                handoff_id,
                message,
            } => {
                tracing::warn!("Sandbox {} refused handoff {}: {}", self.key, handoff_id, message);
                self.answer(handoff_id, HandshakeResponse::rejected(message));
            }
            SlaveMessage::Application(message) => {
                if let SandboxMessage::LoadedCount { count } = &message {
                    self.loaded.store(*count, Ordering::Release);
                }
                if let Some(events) = events.upgrade() {
                    events.handle_message_from_sandbox(self, message);
                }
            }
        }
    }

    fn answer(&self, handoff_id: u64, response: HandshakeResponse) {
        let Some(client) = self.pending.lock().remove(&handoff_id) else {
            tracing::warn!("Sandbox {} answered unknown handoff {}", self.key, handoff_id);
            return;
        };
        if let Err(e) = write_frame(&client, &response) {
            tracing::debug!("Client of handoff {} went away: {}", handoff_id, e);
        }
    }

    fn finish(self: &Arc<Self>, events: &Weak<dyn SandboxEvents>) {
        self.connected.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, client) in pending {
            let _ = write_frame(&client, &HandshakeResponse::rejected("sandbox terminated"));
        }
        self.kill_child();

        if self.shutdown_requested.load(Ordering::Acquire) {
            tracing::info!("Sandbox {} stopped", self.key);
        } else {
            tracing::error!("Sandbox {} disconnected", self.key);
        }
        if let Some(events) = events.upgrade() {
            events.handle_disconnect_from_sandbox(self);
        }
    }

    fn kill_child(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                tracing::error!("Sandbox {} exited with {}", self.key, status);
            }
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Drop for SandboxMaster {
    fn drop(&mut self) {
        self.kill_child();
    }
}

/// Sandbox side of the control channel.
pub struct SandboxSlave {
    control_addr: SocketAddr,
    key: String,
    listen_host: String,
    loader: Arc<dyn PluginLoader>,
    recents: Arc<RecentsCache>,
    config: ServerConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<SlaveMessage>>>,
    sessions: Mutex<Vec<SessionHandle>>,
    chain_sizes: Mutex<HashMap<u64, usize>>,
    next_session: AtomicU64,
}

impl SandboxSlave {
    pub fn new(
        control_addr: SocketAddr,
        key: impl Into<String>,
        listen_host: impl Into<String>,
        loader: Arc<dyn PluginLoader>,
        recents: Arc<RecentsCache>,
        config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            control_addr,
            key: key.into(),
            listen_host: listen_host.into(),
            loader,
            recents,
            config,
            outbound: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            chain_sizes: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn num_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_finished());
        sessions.len()
    }

    /// Serves the master until it sends `Shutdown` (`Ok`) or goes away
    /// ([`GridError::MasterDisconnected`]). Every session ends with it.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    async fn serve(self: &Arc<Self>) -> Result<()> {
        let transport = MessageTransport::connect(self.control_addr).await?;
        let (mut reader, mut writer) = transport.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<SlaveMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.send_slave_message(&msg).await.is_err() {
                    break;
                }
            }
        });
        *self.outbound.lock() = Some(tx);
        self.handle_connected_to_master();
        self.send(SlaveMessage::Ready {
            pid: std::process::id(),
        });

        let result = loop {
            match reader.recv_master_message().await {
                Ok(MasterMessage::Shutdown) => {
                    tracing::info!("Sandbox {} shutting down", self.key);
                    self.shutdown_sessions();
                    break Ok(());
                }
                Ok(msg) => self.handle_message_from_master(msg),
                Err(e) => {
                    self.handle_disconnected_from_master(&e);
                    break Err(GridError::MasterDisconnected);
                }
            }
        };

        *self.outbound.lock() = None;
        let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;
        result
    }

    pub fn handle_connected_to_master(&self) {
        tracing::info!(
            "Sandbox {} connected to master at {}",
            self.key,
            self.control_addr
        );
    }

    pub fn handle_disconnected_from_master(&self, error: &GridError) {
        tracing::error!("Sandbox {} lost its master: {}", self.key, error);
        self.shutdown_sessions();
    }

    pub fn handle_message_from_master(self: &Arc<Self>, msg: MasterMessage) {
        match msg {
            MasterMessage::Handoff {
                handoff_id,
                request,
            } => match self.accept_handoff(request) {
                Ok(port) => {
                    tracing::debug!("Sandbox {} serves handoff {} on port {}", self.key, handoff_id, port);
                    self.send(SlaveMessage::HandoffAccepted { handoff_id, port });
                }
                Err(e) => {
                    tracing::warn!("Sandbox {} failed handoff {}: {}", self.key, handoff_id, e);
                    self.send(SlaveMessage::HandoffFailed {
                        handoff_id,
                        message: e.to_string(),
                    });
                }
            },
            MasterMessage::Application(message) => {
                tracing::debug!("Sandbox {} received {:?}", self.key, message);
            }
            MasterMessage::Shutdown => self.shutdown_sessions(),
        }
    }

    fn send(&self, msg: SlaveMessage) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Opens a streaming port and waits for the redirected client on its own
    /// thread.
    fn accept_handoff(self: &Arc<Self>, request: HandshakeRequest) -> Result<u16> {
        request.validate()?;
        let listener = TcpListener::bind((self.listen_host.as_str(), 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let slave = Arc::clone(self);
        let timeout = self.config.sandbox_accept_timeout();
        thread::Builder::new()
            .name(format!("sandbox-accept-{}", port))
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                loop {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            tracing::debug!("Sandbox {} accepted {} on port {}", slave.key, addr, port);
                            if let Err(e) = slave.start_session(stream, &request) {
                                tracing::warn!("Sandbox {} could not start session: {}", slave.key, e);
                            }
                            return;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            if Instant::now() >= deadline {
                                tracing::warn!("Sandbox {}: client never connected to port {}", slave.key, port);
                                return;
                            }
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            tracing::warn!("Sandbox {} accept failed: {}", slave.key, e);
                            return;
                        }
                    }
                }
            })?;
        Ok(port)
    }

    fn start_session(self: &Arc<Self>, stream: TcpStream, request: &HandshakeRequest) -> Result<()> {
        stream.set_nonblocking(false)?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let mut worker = SessionWorker::new(id, Arc::clone(&self.loader), Arc::clone(&self.recents))
            .idle_poll(self.config.idle_poll())
            .observer(Arc::new(move |session, size| {
                if let Some(slave) = weak.upgrade() {
                    slave.chain_changed(session, size);
                }
            }));
        worker.init(stream, request)?;
        let handle = worker.start()?;

        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_finished());
        sessions.push(handle);
        Ok(())
    }

    fn chain_changed(&self, session: u64, size: usize) {
        let total = {
            let mut sizes = self.chain_sizes.lock();
            if size == 0 {
                sizes.remove(&session);
            } else {
                sizes.insert(session, size);
            }
            sizes.values().sum::<usize>()
        };
        self.send(SlaveMessage::Application(SandboxMessage::LoadedCount {
            count: total as u32,
        }));
    }

    /// Live sessions of this sandbox.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_finished());
        sessions.clone()
    }

    fn shutdown_sessions(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in &sessions {
            session.shutdown();
        }
        for session in &sessions {
            session.join();
        }
    }
}
