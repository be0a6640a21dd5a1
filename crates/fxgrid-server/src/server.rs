//! Session server.
//!
//! Accepts connections, negotiates each session and either hosts it on a
//! local [`SessionWorker`] or hands it to the sandbox for its key. The same
//! type runs inside a sandbox process, where it only serves its master.

use crate::builtin::BuiltinLoader;
use crate::catalog::{FormatScanner, PluginCatalog, PluginScanner, ScanIsolation};
use crate::chain::PluginLoader;
use crate::config::ServerConfig;
use crate::recents::RecentsCache;
use crate::sandbox::{ChildProcessLauncher, SandboxEvents, SandboxLauncher, SandboxMaster, SandboxSlave};
use crate::worker::{SessionHandle, SessionWorker};
use crossbeam_channel::{RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fxgrid_protocol::protocol::{read_frame, write_frame};
use fxgrid_protocol::{
    GridError, HandshakeRequest, HandshakeResponse, PluginDescription, PluginFormat, Result,
    SandboxMessage,
};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Picks the sandbox a session is routed to.
pub type SandboxKeyFn = Arc<dyn Fn(&HandshakeRequest, SocketAddr) -> String + Send + Sync>;

/// One sandbox per client: `host:client_id`.
pub fn default_sandbox_key(request: &HandshakeRequest, _peer: SocketAddr) -> String {
    format!("{}:{}", request.host, request.client_id)
}

/// What this process is, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRole {
    Master,
    Sandbox {
        control_addr: SocketAddr,
        key: String,
        listen_host: String,
    },
}

pub struct SessionServerBuilder {
    config: ServerConfig,
    role: ServerRole,
    loader: Option<Arc<dyn PluginLoader>>,
    scanners: Vec<Arc<dyn FormatScanner>>,
    default_scanners: bool,
    launcher: Option<Arc<dyn SandboxLauncher>>,
    key_fn: Option<SandboxKeyFn>,
    scan_isolation: ScanIsolation,
    recents: Option<Arc<RecentsCache>>,
}

impl SessionServerBuilder {
    pub fn role(mut self, role: ServerRole) -> Self {
        self.role = role;
        self
    }

    /// Loads plugins into chains. Defaults to [`BuiltinLoader`].
    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Adds a scanner next to the built-in and folder scanners.
    pub fn scanner(mut self, scanner: Arc<dyn FormatScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    /// Scans only with the scanners added through [`scanner`](Self::scanner).
    pub fn without_default_scanners(mut self) -> Self {
        self.default_scanners = false;
        self
    }

    /// Starts sandboxes. Defaults to a [`ChildProcessLauncher`] on the
    /// current executable.
    pub fn launcher(mut self, launcher: Arc<dyn SandboxLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn sandbox_key(mut self, key_fn: SandboxKeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn scan_isolation(mut self, isolation: ScanIsolation) -> Self {
        self.scan_isolation = isolation;
        self
    }

    pub fn recents(mut self, recents: Arc<RecentsCache>) -> Self {
        self.recents = Some(recents);
        self
    }

    pub fn build(self) -> Result<Arc<SessionServer>> {
        let catalog = match &self.config.catalog_file {
            Some(path) => PluginCatalog::load(path)?,
            None => PluginCatalog::new(),
        };

        let mut scanner = PluginScanner::new(self.config.clone(), catalog)
            .isolation(self.scan_isolation);
        if self.default_scanners {
            scanner = scanner.with_default_scanners();
        }
        for extra in self.scanners {
            scanner = scanner.with_scanner(extra);
        }

        let launcher: Arc<dyn SandboxLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(ChildProcessLauncher::current_exe(self.config.host.clone())?),
        };
        let recents = self
            .recents
            .unwrap_or_else(|| Arc::new(RecentsCache::new(self.config.recents_max)));

        Ok(Arc::new_cyclic(|me| SessionServer {
            me: me.clone(),
            role: self.role,
            loader: self.loader.unwrap_or_else(|| Arc::new(BuiltinLoader)),
            recents,
            scanner,
            launcher,
            key_fn: self.key_fn.unwrap_or_else(|| Arc::new(default_sandbox_key)),
            sandboxes: DashMap::new(),
            condemned: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
            next_sandbox: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            janitor_stop: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            config: self.config,
        }))
    }
}

pub struct SessionServer {
    me: Weak<SessionServer>,
    config: ServerConfig,
    role: ServerRole,
    loader: Arc<dyn PluginLoader>,
    recents: Arc<RecentsCache>,
    scanner: PluginScanner,
    launcher: Arc<dyn SandboxLauncher>,
    key_fn: SandboxKeyFn,

    sandboxes: DashMap<String, Arc<SandboxMaster>>,
    /// Disconnected sandboxes waiting for [`reap_sandboxes`](Self::reap_sandboxes).
    condemned: Mutex<Vec<Arc<SandboxMaster>>>,
    sessions: Mutex<Vec<SessionHandle>>,
    next_session: AtomicU64,
    next_sandbox: AtomicU64,

    initialized: AtomicBool,
    shutting_down: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    janitor_stop: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionServer {
    pub fn builder(config: ServerConfig) -> SessionServerBuilder {
        SessionServerBuilder {
            config,
            role: ServerRole::Master,
            loader: None,
            scanners: Vec::new(),
            default_scanners: true,
            launcher: None,
            key_fn: None,
            scan_isolation: ScanIsolation::InProcess,
            recents: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn role(&self) -> &ServerRole {
        &self.role
    }

    pub fn recents(&self) -> &Arc<RecentsCache> {
        &self.recents
    }

    pub fn scanner(&self) -> &PluginScanner {
        &self.scanner
    }

    pub fn known_plugins(&self) -> Vec<PluginDescription> {
        self.scanner.known()
    }

    /// Scans at startup when configured to. Only once per server.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(GridError::AlreadyInitialized);
        }
        match &self.role {
            ServerRole::Master => {
                tracing::info!(
                    "Initializing server {} ({}), sandboxing {}",
                    self.config.id,
                    self.config.name,
                    if self.config.sandboxing { "enabled" } else { "disabled" }
                );
                if self.config.scan_for_plugins {
                    let scanned = self.scan_for_plugins(&[]);
                    tracing::info!(
                        "Startup scan added {} candidate(s), {} plugin(s) known",
                        scanned,
                        self.scanner.known().len()
                    );
                }
            }
            ServerRole::Sandbox { key, .. } => {
                tracing::info!("Initializing sandbox {}", key);
            }
        }
        Ok(())
    }

    /// Binds the listening socket. Returns the bound address; binding twice
    /// returns the first address.
    pub fn listen(&self) -> Result<SocketAddr> {
        if let Some(addr) = *self.local_addr.lock() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(self.config.listen_addr()).map_err(|e| {
            GridError::ConnectionFailed(format!("bind {}: {}", self.config.listen_addr(), e))
        })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Runs the role this server was built for until shutdown.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        match &self.role {
            ServerRole::Master => self.run_server(),
            ServerRole::Sandbox { .. } => self.run_sandbox(),
        }
    }

    /// Listens and runs the accept loop on a background thread.
    pub fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self.listen()?;
        let server = Arc::clone(self);
        let accept = thread::Builder::new()
            .name("session-server".to_string())
            .spawn(move || {
                if let Err(e) = server.run_server() {
                    tracing::error!("Session server stopped: {}", e);
                }
            })?;
        self.threads.lock().push(accept);
        Ok(addr)
    }

    /// Accept loop of the master role. Each handshake runs on its own thread.
    pub fn run_server(self: &Arc<Self>) -> Result<()> {
        self.listen()?;
        let listener = self.listener.lock().take().ok_or_else(|| {
            GridError::ProtocolError("session server is already accepting".to_string())
        })?;
        self.spawn_janitor()?;
        tracing::info!("Session server listening on {}", listener.local_addr()?);

        while !self.shutting_down.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name(format!("handshake-{}", peer))
                        .spawn(move || {
                            if let Err(e) = server.handle_connection(stream, peer) {
                                tracing::warn!("Handshake with {} failed: {}", peer, e);
                            }
                        });
                    if let Err(e) = spawned {
                        tracing::error!("Failed to spawn handshake thread: {}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        tracing::info!("Session server stopped accepting");
        Ok(())
    }

    /// Sandbox role: serves the master until it says goodbye or disappears.
    pub fn run_sandbox(self: &Arc<Self>) -> Result<()> {
        let ServerRole::Sandbox {
            control_addr,
            key,
            listen_host,
        } = &self.role
        else {
            return Err(GridError::ProtocolError(
                "run_sandbox called on a master".to_string(),
            ));
        };
        let slave = SandboxSlave::new(
            *control_addr,
            key.clone(),
            listen_host.clone(),
            Arc::clone(&self.loader),
            Arc::clone(&self.recents),
            self.config.clone(),
        );
        slave.run()
    }

    fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.handshake_timeout()))?;
        let request: HandshakeRequest = read_frame(&stream)?;
        tracing::debug!(
            "Handshake from {} ({}): {} in / {} out / {} sc, sandboxing {}",
            peer,
            request.host,
            request.channels_in,
            request.channels_out,
            request.channels_sc,
            request.sandboxing
        );

        if let Err(e) = request.validate() {
            return reject(&stream, peer, rejection_reason(e));
        }
        if request.sandboxing {
            if !self.config.sandboxing {
                return reject(&stream, peer, "sandboxing is disabled on this server".to_string());
            }
            return self.route_to_sandbox(stream, peer, request);
        }
        self.host_locally(stream, peer, request)
    }

    fn host_locally(&self, stream: TcpStream, peer: SocketAddr, request: HandshakeRequest) -> Result<()> {
        let reply = stream.try_clone()?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut worker = SessionWorker::new(id, Arc::clone(&self.loader), Arc::clone(&self.recents))
            .idle_poll(self.config.idle_poll());
        if let Err(e) = worker.init(stream, &request) {
            return reject(&reply, peer, rejection_reason(e));
        }
        write_frame(&reply, &HandshakeResponse::local())?;
        let handle = worker.start()?;
        tracing::info!("Session {} hosted locally for {} ({})", id, request.host, peer);

        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_finished());
        if self.shutting_down.load(Ordering::Acquire) {
            handle.shutdown();
        }
        sessions.push(handle);
        Ok(())
    }

    fn route_to_sandbox(&self, stream: TcpStream, peer: SocketAddr, request: HandshakeRequest) -> Result<()> {
        let key = (self.key_fn)(&request, peer);
        let reply = stream.try_clone()?;
        let master = match self.sandbox_for(&key) {
            Ok(master) => master,
            Err(e) => {
                tracing::error!("Failed to start sandbox {}: {}", key, e);
                return reject(&reply, peer, e.to_string());
            }
        };
        if let Err(e) = master.handoff(request, stream) {
            return reject(&reply, peer, e.to_string());
        }
        tracing::info!("Session from {} handed to sandbox {}", peer, key);
        Ok(())
    }

    /// Returns the live sandbox for `key`, launching one if needed.
    fn sandbox_for(&self, key: &str) -> Result<Arc<SandboxMaster>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GridError::SandboxFailed("server is shutting down".to_string()));
        }
        let events: Weak<dyn SandboxEvents> = self.me.clone();
        match self.sandboxes.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_alive() => Ok(Arc::clone(entry.get())),
            Entry::Occupied(mut entry) => {
                let master = self.spawn_sandbox(key, events)?;
                let dead = entry.insert(Arc::clone(&master));
                self.condemned.lock().push(dead);
                Ok(master)
            }
            Entry::Vacant(entry) => {
                let master = self.spawn_sandbox(key, events)?;
                entry.insert(Arc::clone(&master));
                Ok(master)
            }
        }
    }

    fn spawn_sandbox(&self, key: &str, events: Weak<dyn SandboxEvents>) -> Result<Arc<SandboxMaster>> {
        let id = self.next_sandbox.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Starting sandbox {} for key {}", id, key);
        SandboxMaster::spawn(
            id,
            key,
            self.launcher.as_ref(),
            events,
            self.config.sandbox_connect_timeout(),
        )
    }

    fn spawn_janitor(&self) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        *self.janitor_stop.lock() = Some(stop_tx);
        let server = self.me.clone();
        let interval = self.config.reap_interval();
        let janitor = thread::Builder::new()
            .name("sandbox-janitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match server.upgrade() {
                        Some(server) => {
                            server.reap_sandboxes();
                        }
                        None => break,
                    },
                    _ => break,
                }
            })?;
        self.threads.lock().push(janitor);
        Ok(())
    }

    /// Tears down sandboxes that disconnected. Returns how many were reaped.
    pub fn reap_sandboxes(&self) -> usize {
        let condemned = std::mem::take(&mut *self.condemned.lock());
        let reaped = condemned.len();
        for master in condemned {
            master.shutdown();
            tracing::debug!("Reaped sandbox {} ({})", master.id(), master.key());
        }
        reaped
    }

    pub fn scan_plugin(&self, id: &str, format: PluginFormat) -> bool {
        self.scanner.scan_plugin(id, format)
    }

    pub fn scan_for_plugins(&self, include: &[String]) -> usize {
        self.scanner.scan_for_plugins(include)
    }

    /// Makes sure every plugin in `names` is known, scanning as needed, on a
    /// background thread. `on_done` receives whether all of them are known.
    pub fn add_plugins<F>(self: &Arc<Self>, names: Vec<String>, on_done: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let server = Arc::clone(self);
        thread::Builder::new()
            .name("plugin-scan".to_string())
            .spawn(move || {
                let all_known = names
                    .iter()
                    .fold(true, |ok, name| server.scanner.ensure_known(name) && ok);
                server.scanner.persist();
                on_done(all_known);
            })?;
        Ok(())
    }

    pub fn num_sandboxes(&self) -> usize {
        self.sandboxes.len()
    }

    /// Plugins loaded across all sandboxes, as last reported by each.
    pub fn num_loaded_by_sandboxes(&self) -> u32 {
        self.sandboxes.iter().map(|e| e.value().loaded_count()).sum()
    }

    pub fn sandbox_keys(&self) -> Vec<String> {
        self.sandboxes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn loaded_by_sandbox(&self, key: &str) -> Option<u32> {
        self.sandboxes.get(key).map(|m| m.loaded_count())
    }

    /// Locally hosted sessions that are still running.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_finished());
        sessions.clone()
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Stops accepting, ends every session and sandbox. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down session server");

        drop(self.janitor_stop.lock().take());
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in &sessions {
            session.shutdown();
        }
        for session in &sessions {
            session.join();
        }

        let masters: Vec<_> = self.sandboxes.iter().map(|e| Arc::clone(e.value())).collect();
        self.sandboxes.clear();
        for master in &masters {
            master.shutdown();
        }
        self.reap_sandboxes();
        self.scanner.persist();
    }
}

impl SandboxEvents for SessionServer {
    fn handle_message_from_sandbox(&self, master: &Arc<SandboxMaster>, message: SandboxMessage) {
        match message {
            SandboxMessage::LoadedCount { count } => {
                tracing::debug!("Sandbox {} has {} plugin(s) loaded", master.key(), count);
            }
            SandboxMessage::Custom { kind, payload } => {
                tracing::debug!(
                    "Sandbox {} sent '{}' ({} bytes)",
                    master.key(),
                    kind,
                    payload.len()
                );
            }
        }
    }

    fn handle_disconnect_from_sandbox(&self, master: &Arc<SandboxMaster>) {
        let removed = self
            .sandboxes
            .remove_if(master.key(), |_, current| Arc::ptr_eq(current, master))
            .is_some();
        if removed && !self.shutting_down.load(Ordering::Acquire) {
            tracing::warn!("Sandbox {} disconnected, scheduling cleanup", master.key());
        }
        self.condemned.lock().push(Arc::clone(master));
    }
}

fn rejection_reason(e: GridError) -> String {
    match e {
        GridError::HandshakeRejected(reason) => reason,
        other => other.to_string(),
    }
}

fn reject(stream: &TcpStream, peer: SocketAddr, reason: String) -> Result<()> {
    tracing::warn!("Rejecting session from {}: {}", peer, reason);
    write_frame(stream, &HandshakeResponse::rejected(reason))
}
