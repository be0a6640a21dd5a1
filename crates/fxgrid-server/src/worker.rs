//! Session worker - one streaming connection end to end.
//!
//! The worker owns the socket on its own thread: it reads a chunk header,
//! reads the payload into the live precision buffer, maps channels, runs the
//! chain, and writes the mirrored response. Chain edits arrive as tasks on a
//! channel and run on the worker thread between blocks, so the chain is never
//! locked while processing.
//!
//! An idle connection is polled with a short read timeout. A timeout at a
//! header boundary is an idle boundary where queued tasks run; a timeout in
//! the middle of a chunk just keeps waiting.

use crate::chain::{
    ActiveChannelMapper, ChainSample, ChannelMapper, EffectChain, PluginLoader, ProcessingLayout,
    ProcessorChain,
};
use crate::recents::RecentsCache;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use fxgrid_protocol::chunk::{read_chunk_payload, write_chunk};
use fxgrid_protocol::{
    AudioBlock, ChunkHeader, GridError, HandshakeRequest, MidiBuffer, PluginDescription, Result,
    SampleFormat,
};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

/// Called with `(session_id, chain_size)` whenever a session's chain changes.
pub type ChainObserver = Arc<dyn Fn(u64, usize) + Send + Sync>;

const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    AwaitingHeader = 1,
    ReadingPayload = 2,
    Processing = 3,
    WritingResponse = 4,
    ShuttingDown = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::AwaitingHeader,
            2 => WorkerState::ReadingPayload,
            3 => WorkerState::Processing,
            4 => WorkerState::WritingResponse,
            5 => WorkerState::ShuttingDown,
            _ => WorkerState::Created,
        }
    }
}

/// Chain state readable without a round trip to the worker thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainSnapshot {
    pub processors: Vec<PluginDescription>,
    pub latency_samples: usize,
    pub sidechain_disabled: bool,
}

impl ChainSnapshot {
    fn capture(chain: &dyn EffectChain) -> Self {
        Self {
            processors: (0..chain.size())
                .filter_map(|i| chain.processor(i).map(|p| p.description().clone()))
                .collect(),
            latency_samples: chain.latency_samples(),
            sidechain_disabled: chain.is_sidechain_disabled(),
        }
    }
}

type Reply<T> = Sender<std::result::Result<T, String>>;

enum WorkerTask {
    AddPlugin { id: String, reply: Reply<()> },
    DelPlugin { index: usize, reply: Reply<()> },
    ExchangePlugins { a: usize, b: usize, reply: Reply<()> },
    Clear { reply: Reply<()> },
    Update { reply: Reply<()> },
    ParameterValue { index: usize, param: usize, reply: Reply<f32> },
}

struct WorkerShared {
    id: u64,
    tasks: Sender<WorkerTask>,
    snapshot: ArcSwap<ChainSnapshot>,
    request: OnceLock<HandshakeRequest>,
    stream: Mutex<Option<TcpStream>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    recents: Arc<RecentsCache>,
    state: AtomicU8,
    shutdown: AtomicBool,
    finished: AtomicBool,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Shutting down session {}", self.id);
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

enum ProcBuffers {
    Single(SessionBuffers<f32>),
    Double(SessionBuffers<f64>),
}

/// Client-layout block as read from the wire, plus the dense block the chain sees.
struct SessionBuffers<T> {
    client: AudioBlock<T>,
    dense: AudioBlock<T>,
}

impl<T: ChainSample> SessionBuffers<T> {
    fn new(channels: usize, dense_channels: usize, block_size: usize) -> Self {
        Self {
            client: AudioBlock::new(channels, block_size),
            dense: AudioBlock::new(dense_channels, block_size),
        }
    }

    fn process(
        &mut self,
        mapper: &ActiveChannelMapper,
        chain: &mut dyn EffectChain,
        midi: &mut MidiBuffer,
    ) {
        mapper.map_to_dense(&self.client, &mut self.dense);
        T::process_chain(chain, &mut self.dense, midi);
        mapper.map_from_dense(&self.dense, &mut self.client);
    }
}

struct Session {
    stream: TcpStream,
    request: HandshakeRequest,
    layout: ProcessingLayout,
    mapper: ActiveChannelMapper,
    buffers: ProcBuffers,
    chain: Box<dyn EffectChain>,
    midi: MidiBuffer,
    scratch: Vec<u8>,
}

enum HeaderRead {
    Complete,
    Idle,
    Closed,
}

/// Blocking reads that sit through poll timeouts until the data arrives or
/// the session is shut down.
struct PatientReader<'a> {
    stream: &'a TcpStream,
    shutdown: &'a AtomicBool,
}

impl Read for PatientReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&*self.stream).read(buf) {
                Err(e) if is_poll_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "session shut down",
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub struct SessionWorker {
    shared: Arc<WorkerShared>,
    tasks: Receiver<WorkerTask>,
    loader: Arc<dyn PluginLoader>,
    observer: Option<ChainObserver>,
    chain: Option<Box<dyn EffectChain>>,
    idle_poll: Duration,
    session: Option<Session>,
}

impl SessionWorker {
    pub fn new(id: u64, loader: Arc<dyn PluginLoader>, recents: Arc<RecentsCache>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(WorkerShared {
                id,
                tasks: tx,
                snapshot: ArcSwap::from_pointee(ChainSnapshot::default()),
                request: OnceLock::new(),
                stream: Mutex::new(None),
                thread: Mutex::new(None),
                recents,
                state: AtomicU8::new(WorkerState::Created as u8),
                shutdown: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
            tasks: rx,
            loader,
            observer: None,
            chain: None,
            idle_poll: DEFAULT_IDLE_POLL,
            session: None,
        }
    }

    /// Read timeout at which queued tasks run while no audio arrives.
    pub fn idle_poll(mut self, interval: Duration) -> Self {
        self.idle_poll = interval.max(Duration::from_millis(1));
        self
    }

    pub fn observer(mut self, observer: ChainObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the default [`ProcessorChain`].
    pub fn with_chain(mut self, chain: Box<dyn EffectChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Binds the connection and fixes the session parameters. Only once.
    pub fn init(&mut self, stream: TcpStream, request: &HandshakeRequest) -> Result<()> {
        if self.session.is_some() || self.shared.request.get().is_some() {
            return Err(GridError::AlreadyInitialized);
        }
        request.validate()?;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.idle_poll))?;
        *self.shared.stream.lock() = Some(stream.try_clone()?);

        let layout = ProcessingLayout::from_request(request);
        let mapper = ActiveChannelMapper::from_request(request);
        let channels = request.buffer_channels();
        let block_size = request.block_size as usize;
        let buffers = match request.sample_format {
            SampleFormat::Float32 => ProcBuffers::Single(SessionBuffers::new(
                channels,
                mapper.dense_channels(),
                block_size,
            )),
            SampleFormat::Float64 => ProcBuffers::Double(SessionBuffers::new(
                channels,
                mapper.dense_channels(),
                block_size,
            )),
        };
        let chain = self
            .chain
            .take()
            .unwrap_or_else(|| Box::new(ProcessorChain::new(layout)));

        let _ = self.shared.request.set(request.clone());
        self.session = Some(Session {
            stream,
            request: request.clone(),
            layout,
            mapper,
            buffers,
            chain,
            midi: MidiBuffer::new(),
            scratch: Vec::with_capacity(channels * block_size * request.sample_format.width()),
        });

        tracing::debug!(
            "Session {} initialized: {} in / {} out / {} sc, {} Hz, block {}, {:?}",
            self.shared.id,
            request.channels_in,
            request.channels_out,
            request.channels_sc,
            request.sample_rate,
            request.block_size,
            request.sample_format
        );
        Ok(())
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Empties the chain of a worker that is not running yet.
    pub fn clear(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.chain.clear();
            Self::publish(&self.shared, self.observer.as_ref(), session.chain.as_ref());
        }
    }

    /// Spawns the worker thread.
    pub fn start(self) -> Result<SessionHandle> {
        let handle = self.handle();
        let id = self.shared.id;
        let thread = thread::Builder::new()
            .name(format!("session-worker-{}", id))
            .spawn(move || {
                let _ = self.run();
            })?;
        *handle.shared.thread.lock() = Some(thread);
        Ok(handle)
    }

    /// Streams until the client disconnects, the session fails or
    /// [`shutdown`](Self::shutdown) is called. Disconnects and shutdowns are
    /// `Ok`; malformed chunks and I/O failures are returned.
    pub fn run(mut self) -> Result<()> {
        let mut session = self.session.take().ok_or_else(|| {
            GridError::ProtocolError("session worker run before init".to_string())
        })?;
        let id = self.shared.id;
        tracing::info!("Session {} started for {}", id, session.request.host);

        let result = self.stream_blocks(&mut session);

        self.shared.set_state(WorkerState::ShuttingDown);
        let _ = session.stream.shutdown(Shutdown::Both);
        if session.chain.size() > 0 {
            session.chain.clear();
            Self::publish(&self.shared, self.observer.as_ref(), session.chain.as_ref());
        }
        self.shared.finished.store(true, Ordering::Release);

        match result {
            Err(e) if self.shared.is_shutting_down() || e.is_disconnect() => {
                tracing::info!("Session {} closed", id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Session {} terminated: {}", id, e);
                Err(e)
            }
            Ok(()) => {
                tracing::info!("Session {} closed", id);
                Ok(())
            }
        }
    }

    fn stream_blocks(&self, session: &mut Session) -> Result<()> {
        let mut header_bytes = [0u8; ChunkHeader::SIZE];
        let channels = session.request.buffer_channels();
        let max_samples = session.request.block_size as usize;
        let format = session.request.sample_format;

        loop {
            if self.shared.is_shutting_down() {
                return Ok(());
            }
            self.shared.set_state(WorkerState::AwaitingHeader);
            match self.read_header(&session.stream, &mut header_bytes)? {
                HeaderRead::Idle => {
                    self.run_tasks(session);
                    continue;
                }
                HeaderRead::Closed => return Ok(()),
                HeaderRead::Complete => {}
            }

            let header = ChunkHeader::decode(&header_bytes)?;
            header.validate(channels, max_samples, format)?;

            self.shared.set_state(WorkerState::ReadingPayload);
            let reader = PatientReader {
                stream: &session.stream,
                shutdown: &self.shared.shutdown,
            };
            match &mut session.buffers {
                ProcBuffers::Single(b) => read_chunk_payload(
                    reader,
                    &header,
                    &mut b.client,
                    &mut session.midi,
                    &mut session.scratch,
                )?,
                ProcBuffers::Double(b) => read_chunk_payload(
                    reader,
                    &header,
                    &mut b.client,
                    &mut session.midi,
                    &mut session.scratch,
                )?,
            }

            self.run_tasks(session);

            self.shared.set_state(WorkerState::Processing);
            match &mut session.buffers {
                ProcBuffers::Single(b) => {
                    b.process(&session.mapper, session.chain.as_mut(), &mut session.midi)
                }
                ProcBuffers::Double(b) => {
                    b.process(&session.mapper, session.chain.as_mut(), &mut session.midi)
                }
            }

            self.shared.set_state(WorkerState::WritingResponse);
            match &session.buffers {
                ProcBuffers::Single(b) => {
                    write_chunk(&session.stream, &b.client, &session.midi, &mut session.scratch)?
                }
                ProcBuffers::Double(b) => {
                    write_chunk(&session.stream, &b.client, &session.midi, &mut session.scratch)?
                }
            }
        }
    }

    fn read_header(&self, stream: &TcpStream, buf: &mut [u8]) -> Result<HeaderRead> {
        let first = loop {
            match (&*stream).read(buf) {
                Ok(0) => return Ok(HeaderRead::Closed),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_poll_timeout(&e) => {
                    return Ok(if self.shared.is_shutting_down() {
                        HeaderRead::Closed
                    } else {
                        HeaderRead::Idle
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };
        PatientReader {
            stream,
            shutdown: &self.shared.shutdown,
        }
        .read_exact(&mut buf[first..])?;
        Ok(HeaderRead::Complete)
    }

    fn run_tasks(&self, session: &mut Session) {
        let mut changed = false;
        while let Ok(task) = self.tasks.try_recv() {
            changed |= self.run_task(session, task);
        }
        if changed {
            Self::publish(&self.shared, self.observer.as_ref(), session.chain.as_ref());
        }
    }

    /// Returns true if the chain changed.
    fn run_task(&self, session: &mut Session, task: WorkerTask) -> bool {
        let id = self.shared.id;
        match task {
            WorkerTask::AddPlugin { id: plugin_id, reply } => {
                match self.loader.load(&plugin_id, &session.layout) {
                    Ok(processor) => {
                        let desc = processor.description().clone();
                        session.chain.add(processor);
                        self.shared.recents.add(&session.request.host, desc);
                        tracing::debug!("Session {}: added {}", id, plugin_id);
                        let _ = reply.send(Ok(()));
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Session {}: failed to add {}: {}", id, plugin_id, e);
                        let _ = reply.send(Err(e.to_string()));
                        false
                    }
                }
            }
            WorkerTask::DelPlugin { index, reply } => {
                let removed = session.chain.remove(index).is_some();
                let _ = reply.send(if removed {
                    Ok(())
                } else {
                    Err(format!("no plugin at index {}", index))
                });
                removed
            }
            WorkerTask::ExchangePlugins { a, b, reply } => {
                let swapped = session.chain.exchange(a, b);
                let _ = reply.send(if swapped {
                    Ok(())
                } else {
                    Err(format!("cannot exchange {} and {}", a, b))
                });
                swapped
            }
            WorkerTask::Clear { reply } => {
                let changed = session.chain.size() > 0;
                session.chain.clear();
                let _ = reply.send(Ok(()));
                changed
            }
            WorkerTask::Update { reply } => {
                session.chain.update();
                let _ = reply.send(Ok(()));
                true
            }
            WorkerTask::ParameterValue {
                index,
                param,
                reply,
            } => {
                let _ = reply.send(
                    session
                        .chain
                        .parameter_value(index, param)
                        .ok_or_else(|| format!("no parameter {} on plugin {}", param, index)),
                );
                false
            }
        }
    }

    fn publish(shared: &WorkerShared, observer: Option<&ChainObserver>, chain: &dyn EffectChain) {
        shared.snapshot.store(Arc::new(ChainSnapshot::capture(chain)));
        if let Some(observer) = observer {
            observer(shared.id, chain.size());
        }
    }
}

/// Cross-thread access to a running session.
///
/// Edits and parameter reads block until the worker reaches its next block or
/// idle boundary. Size, latency and processor queries read the last published
/// snapshot.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<WorkerShared>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.shared.request.get()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    fn call<T>(
        &self,
        task: impl FnOnce(Reply<T>) -> WorkerTask,
    ) -> std::result::Result<T, String> {
        if self.is_finished() {
            return Err(GridError::SessionClosed.to_string());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared
            .tasks
            .send(task(tx))
            .map_err(|_| GridError::SessionClosed.to_string())?;
        rx.recv()
            .map_err(|_| GridError::SessionClosed.to_string())?
    }

    pub fn add_plugin(&self, id: &str) -> std::result::Result<(), String> {
        let id = id.to_string();
        self.call(|reply| WorkerTask::AddPlugin { id, reply })
    }

    pub fn del_plugin(&self, index: usize) -> std::result::Result<(), String> {
        self.call(|reply| WorkerTask::DelPlugin { index, reply })
    }

    pub fn exchange_plugins(&self, a: usize, b: usize) -> std::result::Result<(), String> {
        self.call(|reply| WorkerTask::ExchangePlugins { a, b, reply })
    }

    pub fn clear(&self) -> std::result::Result<(), String> {
        self.call(|reply| WorkerTask::Clear { reply })
    }

    pub fn update(&self) -> std::result::Result<(), String> {
        self.call(|reply| WorkerTask::Update { reply })
    }

    pub fn parameter_value(&self, index: usize, param: usize) -> std::result::Result<f32, String> {
        self.call(|reply| WorkerTask::ParameterValue {
            index,
            param,
            reply,
        })
    }

    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.shared.snapshot.load_full()
    }

    pub fn size(&self) -> usize {
        self.shared.snapshot.load().processors.len()
    }

    pub fn latency_samples(&self) -> usize {
        self.shared.snapshot.load().latency_samples
    }

    pub fn is_sidechain_disabled(&self) -> bool {
        self.shared.snapshot.load().sidechain_disabled
    }

    pub fn processor(&self, index: usize) -> Option<PluginDescription> {
        self.shared.snapshot.load().processors.get(index).cloned()
    }

    pub fn recents_list(&self) -> Vec<PluginDescription> {
        match self.request() {
            Some(request) => self.shared.recents.recents(&request.host),
            None => Vec::new(),
        }
    }

    pub fn add_to_recents_list(&self, desc: PluginDescription) {
        if let Some(request) = self.request() {
            self.shared.recents.add(&request.host, desc);
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Waits for the worker thread. No-op when called from the worker itself.
    pub fn join(&self) {
        let thread = self.shared.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinLoader;
    use std::net::TcpListener;
    use std::time::Instant;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn worker(id: u64) -> SessionWorker {
        SessionWorker::new(id, Arc::new(BuiltinLoader), Arc::new(RecentsCache::new(10)))
    }

    fn request() -> HandshakeRequest {
        HandshakeRequest::new("studio", 48000.0, 64).channels(2, 2, 0)
    }

    fn roundtrip(client: &TcpStream, block: &mut AudioBlock<f32>) -> ChunkHeader {
        let mut scratch = Vec::new();
        let mut midi = MidiBuffer::new();
        write_chunk(client, block, &midi, &mut scratch).unwrap();
        let header = ChunkHeader::read_from(client).unwrap();
        read_chunk_payload(client, &header, block, &mut midi, &mut scratch).unwrap();
        header
    }

    #[test]
    fn test_init_twice_fails() {
        let (server, _client) = socket_pair();
        let (server2, _client2) = socket_pair();
        let mut w = worker(1);
        w.init(server, &request()).unwrap();
        assert!(matches!(
            w.init(server2, &request()),
            Err(GridError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_run_without_init_fails() {
        assert!(worker(1).run().is_err());
    }

    #[test]
    fn test_init_rejects_invalid_request() {
        let (server, _client) = socket_pair();
        let mut w = worker(1);
        let bad = HandshakeRequest::new("studio", 48000.0, 0);
        assert!(w.init(server, &bad).is_err());
    }

    #[test]
    fn test_stream_silence() {
        let (server, client) = socket_pair();
        let mut w = worker(1);
        w.init(server, &request()).unwrap();
        let handle = w.start().unwrap();

        for _ in 0..5 {
            let mut block = AudioBlock::<f32>::new(2, 64);
            let header = roundtrip(&client, &mut block);
            assert_eq!(header, ChunkHeader::new(2, 64, SampleFormat::Float32));
            assert!(block.is_silent());
        }

        drop(client);
        handle.join();
        assert!(handle.is_finished());
    }

    #[test]
    fn test_gain_applied_after_add() {
        let (server, client) = socket_pair();
        let mut w = worker(2);
        w.init(server, &request()).unwrap();
        let handle = w.start().unwrap();

        let mut block = AudioBlock::from_channels(vec![vec![0.5f32; 16]; 2]);
        roundtrip(&client, &mut block);
        assert_eq!(block.channel(0), &[0.5; 16]);

        handle.add_plugin("builtin:gain?db=6.0206").unwrap();
        assert_eq!(handle.size(), 1);
        roundtrip(&client, &mut block);
        assert!(block.channel(1).iter().all(|&s| (s - 1.0).abs() < 1e-3));

        handle.del_plugin(0).unwrap();
        assert_eq!(handle.size(), 0);
        roundtrip(&client, &mut block);
        assert!(block.channel(0).iter().all(|&s| (s - 1.0).abs() < 1e-3));

        handle.shutdown();
        handle.join();
    }

    #[test]
    fn test_add_bad_plugin_leaves_chain() {
        let (server, _client) = socket_pair();
        let mut w = worker(3);
        w.init(server, &request()).unwrap();
        let handle = w.start().unwrap();

        let err = handle.add_plugin("bad-id").unwrap_err();
        assert!(!err.is_empty());
        assert_eq!(handle.size(), 0);
        assert!(handle.recents_list().is_empty());

        handle.shutdown();
        handle.join();
    }

    #[test]
    fn test_queries_and_recents() {
        let (server, _client) = socket_pair();
        let mut w = worker(4);
        w.init(server, &request().channels(2, 2, 2)).unwrap();
        let handle = w.start().unwrap();

        handle.add_plugin("builtin:delay?samples=32").unwrap();
        handle.add_plugin("builtin:gain?db=-3").unwrap();
        assert_eq!(handle.latency_samples(), 32);
        assert!(handle.is_sidechain_disabled());
        assert_eq!(handle.parameter_value(1, 0).unwrap(), -3.0);
        assert!(handle.parameter_value(1, 7).is_err());

        handle.exchange_plugins(0, 1).unwrap();
        assert_eq!(handle.processor(0).unwrap().name, "Gain");
        assert!(handle.exchange_plugins(0, 9).is_err());
        assert!(handle.del_plugin(9).is_err());
        handle.update().unwrap();

        let recents = handle.recents_list();
        assert_eq!(recents[0].name, "Gain");
        assert_eq!(recents[1].name, "Delay");

        handle.clear().unwrap();
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.latency_samples(), 0);

        handle.shutdown();
        handle.join();
    }

    #[test]
    fn test_malformed_header_ends_session() {
        let (server, client) = socket_pair();
        let mut w = worker(5);
        w.init(server, &request()).unwrap();
        let handle = w.handle();
        let runner = thread::spawn(move || w.run());

        ChunkHeader::new(3, 64, SampleFormat::Float32)
            .write_to(&client)
            .unwrap();

        let result = runner.join().unwrap();
        assert!(matches!(result, Err(GridError::InvalidChunk(_))));
        assert!(handle.is_finished());
        assert_eq!(
            handle.add_plugin("builtin:gain").unwrap_err(),
            GridError::SessionClosed.to_string()
        );
    }

    #[test]
    fn test_shutdown_unblocks_idle_worker() {
        let (server, _client) = socket_pair();
        let mut w = worker(6);
        w.init(server, &request()).unwrap();
        let handle = w.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), WorkerState::AwaitingHeader);

        let started = Instant::now();
        handle.shutdown();
        handle.join();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(handle.is_finished());
        assert_eq!(handle.state(), WorkerState::ShuttingDown);

        handle.shutdown();
    }

    #[test]
    fn test_shutdown_mid_chunk() {
        let (server, client) = socket_pair();
        let mut w = worker(7);
        w.init(server, &request()).unwrap();
        let handle = w.handle();
        let runner = thread::spawn(move || w.run());

        ChunkHeader::new(2, 64, SampleFormat::Float32)
            .write_to(&client)
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();

        assert!(runner.join().unwrap().is_ok());
    }

    #[test]
    fn test_observer_sees_chain_sizes() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        let (server, _client) = socket_pair();
        let mut w = worker(8).observer(Arc::new(move |id, size| seen.lock().push((id, size))));
        w.init(server, &request()).unwrap();
        let handle = w.start().unwrap();

        handle.add_plugin("builtin:passthrough").unwrap();
        handle.add_plugin("builtin:passthrough").unwrap();
        handle.shutdown();
        handle.join();

        assert_eq!(*sizes.lock(), vec![(8, 1), (8, 2), (8, 0)]);
    }
}
