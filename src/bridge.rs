//! Bridge between ordinary threads and the server's single I/O loop.
//!
//! The loop runs on one dedicated OS thread (a current-thread tokio runtime
//! driving a [`LocalSet`]) and owns every connection and the client registry.
//! Nothing else touches that state directly: other threads hand closures to
//! [`EventLoopBridge::submit_and_wait`], which runs them on the loop with a
//! [`LoopContext`] and blocks the caller until the result comes back or the
//! timeout passes.
//!
//! A timed-out task is *not* cancelled. It keeps running on the loop and its
//! result is discarded, so a timeout means "outcome unknown".

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use futures::future::LocalBoxFuture;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinSet, LocalSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::auth::{AcceptAll, Authenticator};
use crate::config::ServerConfig;
use crate::data::Signal;
use crate::error::{BridgeError, StartupError};
use crate::websocket::{BroadcastEngine, BroadcastReport, ClientInfo, ClientRegistry, SharedRegistry, WebSocketHandler};

/// How long connections get to finish their close handshake on shutdown
/// before the remaining loop tasks are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const LOOP_THREAD_NAME: &str = "signal-loop";

/// Loop-local state handed to every submitted task.
///
/// The registry is only reachable through short synchronous reads, so no task
/// can hold it across an await.
#[derive(Clone)]
pub struct LoopContext {
    registry: SharedRegistry,
    engine: BroadcastEngine,
    local_addr: SocketAddr,
}

impl LoopContext {
    pub fn engine(&self) -> &BroadcastEngine {
        &self.engine
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry.borrow().infos()
    }
}

type Job = Box<dyn FnOnce(LoopContext) -> LocalBoxFuture<'static, ()> + Send>;

enum BridgeState {
    Idle,
    Running(RunningLoop),
    Stopped,
}

struct RunningLoop {
    jobs: mpsc::UnboundedSender<Job>,
    shutdown: oneshot::Sender<()>,
    worker: thread::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Owner of the I/O loop thread and the only way into it.
///
/// Share it between threads with an `Arc`. Dropping the bridge stops the
/// loop and joins its thread.
pub struct EventLoopBridge {
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    state: Mutex<BridgeState>,
    alive: Arc<AtomicBool>,
}

impl EventLoopBridge {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(AcceptAll))
    }

    pub fn with_authenticator(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            authenticator,
            state: Mutex::new(BridgeState::Idle),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the loop thread and binds the listener on it.
    ///
    /// Returns once the server is accepting connections, with the bound
    /// address, or with the reason it could not start.
    pub fn start(&self) -> Result<SocketAddr, StartupError> {
        let mut state = self.lock_state();
        if matches!(*state, BridgeState::Running(_)) {
            return Err(StartupError::AlreadyStarted);
        }

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let worker = LoopWorker {
            config: self.config.clone(),
            authenticator: self.authenticator.clone(),
            jobs: jobs_rx,
            shutdown: shutdown_rx,
            alive: self.alive.clone(),
        };

        let handle = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || worker.run(ready_tx))
            .map_err(StartupError::Spawn)?;

        let local_addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(StartupError::WorkerExited);
            }
        };

        *state = BridgeState::Running(RunningLoop {
            jobs: jobs_tx,
            shutdown: shutdown_tx,
            worker: handle,
            local_addr,
        });
        info!("Event loop started on thread '{}'", LOOP_THREAD_NAME);
        Ok(local_addr)
    }

    /// Stops accepting, closes every client, aborts and drains the loop's
    /// tasks and joins the loop thread. Does nothing if the loop is not running.
    pub fn stop(&self) {
        let running = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, BridgeState::Stopped) {
                BridgeState::Running(running) => running,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        info!("Stopping event loop...");
        let RunningLoop { jobs, shutdown, worker, .. } = running;
        drop(jobs);
        let _ = shutdown.send(());

        if worker.thread().id() == thread::current().id() {
            warn!("Event loop stop requested from the loop itself; not joining");
            return;
        }
        if worker.join().is_err() {
            error!("Event loop thread panicked");
        }
        info!("Event loop stopped");
    }

    /// True while the loop thread is serving.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_state() {
            BridgeState::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Runs `task` on the loop and blocks until it finishes or `timeout`
    /// passes.
    ///
    /// Must be called from outside the loop thread. On timeout the task keeps
    /// running; its result is dropped.
    pub fn submit_and_wait<F, Fut, T>(&self, task: F, timeout: Duration) -> Result<T, BridgeError>
    where
        F: FnOnce(LoopContext) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        let job: Job = Box::new(move |ctx| {
            Box::pin(async move {
                let output = task(ctx).await;
                // The caller may have timed out and gone away.
                let _ = done_tx.send(output);
            })
        });

        self.dispatch(job)?;

        match done_rx.recv_timeout(timeout) {
            Ok(output) => Ok(output),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("Loop task did not finish within {:?}; it may still complete in the background", timeout);
                Err(BridgeError::Timeout { timeout })
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(BridgeError::Cancelled),
        }
    }

    /// Broadcasts `signal` to every connected client through the loop.
    pub fn broadcast(&self, signal: Signal, timeout: Duration) -> Result<BroadcastReport, BridgeError> {
        let report = self.submit_and_wait(
            move |ctx| async move { ctx.engine().broadcast(&signal).await },
            timeout,
        )??;
        Ok(report)
    }

    pub fn client_count(&self, timeout: Duration) -> Result<usize, BridgeError> {
        self.submit_and_wait(|ctx| async move { ctx.client_count() }, timeout)
    }

    pub fn clients(&self, timeout: Duration) -> Result<Vec<ClientInfo>, BridgeError> {
        self.submit_and_wait(|ctx| async move { ctx.clients() }, timeout)
    }

    fn dispatch(&self, job: Job) -> Result<(), BridgeError> {
        let state = self.lock_state();
        let running = match &*state {
            BridgeState::Running(running) => running,
            _ => return Err(BridgeError::LoopUnavailable),
        };

        if running.worker.thread().id() == thread::current().id() {
            error!("submit_and_wait called from the event loop thread; refusing to block the loop");
            return Err(BridgeError::LoopUnavailable);
        }

        running.jobs.send(job).map_err(|_| BridgeError::LoopUnavailable)
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventLoopBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clears the liveness flag when the loop exits, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl AliveGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag.clone())
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct LoopWorker {
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    jobs: mpsc::UnboundedReceiver<Job>,
    shutdown: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
}

type Ready = std_mpsc::SyncSender<Result<SocketAddr, StartupError>>;

impl LoopWorker {
    fn run(self, ready: Ready) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(StartupError::Runtime(e)));
                return;
            }
        };

        let local = LocalSet::new();
        local.block_on(&runtime, self.serve(ready));
        // Dropping the LocalSet cancels anything that outlived the drain.
        drop(local);
        debug!("Event loop runtime shut down");
    }

    async fn serve(self, ready: Ready) {
        let LoopWorker { config, authenticator, mut jobs, mut shutdown, alive } = self;

        let listener = match TcpListener::bind(config.bind_address.as_str()).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready.send(Err(StartupError::Bind { addr: config.bind_address.clone(), source }));
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                let _ = ready.send(Err(StartupError::Bind { addr: config.bind_address.clone(), source }));
                return;
            }
        };

        let registry = ClientRegistry::shared();
        let ctx = LoopContext {
            registry: registry.clone(),
            engine: BroadcastEngine::new(registry.clone(), config.max_concurrent_sends),
            local_addr,
        };
        let _alive = AliveGuard::raise(&alive);
        let mut tasks: JoinSet<()> = JoinSet::new();

        if ready.send(Ok(local_addr)).is_err() {
            return;
        }
        info!("Signal server running at ws://{}", local_addr);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted TCP connection from {}", addr);
                        let handler = WebSocketHandler::new(registry.clone(), authenticator.clone(), addr.to_string());
                        tasks.spawn_local(handler.handle_connection(stream));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(job) = jobs.recv() => {
                    tasks.spawn_local(job(ctx.clone()));
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Loop task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        // Queued but unstarted jobs are dropped; their callers see `Cancelled`.
        drop(jobs);

        let clients = registry.borrow().snapshot();
        info!("Closing {} client connections", clients.len());
        for conn in &clients {
            conn.close(CloseCode::Away, "server shutting down");
        }
        drop(clients);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} loop tasks still running after {:?}; aborting", tasks.len(), SHUTDOWN_GRACE);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
