//! Transport server handle and its background execution context.
//!
//! The [`TransportServer`] owns one dedicated thread per run. That thread
//! builds a single-threaded tokio runtime, creates the access-control
//! descriptor and all endpoint instances, arms every slot, reports the
//! outcome of that setup back to [`TransportServer::start`], and then runs
//! the reactor until it is stopped or hits a fatal error.
//!
//! # Example
//!
//! ```no_run
//! use pipehost::TransportServer;
//!
//! # fn example() -> pipehost::Result<()> {
//! let server = TransportServer::builder("input-bridge")
//!     .on_request(|request, response| {
//!         response[..request.len()].copy_from_slice(request);
//!         request.len()
//!     })
//!     .on_fatal_error(|e| eprintln!("transport failed: {e}"))
//!     .build()?;
//!
//! server.start()?;
//! assert!(server.is_running());
//! server.stop();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::platform::{self, AccessDescriptor};
use crate::transport::{Counters, Reactor, RequestHandler, ServerStats};

use super::builder::ServerBuilder;
use super::options::ServerOptions;

// ============================================================================
// Types
// ============================================================================

/// Fatal-error sink callback type.
///
/// Invoked on the server thread once the server has stopped because of a
/// protocol-invariant violation.
pub type FatalErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Source of per-handle identities, used to recognize the server thread.
static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Identity of the server whose background thread this is, if any.
    static CURRENT_SERVER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Immutable configuration shared with every run's thread.
struct ServerConfig {
    id: u64,
    name: String,
    path: PathBuf,
    options: ServerOptions,
    handler: RequestHandler,
    fatal: FatalErrorHandler,
    counters: Arc<Counters>,
}

/// One started run of the server.
struct Running {
    thread: JoinHandle<()>,
    stop_tx: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl Running {
    /// Raises the stop flag and wakes the reactor.
    fn request_stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(stop_tx) = self.stop_tx.take() {
            // The receiver is gone if the reactor already exited.
            let _ = stop_tx.send(());
        }
    }

    /// Alive and not asked to stop.
    fn is_serving(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.stop_requested.load(Ordering::Acquire)
    }

    fn join(self) {
        if self.thread.join().is_err() {
            warn!("Server thread panicked");
        }
    }
}

/// Clears the alive flag when the server thread finishes its run.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// TransportServer
// ============================================================================

/// Multi-instance request/response server over a named local endpoint.
///
/// The server is created stopped. [`start`](Self::start) and
/// [`stop`](Self::stop) are idempotent and may be called repeatedly;
/// dropping the handle stops the server.
///
/// # Threading
///
/// All slots are served by one background thread. The request handler runs
/// inline on that thread, so a slow handler delays every other client, and
/// a handler that never returns makes `stop()` wait forever.
pub struct TransportServer {
    config: Arc<ServerConfig>,
    /// Serializes `start` against an in-flight `stop`.
    lifecycle: Mutex<()>,
    /// Current run, held only briefly.
    running: Mutex<Option<Running>>,
}

// ============================================================================
// TransportServer - Display
// ============================================================================

impl fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportServer")
            .field("name", &self.config.name)
            .field("path", &self.config.path)
            .field("instances", &self.config.options.instances)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TransportServer - Public API
// ============================================================================

impl TransportServer {
    /// Creates a configuration builder for the endpoint `name`.
    #[inline]
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name)
    }

    /// Starts the server.
    ///
    /// Blocks until every endpoint instance is created and armed. Returns
    /// immediately if the server is already running. A run that ended on a
    /// fatal error is reaped and replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// - [`Error::Lifecycle`] if called from the server's own thread
    /// - [`Error::AccessControl`] if the access descriptor cannot be created
    /// - [`Error::Endpoint`] if the name is already served or an instance
    ///   cannot be created
    /// - [`Error::ServerThread`] if the background thread cannot start
    pub fn start(&self) -> Result<()> {
        if self.on_server_thread() {
            return Err(Error::lifecycle(
                "start() cannot be called from the server's own thread",
            ));
        }

        let _lifecycle = self.lifecycle.lock();

        let previous = self.running.lock().take();
        if let Some(previous) = previous {
            if previous.is_serving() {
                *self.running.lock() = Some(previous);
                return Ok(());
            }
            debug!(name = %self.config.name, "Reaping exited server thread");
            previous.join();
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let thread = {
            let config = Arc::clone(&self.config);
            let stop_requested = Arc::clone(&stop_requested);
            let alive = Arc::clone(&alive);

            thread::Builder::new()
                .name(format!("pipehost-{}", self.config.name))
                .spawn(move || run_server(config, stop_rx, stop_requested, alive, ready_tx))
                .map_err(|e| Error::server_thread(format!("cannot spawn server thread: {e}")))?
        };

        let startup = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::server_thread("server thread exited during startup")));

        if let Err(e) = startup {
            if thread.join().is_err() {
                warn!(name = %self.config.name, "Server thread panicked during startup");
            }
            return Err(e);
        }

        *self.running.lock() = Some(Running {
            thread,
            stop_tx: Some(stop_tx),
            stop_requested,
            alive,
        });

        info!(
            name = %self.config.name,
            path = %self.config.path.display(),
            instances = self.config.options.instances,
            "Transport server started"
        );

        Ok(())
    }

    /// Stops the server and waits for its thread to release every resource.
    ///
    /// No-op if the server is not running. When called from the server's
    /// own thread (from the handler or the fatal-error sink) it only signals
    /// the stop and returns; the thread exits once control returns to it.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().as_mut() {
            running.request_stop();
        }

        if self.on_server_thread() {
            debug!(name = %self.config.name, "Stop requested from server thread");
            return;
        }

        let _lifecycle = self.lifecycle.lock();
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.join();

        info!(name = %self.config.name, "Transport server stopped");
    }

    /// Returns `true` while the background thread is serving.
    ///
    /// Becomes `false` after [`stop`](Self::stop) or a fatal error.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.alive.load(Ordering::Acquire))
    }

    /// Logical endpoint name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Platform rendezvous path clients connect to.
    #[inline]
    #[must_use]
    pub fn endpoint_path(&self) -> &Path {
        &self.config.path
    }

    /// Server options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.config.options
    }

    /// Snapshot of the server's counters, accumulated across runs.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.config
            .counters
            .snapshot(self.config.options.instances)
    }
}

// ============================================================================
// TransportServer - Internal API
// ============================================================================

impl TransportServer {
    /// Creates a stopped server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name or options are invalid.
    pub(crate) fn new(
        name: String,
        options: ServerOptions,
        handler: RequestHandler,
        fatal: Option<FatalErrorHandler>,
    ) -> Result<Self> {
        platform::validate_name(&name)?;
        options.validate()?;

        let path = platform::endpoint_path(&name, &options);
        let fatal = fatal.unwrap_or_else(default_fatal_handler);

        let config = ServerConfig {
            id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            path,
            options,
            handler,
            fatal,
            counters: Arc::new(Counters::default()),
        };

        Ok(Self {
            config: Arc::new(config),
            lifecycle: Mutex::new(()),
            running: Mutex::new(None),
        })
    }

    fn on_server_thread(&self) -> bool {
        CURRENT_SERVER.with(|current| current.get() == Some(self.config.id))
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Logs the fatal error.
fn default_fatal_handler() -> FatalErrorHandler {
    Arc::new(|e: &Error| {
        error!(error = %e, "Transport server stopped on fatal error");
    })
}

// ============================================================================
// Server Thread
// ============================================================================

/// Body of the background thread for one run.
fn run_server(
    config: Arc<ServerConfig>,
    stop_rx: oneshot::Receiver<()>,
    stop_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    ready_tx: mpsc::SyncSender<Result<()>>,
) {
    CURRENT_SERVER.with(|current| current.set(Some(config.id)));

    let outcome = {
        let _alive = AliveGuard(alive);
        serve(&config, stop_rx, &stop_requested, &ready_tx)
    };

    if let Err(e) = outcome {
        (config.fatal)(&e);
    }
}

/// Sets up the endpoints, reports the setup outcome, and runs the reactor.
///
/// Setup failures go to `ready_tx` and yield `Ok(())`; only errors raised
/// while serving are returned. Every endpoint and the access descriptor
/// are released before this returns.
fn serve(
    config: &ServerConfig,
    mut stop_rx: oneshot::Receiver<()>,
    stop_requested: &AtomicBool,
    ready_tx: &mpsc::SyncSender<Result<()>>,
) -> Result<()> {
    let runtime = match RuntimeBuilder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::server_thread(format!(
                "cannot build runtime: {e}"
            ))));
            return Ok(());
        }
    };

    runtime.block_on(async {
        let mut access = match AccessDescriptor::create(&config.options) {
            Ok(access) => access,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return Ok(());
            }
        };

        let mut reactor = match platform::create_endpoints(&config.path, &config.options, &mut access)
            .and_then(|endpoints| {
                Reactor::new(
                    endpoints,
                    config.options.max_message_size,
                    Arc::clone(&config.handler),
                    Arc::clone(&config.counters),
                )
            }) {
            Ok(reactor) => reactor,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return Ok(());
            }
        };

        debug!(name = %config.name, slots = reactor.len(), "Server thread ready");
        let _ = ready_tx.send(Ok(()));

        reactor.run(&mut stop_rx, stop_requested).await
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    use futures_util::future::join_all;
    use tempfile::TempDir;

    use crate::transport::PipeClient;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn unique_name() -> String {
        format!("pipehost-test-{}", uuid::Uuid::new_v4().simple())
    }

    fn test_options(dir: &TempDir) -> ServerOptions {
        ServerOptions::new()
            .with_socket_dir(dir.path())
            .with_client_timeout(Duration::from_secs(2))
    }

    fn reverse(request: &[u8], response: &mut [u8]) -> usize {
        for (dst, src) in response.iter_mut().zip(request.iter().rev()) {
            *dst = *src;
        }
        request.len()
    }

    fn reversed(payload: &[u8]) -> Vec<u8> {
        payload.iter().rev().copied().collect()
    }

    fn reverse_server(name: &str, options: &ServerOptions) -> TransportServer {
        TransportServer::builder(name)
            .options(options.clone())
            .on_request(reverse)
            .build()
            .expect("valid configuration")
    }

    /// Polls until the server reports stopped or two seconds pass.
    async fn wait_until_stopped(server: &TransportServer) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !server.is_running() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_four_slots_serve_own_payloads_and_reuse_dropped_slot() {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir).with_instances(4);
        let server = reverse_server(&name, &options);
        server.start().expect("server should start");

        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(PipeClient::connect(&name, &options).await.expect("connect"));
        }

        let rounds = clients.iter_mut().enumerate().map(|(i, client)| async move {
            let payload = format!("client-{i:03}").into_bytes();
            assert_eq!(payload.len(), 10);
            let response = client.request(&payload).await.expect("request");
            (payload, response)
        });
        for (payload, response) in join_all(rounds).await {
            assert_eq!(response, reversed(&payload));
        }

        // Abruptly drop client #2; the others keep their slots.
        drop(clients.remove(2));

        let mut fifth = PipeClient::connect(&name, &options).await.expect("fifth connect");
        let response = fifth.request(b"fifth-0004").await.expect("fifth request");
        assert_eq!(response, reversed(b"fifth-0004"));

        for (i, client) in clients.iter_mut().enumerate() {
            let payload = format!("second-{i:03}").into_bytes();
            let response = client.request(&payload).await.expect("second round");
            assert_eq!(response, reversed(&payload));
        }

        let stats = server.stats();
        assert_eq!(stats.instances, 4);
        assert!(stats.disconnects >= 1);
        assert_eq!(stats.requests, 8);
        assert!(stats.connections >= 5);
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = reverse_server(&unique_name(), &test_options(&dir));

        server.start().expect("first start");
        server.start().expect("second start");
        assert!(server.is_running());

        server.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = reverse_server(&unique_name(), &test_options(&dir));

        server.stop();
        server.start().expect("start");
        server.stop();
        server.stop();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_with_io_in_flight_releases_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir);
        let server = reverse_server(&name, &options);
        server.start().expect("start");

        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        client.request(b"warm").await.expect("request");

        // The slot now has a read pending on this client.
        server.stop();
        assert!(!server.is_running());

        #[cfg(unix)]
        assert!(!server.endpoint_path().exists());
    }

    #[tokio::test]
    async fn test_client_dropped_before_request_frees_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir).with_instances(1);
        let server = reverse_server(&name, &options);
        server.start().expect("start");

        // Each drop lands while the only slot is connecting or reading.
        for _ in 0..3 {
            drop(PipeClient::connect(&name, &options).await.expect("connect"));
        }

        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        let response = client.request(b"after-drops").await.expect("request");
        assert_eq!(response, reversed(b"after-drops"));

        let stats = server.stats();
        assert_eq!(stats.requests, 1);
        assert!(stats.disconnects >= 3);
        assert!(stats.connections >= 4);

        server.stop();
    }

    #[tokio::test]
    async fn test_payload_at_max_message_size_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let name = unique_name();
        let max = if cfg!(unix) { 256 * 1024 } else { 4096 };
        let options = test_options(&dir).with_max_message_size(max);
        let server = reverse_server(&name, &options);
        server.start()?;

        let mut client = PipeClient::connect(&name, &options).await?;
        for len in [max, max - 1] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let response = client.request(&payload).await?;
            assert_eq!(response.len(), len);
            assert_eq!(response, reversed(&payload));
        }

        // One handler call per request, however the bytes were split.
        assert_eq!(server.stats().requests, 2);

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_after_stop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let name = unique_name();
        let options = test_options(&dir);
        let server = reverse_server(&name, &options);

        server.start()?;
        server.stop();
        server.start()?;

        let mut client = PipeClient::connect(&name, &options).await?;
        assert_eq!(client.request(b"again").await?, b"niaga");

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_name_fails_synchronously() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir);

        let first = reverse_server(&name, &options);
        first.start().expect("first start");

        let second = reverse_server(&name, &options);
        let err = second.start().unwrap_err();
        assert!(matches!(err, Error::Endpoint { .. }));
        assert!(err.is_setup_error());
        assert!(!second.is_running());
        assert!(first.is_running());

        first.stop();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_socket_mode_fails_synchronously() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(&dir).with_socket_mode(0o10000);
        let server = reverse_server(&unique_name(), &options);

        let err = server.start().unwrap_err();
        assert!(matches!(err, Error::AccessControl { .. }));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_handler_overflow_reports_fatal_error_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir).with_max_message_size(16);

        let calls = Arc::new(AtomicUsize::new(0));
        let last_error = Arc::new(Mutex::new(None));
        let server = {
            let calls = Arc::clone(&calls);
            let last_error = Arc::clone(&last_error);
            TransportServer::builder(&name)
                .options(options.clone())
                .on_request(|_, response| response.len() + 1)
                .on_fatal_error(move |e| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *last_error.lock() = Some(e.to_string());
                })
                .build()
                .expect("valid configuration")
        };
        server.start().expect("start");

        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        assert!(client.request(b"boom").await.is_err());

        assert!(wait_until_stopped(&server).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let message = last_error.lock().clone().expect("sink should record error");
        assert!(message.contains("17 bytes"));

        server.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_stops_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir);

        let (error_tx, error_rx) = mpsc::channel();
        let error_tx = std::sync::Mutex::new(error_tx);
        let server = TransportServer::builder(&name)
            .options(options.clone())
            .on_request(|_: &[u8], _: &mut [u8]| -> usize { panic!("handler bug") })
            .on_fatal_error(move |e| {
                let _ = error_tx
                    .lock()
                    .expect("sink lock")
                    .send(matches!(e, Error::HandlerPanicked { .. }));
            })
            .build()
            .expect("valid configuration");
        server.start().expect("start");

        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        assert!(client.request(b"boom").await.is_err());

        let was_panic = error_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("fatal sink should fire");
        assert!(was_panic);
        assert!(wait_until_stopped(&server).await);
    }

    #[tokio::test]
    async fn test_restart_after_fatal_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir).with_max_message_size(8);
        let server = TransportServer::builder(&name)
            .options(options.clone())
            .on_request(|request, response| {
                if request == b"poison" {
                    return response.len() + 1;
                }
                reverse(request, response)
            })
            .on_fatal_error(|_| {})
            .build()
            .expect("valid configuration");

        server.start().expect("start");
        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        assert!(client.request(b"poison").await.is_err());
        assert!(wait_until_stopped(&server).await);

        server.start().expect("restart after fatal error");
        let mut client = PipeClient::connect(&name, &options).await.expect("reconnect");
        assert_eq!(client.request(b"ok").await.expect("request"), b"ko");

        server.stop();
    }

    #[tokio::test]
    async fn test_lifecycle_calls_from_server_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let options = test_options(&dir).with_max_message_size(8);

        let handle: Arc<OnceLock<Weak<TransportServer>>> = Arc::new(OnceLock::new());
        let (result_tx, result_rx) = mpsc::channel();
        let result_tx = std::sync::Mutex::new(result_tx);

        let server = {
            let handle = Arc::clone(&handle);
            Arc::new(
                TransportServer::builder(&name)
                    .options(options.clone())
                    .on_request(|_, response| response.len() + 1)
                    .on_fatal_error(move |_| {
                        let Some(server) = handle.get().and_then(Weak::upgrade) else {
                            return;
                        };
                        let start = server.start();
                        server.stop();
                        let _ = result_tx
                            .lock()
                            .expect("sink lock")
                            .send(matches!(start, Err(Error::Lifecycle { .. })));
                    })
                    .build()
                    .expect("valid configuration"),
            )
        };
        handle
            .set(Arc::downgrade(&server))
            .expect("handle set once");

        server.start().expect("start");
        let mut client = PipeClient::connect(&name, &options).await.expect("connect");
        assert!(client.request(b"boom").await.is_err());

        let start_rejected = result_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("sink should report");
        assert!(start_rejected);

        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_server_is_debug() {
        let server = TransportServer::builder("pipehost-debug")
            .on_request(reverse)
            .build()
            .expect("valid configuration");
        let debug = format!("{server:?}");
        assert!(debug.contains("pipehost-debug"));
        assert!(debug.contains("running: false"));
    }
}
