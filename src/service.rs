//! The Stream Client Service: owns the reactor(s) and worker thread pool for
//! one endpoint, drives Client lifecycle (connect, reconnect, teardown), and
//! mediates between application code and the currently live Client under a
//! concurrency discipline that survives error storms.
//!
//! Grounded line-for-line in `NetworkStreamClientService.cpp`'s
//! `Implementation::Connect`/`ScheduleReconnect`/`Reconnect`/`StopClient`
//! and the top-level `OnDisconnect`/`OnClientDestroy`/`InvokeClient` methods
//! (original_source). The one structural departure from the original is
//! forced by the reactor: `tokio_core::reactor::Core` cannot itself be
//! driven concurrently by two OS threads the way a `boost::asio::io_service`
//! can, so "a thread pool of exactly two worker threads that call
//! `reactor.run()`" (spec.md §4.E) is realized here as two independent
//! per-thread `Core`s — a "socket" reactor that the live Client's reads and
//! writes are registered against, and a "control" reactor dedicated to the
//! reconnect timer and posted disconnect/reconnect tasks — coordinated
//! through their respective `Remote` handles. This keeps the invariant that
//! a blocking wait (the destruction handshake) on one thread never stalls
//! the other, matching the two-thread design's intent even though the
//! underlying reactor type had to change. See DESIGN.md for why this is
//! recorded as a decision rather than left open.

use std::panic;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use futures::sync::oneshot;
use futures::Future;
use tokio_core::reactor::{Core, Remote};
use tokio_timer::Timer;

use crate::client::{ClientDestroySink, DisconnectSink, LogTag, StreamClient};
use crate::config::ResolvedConfig;
use crate::decoder::Decoder;
use crate::error::{ClientError, ServiceError};

/// Capability set the application supplies so the core never hard-codes a
/// concrete decoder or transport factory. Mirrors the "capability set, not
/// a dozen loose callbacks" style spec.md §9 recommends for the decoder.
pub trait ServiceHooks<D: Decoder + Send + 'static>: Send + Sync {
    /// Dials and constructs a new, not-yet-started `StreamClient`
    /// (spec.md §4.E "the application hook `create_client`"). The returned
    /// client must have been built with `disconnect_sink` as its
    /// `DisconnectSink` so socket errors route back through this service.
    fn create_client(
        &self,
        disconnect_sink: Arc<dyn DisconnectSink>,
    ) -> Result<Arc<StreamClient<D>>, ClientError>;

    /// Raised after a successful reconnect, before any messages are
    /// delivered on the new client.
    fn on_connection_restored(&self) {}

    /// Raised when a reactor thread exits because a handler panicked.
    fn on_stop_by_error(&self, message: &str) {
        error!("{}", message);
    }
}

enum Kind {
    Socket,
    Control,
}

impl Kind {
    fn name(&self) -> &'static str {
        match *self {
            Kind::Socket => "socket",
            Kind::Control => "control",
        }
    }
}

/// One lazily-started worker thread driving its own `Core`.
struct ReactorThread {
    remote: Remote,
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

struct State<D> {
    /// The single-slot current client. Mutated only under `state`'s mutex,
    /// with every change paired with a `cond` notification (spec.md §3).
    client: Option<Arc<StreamClient<D>>>,
    waiting_for_destruction: bool,
    last_connect_attempt: Option<Instant>,
    stopping: bool,
}

/// A per-endpoint supervisor: owns the reactor(s), the worker threads, and
/// the reconnect state machine described in spec.md §4.E.
pub struct StreamClientService<D> {
    log_tag: LogTag,
    resolved: ResolvedConfig,
    hooks: Arc<dyn ServiceHooks<D>>,
    state: Mutex<State<D>>,
    cond: Condvar,
    socket_reactor: Mutex<Option<ReactorThread>>,
    control_reactor: Mutex<Option<ReactorThread>>,
    self_weak: Weak<StreamClientService<D>>,
}

impl<D: Decoder + Send + 'static> StreamClientService<D> {
    pub fn new(
        log_tag: LogTag,
        resolved: ResolvedConfig,
        hooks: Arc<dyn ServiceHooks<D>>,
    ) -> Arc<StreamClientService<D>> {
        Arc::new_cyclic(|weak| StreamClientService {
            log_tag,
            resolved,
            hooks,
            state: Mutex::new(State {
                client: None,
                waiting_for_destruction: false,
                last_connect_attempt: None,
                stopping: false,
            }),
            cond: Condvar::new(),
            socket_reactor: Mutex::new(None),
            control_reactor: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn get_log_tag(&self) -> &str {
        self.log_tag.as_str()
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.resolved
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().client.is_some()
    }

    /// Connects to the endpoint. Lazily starts the two worker threads on
    /// first call. A second call while already connected is a no-op,
    /// matching `NetworkStreamClientService::Connect`'s early return when a
    /// client is already installed.
    pub fn connect(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.ensure_reactor(Kind::Socket);
        self.ensure_reactor(Kind::Control);
        if self.lock_state().client.is_some() {
            return Ok(());
        }
        self.connect_impl()
    }

    /// Invokes `f` with a reference to the live client, under the service
    /// mutex, so the client cannot be destroyed mid-call (spec.md §8
    /// "during the call C is not destructed"). Raises `NoActiveConnection`
    /// if no client is installed.
    pub fn invoke_client<F, R>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&StreamClient<D>) -> R,
    {
        let state = self.lock_state();
        match state.client {
            Some(ref client) => Ok(f(client)),
            None => Err(ServiceError::NoActiveConnection),
        }
    }

    /// Stops the client (if any) and waits for its destruction, then stops
    /// both reactors and joins the worker threads. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            if state.stopping {
                return;
            }
            state.stopping = true;
        }
        self.stop_client();
        self.teardown_reactor(&self.socket_reactor);
        self.teardown_reactor(&self.control_reactor);
    }

    /// Records the connect attempt, dials via the application hook, and
    /// arms the client on the socket reactor. Mirrors
    /// `Implementation::Connect` exactly.
    fn connect_impl(&self) -> Result<(), ServiceError> {
        debug_assert!(self.lock_state().client.is_none());
        {
            let mut state = self.lock_state();
            state.last_connect_attempt = Some(Instant::now());
        }

        let disconnect_sink: Arc<dyn DisconnectSink> = self
            .self_weak
            .upgrade()
            .expect("service outlives its own connect() call");

        let client = match self.hooks.create_client(disconnect_sink) {
            Ok(client) => client,
            Err(e) => {
                error!("{}failed to connect to server: {}", self.log_tag, e);
                return Err(ServiceError::Connect(e.to_string()));
            }
        };

        let destroy_sink: Arc<dyn ClientDestroySink> = self
            .self_weak
            .upgrade()
            .expect("service outlives its own connect() call");
        client.set_destroy_sink(destroy_sink);

        let socket_remote = self
            .socket_reactor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .expect("socket reactor started before connect_impl runs")
            .remote
            .clone();

        let (result_tx, result_rx) = mpsc::channel();
        let start_target = client.clone();
        socket_remote.spawn(move |handle| {
            let outcome = start_target.start(handle);
            let _ = result_tx.send(outcome);
            Ok(())
        });
        match result_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{}failed to start client: {}", self.log_tag, e);
                return Err(ServiceError::Connect(e.to_string()));
            }
            Err(_) => {
                return Err(ServiceError::Connect(
                    "socket reactor thread is no longer running".into(),
                ));
            }
        }

        let mut state = self.lock_state();
        state.client = Some(client);
        state.waiting_for_destruction = true;
        Ok(())
    }

    /// Posted onto the control reactor by `DisconnectSink::on_disconnect`,
    /// never run inline from within the read loop: the read loop's own
    /// `Arc<StreamClient>` clone is still alive on the call stack that
    /// raised the disconnect, so waiting for the destruction handshake
    /// right there would deadlock against itself. Posting lets that stack
    /// unwind (dropping the read loop's reference) before this task's wait
    /// begins. Mirrors `NetworkStreamClientService::OnDisconnect`.
    fn handle_disconnect(self: &Arc<Self>) {
        let had_client = {
            let mut state = self.lock_state();
            state.client.take().is_some()
        };
        self.wait_for_client_destruction();
        if !had_client {
            info!(
                "{}disconnect observed after a forced stop; not reconnecting",
                self.log_tag
            );
            return;
        }
        self.reconnect();
    }

    /// Mirrors `Implementation::Reconnect`.
    fn reconnect(self: &Arc<Self>) {
        info!("{}reconnecting...", self.log_tag);
        match self.connect_impl() {
            Ok(()) => self.hooks.on_connection_restored(),
            Err(e) => {
                error!("{}failed to reconnect: {}", self.log_tag, e);
                self.schedule_reconnect();
            }
        }
    }

    /// Mirrors `Implementation::ScheduleReconnect`: an immediate retry
    /// unless the prior attempt was within `reconnect_min_gap`, in which
    /// case a `reconnect_back_off`-second timer is armed first.
    fn schedule_reconnect(self: &Arc<Self>) {
        let now = Instant::now();
        let gap = self
            .lock_state()
            .last_connect_attempt
            .map(|t| now.duration_since(t));
        let within_gap = gap.map(|g| g <= self.resolved.reconnect_min_gap).unwrap_or(false);

        let control_remote = match self
            .control_reactor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            Some(r) => r.remote.clone(),
            None => return,
        };
        let weak = self.self_weak.clone();

        if within_gap {
            let delay = self.resolved.reconnect_back_off;
            info!(
                "{}reconnecting at +{:?} (gap since last attempt {:?} <= {:?})",
                self.log_tag,
                delay,
                gap.unwrap_or_default(),
                self.resolved.reconnect_min_gap
            );
            control_remote.spawn(move |_handle| {
                Timer::default().sleep(delay).then(move |result| {
                    if let Err(e) = result {
                        warn!("reconnect timer canceled: {}", e);
                        return Ok(());
                    }
                    if let Some(service) = weak.upgrade() {
                        service.reconnect();
                    }
                    Ok(())
                })
            });
        } else {
            info!("{}reconnecting immediately", self.log_tag);
            control_remote.spawn(move |_handle| {
                if let Some(service) = weak.upgrade() {
                    service.reconnect();
                }
                Ok(())
            });
        }
    }

    /// Nils the client slot, stops the old client outside the lock, and
    /// waits for its destruction. Shared by `stop()` and, indirectly, by
    /// the `Drop` impl's best-effort cleanup.
    fn stop_client(&self) {
        let maybe_client = {
            let mut state = self.lock_state();
            state.client.take()
        };
        if let Some(client) = maybe_client {
            client.stop();
            drop(client);
        }
        self.wait_for_client_destruction();
    }

    fn wait_for_client_destruction(&self) {
        let mut state = self.lock_state();
        while state.waiting_for_destruction {
            state = self.cond.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }

    fn ensure_reactor(self: &Arc<Self>, kind: Kind) {
        let slot = match kind {
            Kind::Socket => &self.socket_reactor,
            Kind::Control => &self.control_reactor,
        };
        let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return;
        }
        let name = kind.name();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let log_tag = self.log_tag.clone();
        let service_weak: Weak<StreamClientService<D>> = self.self_weak.clone();
        let join = thread::Builder::new()
            .name(format!("streamcore-{}", name))
            .spawn(move || run_reactor_thread(name, log_tag, stop_rx, ready_tx, service_weak))
            .expect("failed to spawn reactor thread");
        let remote = ready_rx
            .recv()
            .expect("reactor thread exited before reporting readiness");
        *guard = Some(ReactorThread {
            remote,
            stop: Some(stop_tx),
            join: Some(join),
        });
    }

    fn teardown_reactor(&self, slot: &Mutex<Option<ReactorThread>>) {
        let reactor = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut reactor) = reactor {
            if let Some(stop) = reactor.stop.take() {
                let _ = stop.send(());
            }
            if let Some(join) = reactor.join.take() {
                let _ = join.join();
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<State<D>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<D: Decoder + Send + 'static> DisconnectSink for StreamClientService<D> {
    fn on_disconnect(&self, log_tag: &str, reason: ClientError) {
        warn!("{}connection lost: {}", log_tag, reason);
        let control_remote = match self
            .control_reactor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            Some(r) => r.remote.clone(),
            None => return,
        };
        let weak = self.self_weak.clone();
        control_remote.spawn(move |_handle| {
            if let Some(service) = weak.upgrade() {
                service.handle_disconnect();
            }
            Ok(())
        });
    }
}

impl<D: Decoder + Send + 'static> ClientDestroySink for StreamClientService<D> {
    fn on_client_destroy(&self) {
        let mut state = self.lock_state();
        state.waiting_for_destruction = false;
        drop(state);
        self.cond.notify_all();
    }
}

impl<D> Drop for StreamClientService<D> {
    /// Best-effort cleanup for a service dropped without an explicit
    /// `stop()` call. Can't run the full Arc-mediated reconnect/disconnect
    /// machinery here (the weak self-reference no longer upgrades once the
    /// strong count has hit zero), so this only closes the client
    /// synchronously and joins the reactor threads — callers that need the
    /// complete handshake should call `stop()` themselves before dropping.
    fn drop(&mut self) {
        let already_stopping = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let was = state.stopping;
            state.stopping = true;
            was
        };
        if already_stopping {
            return;
        }
        if let Some(client) = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .client
            .take()
        {
            client.stop();
        }
        self.teardown_reactor(&self.socket_reactor);
        self.teardown_reactor(&self.control_reactor);
    }
}

/// Body of each of the service's two worker threads. Creates its own
/// `Core`, reports its `Remote` back to the constructor, then runs until
/// `stop_rx` fires. A panic escaping `core.run()` is treated the way
/// `RunServiceThread` treats a caught `NetworkStreamClient::Exception`:
/// logged, reported via `on_stop_by_error`, and the client is stopped
/// before the thread exits.
fn run_reactor_thread<D: Decoder + Send + 'static>(
    name: &'static str,
    log_tag: LogTag,
    stop_rx: oneshot::Receiver<()>,
    ready_tx: mpsc::Sender<Remote>,
    service: Weak<StreamClientService<D>>,
) {
    let mut core = match Core::new() {
        Ok(core) => core,
        Err(e) => {
            error!("{}failed to create {} reactor: {}", log_tag, name, e);
            return;
        }
    };
    if ready_tx.send(core.remote()).is_err() {
        return;
    }
    debug!("{}started {} reactor thread", log_tag, name);

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| core.run(stop_rx)));
    if outcome.is_err() {
        let message = format!("fatal error in {} reactor thread", name);
        error!("{}{}", log_tag, message);
        if let Some(service) = service.upgrade() {
            service.hooks.on_stop_by_error(&message);
            service.stop_client();
        }
    }
    debug!("{}{} reactor thread completed", log_tag, name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::LineDecoder;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHooks {
        addr: String,
        attempts: AtomicUsize,
    }

    impl ServiceHooks<LineDecoder> for EchoHooks {
        fn create_client(
            &self,
            disconnect_sink: Arc<dyn DisconnectSink>,
        ) -> Result<Arc<StreamClient<LineDecoder>>, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let resolved = ResolvedConfig {
                host: self.addr.split(':').next().unwrap().to_string(),
                port: self.addr.rsplit(':').next().unwrap().parse().unwrap(),
                secure: false,
                initial_buffer_bytes: 256,
                max_buffer_bytes: 1024 * 1024,
                recv_timeout: Duration::from_secs(5),
                send_timeout: Duration::from_secs(5),
                reconnect_min_gap: Duration::from_millis(60_000),
                reconnect_back_off: Duration::from_millis(10),
                log_tag: "test".into(),
            };
            StreamClient::connect(
                LogTag::new("test"),
                &resolved,
                None,
                LineDecoder::default(),
                disconnect_sink,
            )
        }
    }

    #[test]
    fn connects_invokes_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = sock.write_all(b"HI\r\n");
            thread::sleep(Duration::from_millis(200));
        });

        let hooks = Arc::new(EchoHooks {
            addr: addr.to_string(),
            attempts: AtomicUsize::new(0),
        });
        let service = StreamClientService::new(LogTag::new("test"), dummy_config(), hooks.clone());
        service.connect().unwrap();
        assert!(service.is_connected());
        assert_eq!(hooks.attempts.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(50));
        let received = service
            .invoke_client(|c| c.get_number_of_received_bytes())
            .unwrap();
        assert!(received > 0);

        service.stop();
        assert!(!service.is_connected());
        accept_thread.join().unwrap();
    }

    #[test]
    fn invoke_client_without_connection_errors() {
        let hooks = Arc::new(EchoHooks {
            addr: "127.0.0.1:1".into(),
            attempts: AtomicUsize::new(0),
        });
        let service = StreamClientService::new(LogTag::new("test"), dummy_config(), hooks);
        let err = service.invoke_client(|_c: &StreamClient<LineDecoder>| ()).unwrap_err();
        match err {
            ServiceError::NoActiveConnection => {}
            other => panic!("expected NoActiveConnection, got {:?}", other),
        }
    }

    fn dummy_config() -> ResolvedConfig {
        ResolvedConfig {
            host: "127.0.0.1".into(),
            port: 0,
            secure: false,
            initial_buffer_bytes: 256,
            max_buffer_bytes: 1024 * 1024,
            recv_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            reconnect_min_gap: Duration::from_millis(60_000),
            reconnect_back_off: Duration::from_millis(10),
            log_tag: "test".into(),
        }
    }
}
