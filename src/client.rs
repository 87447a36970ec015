//! The Stream Client: owns one socket, the double-buffered read loop, and
//! the three families of send paths (async, synchronous, and the
//! combined send+check "request" helper).
//!
//! The read loop's algorithm is a direct port of
//! `NetworkStreamClient::Implementation::OnReadCompleted`/`StartRead`
//! (original_source). It's expressed the way the teacher's
//! `connection/half_duplex.rs` expresses an asynchronous copy loop: a
//! hand-rolled `futures::Future` whose `poll()` drives non-blocking
//! `Read`/`Write` calls in a loop until one of them reports
//! `WouldBlock`, relying on the reactor to re-poll once the socket is
//! ready again.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use bytes::Bytes;
use futures::{Async, Future, Poll};
use rustls::ClientConfig as TlsClientConfig;
use tokio_core::reactor::Handle;

use crate::buffer::BufferPair;
use crate::config::ResolvedConfig;
use crate::decoder::{Decoder, ProtocolSignal};
use crate::error::ClientError;
use crate::hexdump;
use crate::measurement::{MeasurementToken, VerboseStat};
use crate::transport::Transport;

/// Prefix added to every log line emitted for one endpoint, matching
/// `NetworkStreamClientService`'s constructor, which wraps the caller's
/// tag as `[tag] `.
#[derive(Debug, Clone, Default)]
pub struct LogTag(String);

impl LogTag {
    pub fn new<S: Into<String>>(tag: S) -> LogTag {
        let tag = tag.into();
        if tag.is_empty() {
            LogTag(String::new())
        } else {
            LogTag(format!("[{}] ", tag))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ::std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notified when the read loop gives up on the connection, either because
/// the decoder raised a protocol error or because the socket itself
/// failed. Implemented by `StreamClientService`.
pub trait DisconnectSink: Send + Sync {
    fn on_disconnect(&self, log_tag: &str, reason: ClientError);
}

/// Notified exactly once, from `StreamClient`'s `Drop` impl, when the last
/// reference to the client is released. This is the destruction handshake
/// spec.md §3/§4.E describes: the Service's condition variable wait for
/// "last reference dropped" is satisfied by this callback firing, which it
/// does precisely when the refcount this trait is attached to reaches zero
/// — in-flight completion handlers (e.g. the spawned `ReadLoop`) hold their
/// own `Arc<StreamClient<D>>` clone, so the notification is naturally
/// delayed until they've all let go.
pub trait ClientDestroySink: Send + Sync {
    fn on_client_destroy(&self);
}

/// Buffer pair and decoder, guarded by one mutex. Matches
/// `NetworkStreamClient`'s single `m_mutex`, which is held across both the
/// buffer swap and the decoder dispatch it protects
/// (`LockDataExchange`/`OnReadCompleted`).
pub struct ClientCore<D> {
    pub buffers: BufferPair,
    pub decoder: D,
}

struct PendingWrite {
    data: Bytes,
    position: usize,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

/// A single streaming connection to one gateway endpoint.
pub struct StreamClient<D> {
    transport: Mutex<Option<Transport>>,
    core: Mutex<ClientCore<D>>,
    write_queue: Mutex<VecDeque<PendingWrite>>,
    log_tag: LogTag,
    started: AtomicBool,
    stopped: AtomicBool,
    disconnect_sink: Arc<dyn DisconnectSink>,
    destroy_sink: Mutex<Option<Arc<dyn ClientDestroySink>>>,
}

impl<D: Decoder + Send + 'static> StreamClient<D> {
    /// Dials and opens the transport (spec.md §4.D: "construct ... dial
    /// and open; throws on failure"). The returned client has not yet had
    /// `start` called: its transport is still a blocking std socket, the
    /// only form the synchronous send/receive paths are valid against.
    pub fn connect(
        log_tag: LogTag,
        resolved: &ResolvedConfig,
        tls_config: Option<Arc<TlsClientConfig>>,
        decoder: D,
        disconnect_sink: Arc<dyn DisconnectSink>,
    ) -> Result<Arc<StreamClient<D>>, ClientError> {
        let transport = if resolved.secure {
            let tls_config = tls_config.ok_or_else(|| {
                ClientError::CallerError("a secure endpoint requires a TLS client config".into())
            })?;
            Transport::connect_secure(&resolved.host, resolved.port, &tls_config)?
        } else {
            Transport::connect_plain(&resolved.host, resolved.port)?
        };
        info!(
            "{}connected to {} (peer {})",
            log_tag,
            resolved.socket_addr_hint(),
            transport.peer_addr()
        );
        Ok(Arc::new(StreamClient {
            transport: Mutex::new(Some(transport)),
            core: Mutex::new(ClientCore {
                buffers: BufferPair::new(resolved.initial_buffer_bytes, resolved.max_buffer_bytes),
                decoder,
            }),
            write_queue: Mutex::new(VecDeque::new()),
            log_tag,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disconnect_sink,
            destroy_sink: Mutex::new(None),
        }))
    }

    /// Registers the callback fired from `Drop` once the last reference to
    /// this client is released. Called by `StreamClientService` right after
    /// `connect`, before `start`, so the handshake is armed for the whole
    /// lifetime of the client.
    pub fn set_destroy_sink(&self, sink: Arc<dyn ClientDestroySink>) {
        *self.destroy_sink.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    /// Arms socket timeouts (already set at `connect`), hands the
    /// transport to the reactor, runs the decoder's `on_start` hook, and
    /// fires the first asynchronous read (spec.md §4.D).
    pub fn start(self: &Arc<Self>, handle: &Handle) -> Result<(), ClientError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClientError::CallerError("start() called more than once".into()));
        }
        {
            let mut guard = self.lock_transport();
            let transport = guard
                .take()
                .expect("transport present until start() consumes it");
            *guard = Some(transport.register(handle)?);
        }
        self.core.lock().unwrap_or_else(|p| p.into_inner()).decoder.on_start();
        handle.spawn(ReadLoop { client: self.clone() });
        Ok(())
    }

    /// Shuts the transport down in both directions and closes the socket.
    /// Idempotent. Does *not* notify the disconnect sink: a caller-driven
    /// stop is distinguished from an error-driven disconnect exactly by
    /// this — the Service nils its client slot before calling `stop`, so
    /// by the time the read loop next wakes up and observes the closed
    /// transport, `stopped` is already set and `fail` becomes a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.lock().unwrap_or_else(|p| p.into_inner()).decoder.on_stop();
        if let Some(ref mut transport) = *self.lock_transport() {
            if let Err(e) = transport.close() {
                warn!("{}error closing transport: {}", self.log_tag, e);
            }
        }
    }

    pub fn get_log_tag(&self) -> &str {
        self.log_tag.as_str()
    }

    pub fn get_number_of_received_bytes(&self) -> u64 {
        self.core.lock().unwrap_or_else(|p| p.into_inner()).buffers.received_bytes()
    }

    pub fn get_received_verbose_stat(&self) -> VerboseStat {
        VerboseStat::from_bytes(self.get_number_of_received_bytes())
    }

    /// Wall-clock accessor matching `NetworkStreamClient::GetCurrentTime`:
    /// a decoder that needs to act on elapsed time outside of a
    /// `handle_new_messages` call (e.g. an idle timeout it imposes itself,
    /// per spec.md §5) reads the clock through the same accessor the Client
    /// uses internally, rather than calling `SystemTime::now()` directly.
    pub fn get_current_time(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Matches `NetworkStreamClient::StartMessageMeasurement`: lets a
    /// decoder mint its own measurement token outside the read loop (for
    /// example to time a synchronous request/response pair), rather than
    /// only ever receiving one passed in.
    pub fn start_message_measurement(&self) -> MeasurementToken {
        MeasurementToken::now()
    }

    /// Acquires the same mutex the read loop holds across a decoder
    /// dispatch, so a caller on another thread can atomically inspect and
    /// mutate protocol state alongside a concurrent arrival.
    pub fn lock_data_exchange(&self) -> MutexGuard<ClientCore<D>> {
        self.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueues `message` for asynchronous, in-order delivery. A socket
    /// error delivered while flushing the queue turns into a disconnect.
    pub fn send(&self, message: Vec<u8>) {
        self.enqueue(Bytes::from(message), None);
    }

    /// As `send`, but for a caller-owned buffer whose lifetime the caller
    /// guarantees — modeled here as a refcounted `Bytes` rather than a raw
    /// pointer, since Rust has no lifetime-erased pointer the core could
    /// safely hold onto.
    pub fn send_persistent(&self, data: Bytes) {
        self.enqueue(data, None);
    }

    /// Gathers `buffers` into one queued write and runs `on_complete`
    /// after every byte has been accepted by the kernel.
    pub fn send_scatter<F>(&self, buffers: Vec<Bytes>, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut gathered = Vec::with_capacity(buffers.iter().map(Bytes::len).sum());
        for b in buffers {
            gathered.extend_from_slice(&b);
        }
        self.enqueue(Bytes::from(gathered), Some(Box::new(on_complete)));
    }

    fn enqueue(&self, data: Bytes, on_complete: Option<Box<dyn FnOnce() + Send>>) {
        self.write_queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(PendingWrite {
                data,
                position: 0,
                on_complete,
            });
    }

    /// Blocks until `message` has been written in full. Valid only before
    /// `start()` (spec.md §4.D); fails if the write is only partially
    /// accepted within the socket's send timeout.
    pub fn send_synchronously(&self, message: &[u8], label: &str) -> Result<(), ClientError> {
        self.require_not_started(label)?;
        let mut guard = self.lock_transport();
        let transport = guard.as_mut().expect("transport present before stop()");
        transport.write_all(message).map_err(|e| {
            ClientError::Communication(io::Error::new(e.kind(), format!("{} ({})", e, label)))
        })
    }

    /// Reads at least one byte and up to `max_bytes`, never blocking past
    /// whatever the socket's receive timeout allows. Valid only before
    /// `start()`.
    pub fn receive_synchronously(&self, label: &str, max_bytes: usize) -> Result<Vec<u8>, ClientError> {
        self.require_not_started(label)?;
        let mut guard = self.lock_transport();
        let transport = guard.as_mut().expect("transport present before stop()");
        let mut buf = vec![0u8; max_bytes];
        let n = transport.read(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                ClientError::Timeout(format!("receiving {}", label))
            }
            _ => ClientError::Communication(e),
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads a response and matches it against `expected` or, if present,
    /// `error_pattern`: `Ok(true)` means `expected` matched, `Ok(false)`
    /// means `error_pattern` matched, and anything else is a protocol
    /// error carrying the offending byte offset and the expected byte.
    pub fn check_response_synchronously(
        &self,
        label: &str,
        expected: &[u8],
        error_pattern: Option<&[u8]>,
    ) -> Result<bool, ClientError> {
        let received = self.receive_synchronously(label, expected.len().max(256))?;
        if received.starts_with(expected) {
            return Ok(true);
        }
        if let Some(err_pat) = error_pattern {
            if received.starts_with(err_pat) {
                return Ok(false);
            }
        }
        let offset = received
            .iter()
            .zip(expected.iter())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| received.len().min(expected.len()));
        let expected_byte = expected.get(offset).copied().unwrap_or(0);
        let rendered = hexdump::format_protocol_error(
            self.log_tag.as_str(),
            &format!("unexpected response to {}", label),
            &received,
            offset.min(received.len().saturating_sub(1)),
            expected_byte,
        );
        error!("{}", rendered);
        Err(ClientError::Protocol {
            message: format!("unexpected response to {}", label),
            offset,
            expected: expected_byte,
        })
    }

    /// `send_synchronously` immediately followed by
    /// `check_response_synchronously`.
    pub fn request_synchronously(
        &self,
        message: &[u8],
        label: &str,
        expected: &[u8],
        error_pattern: Option<&[u8]>,
    ) -> Result<bool, ClientError> {
        self.send_synchronously(message, label)?;
        self.check_response_synchronously(label, expected, error_pattern)
    }

    fn require_not_started(&self, label: &str) -> Result<(), ClientError> {
        if self.started.load(Ordering::Acquire) {
            return Err(ClientError::CallerError(format!(
                "{} attempted after start(): synchronous I/O is pre-start only",
                label
            )));
        }
        Ok(())
    }

    fn lock_transport(&self) -> MutexGuard<Option<Transport>> {
        self.transport.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drains as much of the write queue as the socket will currently
    /// accept, in submission order, regardless of which `send*` overload
    /// queued each entry (spec.md §5 ordering guarantee #3).
    fn flush_writes(&self, transport: &mut Transport) -> Result<(), ClientError> {
        loop {
            let mut queue = self.write_queue.lock().unwrap_or_else(|p| p.into_inner());
            let mut front = match queue.pop_front() {
                Some(w) => w,
                None => return Ok(()),
            };
            drop(queue);

            loop {
                match transport.write(&front.data[front.position..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        front.position += n;
                        if front.position >= front.data.len() {
                            if let Some(cb) = front.on_complete.take() {
                                cb();
                            }
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.write_queue
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push_front(front);
                        return Ok(());
                    }
                    Err(e) => return Err(ClientError::Communication(e)),
                }
            }
        }
    }

    /// One pass of the read loop: flush pending writes, then read and
    /// dispatch until the socket reports `WouldBlock`. Returns
    /// `Async::Ready(())` only when the loop should stop for good (the
    /// peer closed the connection); `WouldBlock` on read yields
    /// `Async::NotReady`, the normal steady-state outcome.
    fn drive(&self) -> Poll<(), ClientError> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(Async::Ready(()));
        }
        let mut transport_guard = self.lock_transport();
        let transport = transport_guard
            .as_mut()
            .expect("transport present for the lifetime of the read loop");
        self.flush_writes(transport)?;

        loop {
            let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());

            let transfer_begin = core.buffers.active().offset();
            let n = match transport.read(core.buffers.active_mut().write_target()) {
                Ok(0) => {
                    return Err(ClientError::Communication(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )));
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Async::NotReady),
                Err(e) => return Err(ClientError::Communication(e)),
            };
            // Single origin timestamp for this read completion: taken
            // together, immediately after the read succeeds and before any
            // boundary search or buffer-growth bookkeeping runs, so both
            // values the decoder sees describe the same instant (spec.md
            // §4.D "Latency attribution").
            let measurement = MeasurementToken::now();
            let now = SystemTime::now();
            let transfer_end = transfer_begin + n;

            let last_byte_end = {
                let buf = core.buffers.active().as_slice();
                core.decoder
                    .find_last_message_last_byte(buf, 0, transfer_begin, transfer_end)
                    .map_err(|sig| {
                        self.protocol_error(core.buffers.active().as_slice(), sig)
                    })?
            };

            let outcome = core
                .buffers
                .on_read_completed(n, |_b, _from, _to| last_byte_end, self.log_tag.as_str())?;

            if let Some(last_byte_inclusive) = outcome.dispatch_upto {
                let ClientCore {
                    ref buffers,
                    ref mut decoder,
                } = *core;
                let buf = buffers.next().as_slice();
                decoder
                    .handle_new_messages(now, buf, 0, last_byte_inclusive, measurement)
                    .map_err(|sig| self.protocol_error(buf, sig))?;
            }
        }
    }

    fn protocol_error(&self, buf: &[u8], sig: ProtocolSignal) -> ClientError {
        let rendered =
            hexdump::format_protocol_error(self.log_tag.as_str(), &sig.message, buf, sig.offset, sig.expected);
        error!("{}", rendered);
        ClientError::Protocol {
            message: sig.message,
            offset: sig.offset,
            expected: sig.expected,
        }
    }

    /// Shared tail of both the error path and (indirectly, via `stop`'s
    /// idempotence guard) the caller-initiated path: closes the
    /// transport, logs how much was received, and — only on the error
    /// path, since `stop()` already set `stopped` first — notifies the
    /// service.
    fn fail(&self, reason: ClientError) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ref mut transport) = *self.lock_transport() {
            let _ = transport.close();
        }
        let stat = self.get_received_verbose_stat();
        error!("{}connection lost after receiving {}: {}", self.log_tag, stat, reason);
        self.disconnect_sink.on_disconnect(self.log_tag.as_str(), reason);
    }
}

impl<D> Drop for StreamClient<D> {
    /// The synchronization point that makes "client gone" observable from
    /// another thread (spec.md §4.E "Client destruction handshake"). Runs
    /// exactly once, when the last `Arc<StreamClient<D>>` is released.
    fn drop(&mut self) {
        if let Some(sink) = self.destroy_sink.lock().unwrap_or_else(|p| p.into_inner()).take() {
            sink.on_client_destroy();
        }
    }
}

/// The future spawned onto the reactor by `StreamClient::start`. Lives for
/// the duration of the connection; ends the moment `drive` reports either
/// success (peer-initiated close, which `drive` surfaces as an `Err` —
/// see below) or a hard error.
struct ReadLoop<D> {
    client: Arc<StreamClient<D>>,
}

impl<D: Decoder + Send + 'static> Future for ReadLoop<D> {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        match self.client.drive() {
            Ok(Async::Ready(())) => Ok(Async::Ready(())),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(reason) => {
                self.client.fail(reason);
                Ok(Async::Ready(()))
            }
        }
    }
}
