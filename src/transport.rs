//! Session layer consumed by the peer protocol.
//!
//! The core never touches sockets directly. A [`Transport`] hands out
//! [`Session`]s over any framed, authenticated point-to-point link; the
//! session owns the demultiplexing pump, cancellation, and the hook surface
//! the handshake installs:
//!
//! - [`Session::mux`] opens a dedicated request channel for one RPC.
//!   Responses are routed back to the issuing mux by the frame's `reply`
//!   flag, so concurrent RPCs in both directions never collide.
//! - [`Session::recv_queue`] yields the long-lived inbound queue of
//!   [`Wire`] reply handles for one opcode, consumed by the per-session
//!   server loop.
//! - [`Session::intercept_errors`] registers callbacks fired once with the
//!   terminal [`ProtocolError`] when the session dies.
//! - [`Session::after_recv`] registers callbacks fired on every inbound
//!   frame (the protocol uses this to refresh routing-table positions).
//! - [`Session::register_signal`] / [`Session::wait_for_signal`] provide
//!   latched one-shot events (handshake completion).
//!
//! Implementations of the raw link ([`ConnSender`]/[`ConnReceiver`]) live in
//! [`crate::mem`] and [`crate::tcp`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ProtocolError;

/// One message on a session: a mux channel id, an opcode, a direction flag,
/// and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel id allocated by the requester; responses echo it back.
    pub mux: u64,
    pub opcode: u8,
    /// Responses carry `true` and are routed to the requester's mux;
    /// requests carry `false` and land in the session-level opcode queue.
    pub reply: bool,
    pub payload: Vec<u8>,
}

/// Sending half of a raw framed link. Must tolerate concurrent senders.
#[async_trait]
pub trait ConnSender: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> io::Result<()>;
    async fn close(&self);
}

/// Receiving half of a raw framed link, owned by the session pump.
#[async_trait]
pub trait ConnReceiver: Send + 'static {
    async fn recv(&mut self) -> io::Result<Frame>;
}

/// A transport the protocol can dial through and query for open sessions.
///
/// Implementations additionally deliver every new session, dialed or
/// accepted, on an event stream consumed by `Protocol::serve` so the
/// handshake runs exactly once per session on both ends.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Arc<Session>, ProtocolError>;

    /// A session already open to `addr`, if the transport tracks one.
    fn session_to(&self, addr: &str) -> Option<Arc<Session>>;

    /// The address remote peers can reach this transport at.
    fn local_addr(&self) -> String;
}

/// Stream of freshly established sessions emitted by a transport.
pub type SessionEvents = mpsc::UnboundedReceiver<Arc<Session>>;

type ErrorHook = Box<dyn Fn(&ProtocolError) + Send + Sync>;
type RecvHook = Box<dyn Fn() + Send + Sync>;

struct Gate {
    set: AtomicBool,
    notify: Notify,
}

/// Emitter half of a latched session signal.
pub struct Signal {
    gate: Arc<Gate>,
}

impl Signal {
    /// Latch the signal; all current and future waiters proceed.
    pub fn emit(&self) {
        self.gate.set.store(true, Ordering::Release);
        self.gate.notify.notify_waiters();
    }
}

struct InboundQueue {
    tx: mpsc::UnboundedSender<Wire>,
    rx: Option<mpsc::UnboundedReceiver<Wire>>,
}

/// An authenticated point-to-point session with a live demux pump.
pub struct Session {
    remote_addr: String,
    weak_self: Weak<Session>,
    tx: Box<dyn ConnSender>,
    cancel: CancellationToken,
    closed: AtomicBool,
    next_mux: AtomicU64,
    muxes: Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
    inbound: Mutex<HashMap<u8, InboundQueue>>,
    error_hooks: Mutex<Vec<ErrorHook>>,
    recv_hooks: Mutex<Vec<RecvHook>>,
    signals: Mutex<HashMap<String, Arc<Gate>>>,
}

impl Session {
    /// Wrap a raw link and start the demux pump for its lifetime.
    pub fn spawn(
        remote_addr: String,
        tx: Box<dyn ConnSender>,
        mut rx: Box<dyn ConnReceiver>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak| Self {
            remote_addr,
            weak_self: weak.clone(),
            tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_mux: AtomicU64::new(1),
            muxes: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            error_hooks: Mutex::new(Vec::new()),
            recv_hooks: Mutex::new(Vec::new()),
            signals: Mutex::new(HashMap::new()),
        });

        let pump = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump.cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Ok(frame) => pump.dispatch(frame),
                        Err(err) => {
                            pump.shutdown(ProtocolError::Io(err));
                            break;
                        }
                    }
                }
            }
            pump.tx.close().await;
            // Queued wires hold weak session refs, but drop them anyway so
            // buffered payloads are released promptly.
            pump.inbound.lock().expect("inbound lock poisoned").clear();
            pump.muxes.lock().expect("mux lock poisoned").clear();
        });

        session
    }

    /// The remote endpoint of the underlying link. For dialed sessions this
    /// is the dialed address; for accepted sessions the peer's ephemeral
    /// source address.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Open a dedicated request channel.
    pub fn mux(&self) -> Mux {
        let id = self.next_mux.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.muxes
            .lock()
            .expect("mux lock poisoned")
            .insert(id, tx);
        Mux {
            id,
            session: self.weak_self.clone(),
            rx,
        }
    }

    /// Claim the long-lived inbound queue for `opcode`. Returns `None` if it
    /// was already claimed; frames arriving before the claim are buffered.
    pub fn recv_queue(&self, opcode: u8) -> Option<mpsc::UnboundedReceiver<Wire>> {
        let mut inbound = self.inbound.lock().expect("inbound lock poisoned");
        inbound
            .entry(opcode)
            .or_insert_with(new_inbound_queue)
            .rx
            .take()
    }

    /// Register a callback fired once with the terminal error when the
    /// session closes. Registering on an already-closed session fires the
    /// callback immediately with [`ProtocolError::Disconnect`], so cleanup
    /// logic cannot be skipped by losing a close race.
    pub fn intercept_errors(&self, hook: ErrorHook) {
        {
            // `shutdown` flips `closed` before draining under this lock, so
            // a hook pushed while the flag is clear is guaranteed to drain.
            let mut hooks = self.error_hooks.lock().expect("error hook lock poisoned");
            if !self.is_closed() {
                hooks.push(hook);
                return;
            }
        }
        hook(&ProtocolError::Disconnect);
    }

    /// Register a callback fired on every inbound frame.
    pub fn after_recv(&self, hook: RecvHook) {
        self.recv_hooks
            .lock()
            .expect("recv hook lock poisoned")
            .push(hook);
    }

    /// Create (or fetch) the named latched signal and return its emitter.
    pub fn register_signal(&self, name: &str) -> Signal {
        Signal {
            gate: self.gate(name),
        }
    }

    /// Wait until the named signal has been emitted.
    pub async fn wait_for_signal(&self, name: &str) {
        let gate = self.gate(name);
        let notified = gate.notify.notified();
        if gate.set.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    fn gate(&self, name: &str) -> Arc<Gate> {
        let mut signals = self.signals.lock().expect("signal lock poisoned");
        signals
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(Gate {
                    set: AtomicBool::new(false),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Session-scoped cancellation, triggered by disconnect or link failure.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Error interceptors fire with the given cause,
    /// or [`ProtocolError::Disconnect`] when none is supplied, so registry
    /// cleanup always runs.
    pub fn disconnect(&self, err: Option<ProtocolError>) {
        self.shutdown(err.unwrap_or(ProtocolError::Disconnect));
    }

    fn shutdown(&self, err: ProtocolError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = {
            let mut hooks = self.error_hooks.lock().expect("error hook lock poisoned");
            std::mem::take(&mut *hooks)
        };
        for hook in &hooks {
            hook(&err);
        }
        self.cancel.cancel();
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Disconnect);
        }
        self.tx.send(frame).await.map_err(ProtocolError::Io)
    }

    fn dispatch(&self, frame: Frame) {
        {
            let hooks = self.recv_hooks.lock().expect("recv hook lock poisoned");
            for hook in hooks.iter() {
                hook();
            }
        }

        if frame.reply {
            let muxes = self.muxes.lock().expect("mux lock poisoned");
            if let Some(tx) = muxes.get(&frame.mux) {
                let _ = tx.send(frame);
            } else {
                trace!(addr = %self.remote_addr, "dropping reply for closed mux");
            }
            return;
        }

        let wire = Wire {
            mux: frame.mux,
            payload: frame.payload,
            session: self.weak_self.clone(),
        };
        let mut inbound = self.inbound.lock().expect("inbound lock poisoned");
        let queue = inbound.entry(frame.opcode).or_insert_with(new_inbound_queue);
        let _ = queue.tx.send(wire);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn new_inbound_queue() -> InboundQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    InboundQueue { tx, rx: Some(rx) }
}

/// A dedicated request channel. Dropped at the end of the RPC, which
/// unregisters it from the session.
pub struct Mux {
    id: u64,
    session: Weak<Session>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Mux {
    pub async fn send(&self, opcode: u8, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let session = self.session.upgrade().ok_or(ProtocolError::Disconnect)?;
        session
            .send_frame(Frame {
                mux: self.id,
                opcode,
                reply: false,
                payload,
            })
            .await
    }

    /// Next response payload with the given opcode; frames with other
    /// opcodes on this channel are skipped. `None` once the session closes.
    pub async fn recv(&mut self, opcode: u8) -> Option<Vec<u8>> {
        while let Some(frame) = self.rx.recv().await {
            if frame.opcode == opcode {
                return Some(frame.payload);
            }
        }
        None
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            if let Ok(mut muxes) = session.muxes.lock() {
                muxes.remove(&self.id);
            }
        }
    }
}

/// An inbound request plus the handle to answer it on the requester's mux.
pub struct Wire {
    mux: u64,
    payload: Vec<u8>,
    session: Weak<Session>,
}

impl Wire {
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub async fn reply(&self, opcode: u8, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let session = self.session.upgrade().ok_or(ProtocolError::Disconnect)?;
        session
            .send_frame(Frame {
                mux: self.mux,
                opcode,
                reply: true,
                payload,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemNetwork;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn linked_pair() -> (Arc<Session>, Arc<Session>) {
        let network = MemNetwork::new();
        let (a, _a_events) = network.attach("a");
        let (_b, mut b_events) = network.attach("b");
        let dialer_side = a.dial("b").await.expect("dial failed");
        let acceptor_side = b_events.recv().await.expect("no accepted session");
        (dialer_side, acceptor_side)
    }

    #[tokio::test]
    async fn request_and_reply_route_between_mux_and_queue() {
        let (client, server) = linked_pair().await;

        let mut queue = server.recv_queue(0x03).expect("queue already claimed");
        let mut mux = client.mux();
        mux.send(0x03, b"ping".to_vec()).await.unwrap();

        let wire = queue.recv().await.expect("no inbound wire");
        assert_eq!(wire.bytes(), b"ping");
        wire.reply(0x03, b"pong".to_vec()).await.unwrap();

        let payload = mux.recv(0x03).await.expect("no reply");
        assert_eq!(payload, b"pong");
    }

    #[tokio::test]
    async fn concurrent_muxes_with_same_ids_do_not_collide() {
        let (left, right) = linked_pair().await;

        // Both ends allocate mux id 1; the reply flag keeps each request in
        // the peer's server queue and each response in the issuer's mux.
        let mut left_queue = left.recv_queue(0x03).unwrap();
        let mut right_queue = right.recv_queue(0x03).unwrap();

        let mut left_mux = left.mux();
        let mut right_mux = right.mux();
        left_mux.send(0x03, b"from-left".to_vec()).await.unwrap();
        right_mux.send(0x03, b"from-right".to_vec()).await.unwrap();

        let at_right = right_queue.recv().await.unwrap();
        assert_eq!(at_right.bytes(), b"from-left");
        at_right.reply(0x03, b"right-answers".to_vec()).await.unwrap();

        let at_left = left_queue.recv().await.unwrap();
        assert_eq!(at_left.bytes(), b"from-right");
        at_left.reply(0x03, b"left-answers".to_vec()).await.unwrap();

        assert_eq!(left_mux.recv(0x03).await.unwrap(), b"right-answers");
        assert_eq!(right_mux.recv(0x03).await.unwrap(), b"left-answers");
    }

    #[tokio::test]
    async fn frames_buffered_before_queue_claim() {
        let (client, server) = linked_pair().await;

        let mux = client.mux();
        mux.send(0x04, b"early".to_vec()).await.unwrap();

        // Give the pump a moment to deliver before the queue is claimed.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut queue = server.recv_queue(0x04).expect("queue already claimed");
        let wire = queue.recv().await.expect("buffered frame lost");
        assert_eq!(wire.bytes(), b"early");
    }

    #[tokio::test]
    async fn disconnect_fires_interceptors_once_with_cause() {
        let (client, _server) = linked_pair().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.intercept_errors(Box::new(move |err| {
            sink.lock().unwrap().push(err.is_timeout());
        }));

        client.disconnect(Some(ProtocolError::Timeout("probe")));
        client.disconnect(None); // second disconnect is a no-op

        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert!(client.is_closed());
        assert!(client.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn peer_disconnect_surfaces_as_link_error() {
        let (client, server) = linked_pair().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        client.intercept_errors(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        server.disconnect(None);

        tokio::time::timeout(Duration::from_secs(1), client.cancellation().cancelled())
            .await
            .expect("client never noticed peer disconnect");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn after_recv_hook_fires_per_frame() {
        let (client, server) = linked_pair().await;

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        server.after_recv(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mux = client.mux();
        mux.send(0x03, Vec::new()).await.unwrap();
        mux.send(0x03, Vec::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn signals_latch_for_late_waiters() {
        let (client, _server) = linked_pair().await;

        let signal = client.register_signal("handshake");
        signal.emit();

        // A waiter arriving after the emit must not block.
        tokio::time::timeout(Duration::from_millis(100), client.wait_for_signal("handshake"))
            .await
            .expect("latched signal did not release waiter");
    }
}
