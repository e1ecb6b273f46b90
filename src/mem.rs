//! In-memory loopback transport for tests and overlay simulation.
//!
//! A [`MemNetwork`] is a registry of attached transports addressed by opaque
//! strings. Dialing creates a pair of linked sessions over unbounded channel
//! queues, delivered on both sides' event streams exactly like a real
//! transport would deliver dialed and accepted connections.
//!
//! Dialed links present an ephemeral source address (`addr#seq`) to the
//! acceptor, mirroring the ephemeral source ports of stream transports; this
//! makes address reconciliation behave identically to production.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::transport::{ConnReceiver, ConnSender, Frame, Session, SessionEvents, Transport};

/// Registry of in-process transports, keyed by address.
pub struct MemNetwork {
    weak_self: Weak<MemNetwork>,
    attached: Mutex<HashMap<String, Weak<MemTransport>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            attached: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a transport at `addr` and return it with its session event
    /// stream. An existing attachment at the same address is replaced.
    pub fn attach(&self, addr: &str) -> (Arc<MemTransport>, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MemTransport {
            network: self.weak_self.clone(),
            local: addr.to_owned(),
            seq: AtomicU64::new(0),
            dials: AtomicUsize::new(0),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events: events_tx,
        });
        self.attached
            .lock()
            .expect("network registry poisoned")
            .insert(addr.to_owned(), Arc::downgrade(&transport));
        (transport, events_rx)
    }

    fn lookup(&self, addr: &str) -> Option<Arc<MemTransport>> {
        self.attached
            .lock()
            .expect("network registry poisoned")
            .get(addr)
            .and_then(Weak::upgrade)
    }
}

/// One endpoint on a [`MemNetwork`].
pub struct MemTransport {
    network: Weak<MemNetwork>,
    local: String,
    seq: AtomicU64,
    dials: AtomicUsize,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    events: mpsc::UnboundedSender<Arc<Session>>,
}

impl MemTransport {
    /// Number of outbound dials attempted, successful or not. Useful for
    /// asserting reachability probes in simulations.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn track(&self, key: String, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(key.clone(), session.clone());

        // Drop the map entry when the session dies, unless a newer session
        // has already taken the key.
        let map = self.sessions.clone();
        tokio::spawn(async move {
            session.cancellation().cancelled().await;
            let mut sessions = map.lock().expect("session map poisoned");
            if let Some(current) = sessions.get(&key) {
                if Arc::ptr_eq(current, &session) {
                    sessions.remove(&key);
                }
            }
        });
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<Session>, ProtocolError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let remote = self
            .network
            .upgrade()
            .and_then(|network| network.lookup(addr))
            .ok_or_else(|| {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no transport attached at {addr}"),
                ))
            })?;

        let source = format!(
            "{}#{}",
            self.local,
            self.seq.fetch_add(1, Ordering::Relaxed)
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (back_tx, back_rx) = mpsc::unbounded_channel();

        let local_session = Session::spawn(
            addr.to_owned(),
            Box::new(MemSender::new(out_tx)),
            Box::new(MemReceiver { rx: back_rx }),
        );
        let remote_session = Session::spawn(
            source.clone(),
            Box::new(MemSender::new(back_tx)),
            Box::new(MemReceiver { rx: out_rx }),
        );

        // Both ends see the new session on their event streams, like a
        // socket transport delivering connect and accept.
        self.track(addr.to_owned(), local_session.clone());
        let _ = self.events.send(local_session.clone());

        remote.track(source, remote_session.clone());
        let _ = remote.events.send(remote_session);

        Ok(local_session)
    }

    fn session_to(&self, addr: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(addr)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

struct MemSender {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl MemSender {
    fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl ConnSender for MemSender {
    async fn send(&self, frame: Frame) -> io::Result<()> {
        let tx = self.tx.lock().expect("sender poisoned").clone();
        match tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    async fn close(&self) {
        self.tx.lock().expect("sender poisoned").take();
    }
}

struct MemReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl ConnReceiver for MemReceiver {
    async fn recv(&mut self) -> io::Result<Frame> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "link closed"))
    }
}
