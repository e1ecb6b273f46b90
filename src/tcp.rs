//! TCP transport with length-prefixed frames.
//!
//! Frame layout on the stream, all integers little-endian:
//!
//! ```text
//! len(u32) || mux(u64) || opcode(u8) || flags(u8) || payload
//! ```
//!
//! `len` covers everything after itself; `flags` bit 0 is the reply flag.
//! Frames are size-capped so a hostile peer cannot force large allocations.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::transport::{ConnReceiver, ConnSender, Frame, Session, SessionEvents, Transport};

/// Frame header bytes following the length prefix.
const HEADER_LEN: usize = 8 + 1 + 1;

/// Largest accepted frame body (header + payload).
const MAX_FRAME_LEN: usize = 1024 * 1024;

const FLAG_REPLY: u8 = 0x01;

/// A TCP endpoint: accept loop plus outbound dialing.
pub struct TcpTransport {
    local: String,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    events: mpsc::UnboundedSender<Arc<Session>>,
}

impl TcpTransport {
    /// Bind a listener and start accepting. Accepted and dialed sessions are
    /// both delivered on the returned event stream.
    pub async fn bind(addr: &str) -> io::Result<(Arc<Self>, SessionEvents)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?.to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            local,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events: events_tx,
        });

        let acceptor = transport.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        acceptor.wrap(stream, peer.to_string());
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok((transport, events_rx))
    }

    fn wrap(&self, stream: TcpStream, remote_addr: String) -> Arc<Session> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let session = Session::spawn(
            remote_addr.clone(),
            Box::new(TcpSender {
                write: tokio::sync::Mutex::new(write_half),
            }),
            Box::new(TcpReceiver { read: read_half }),
        );

        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(remote_addr.clone(), session.clone());
        let map = self.sessions.clone();
        let tracked = session.clone();
        tokio::spawn(async move {
            tracked.cancellation().cancelled().await;
            let mut sessions = map.lock().expect("session map poisoned");
            if let Some(current) = sessions.get(&remote_addr) {
                if Arc::ptr_eq(current, &tracked) {
                    sessions.remove(&remote_addr);
                }
            }
        });

        let _ = self.events.send(session.clone());
        session
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<Session>, ProtocolError> {
        let stream = TcpStream::connect(addr).await.map_err(ProtocolError::Io)?;
        // Key dialed sessions by the address we dialed so reuse and address
        // reconciliation compare against the peer's advertised form.
        Ok(self.wrap(stream, addr.to_owned()))
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

struct TcpSender {
    write: tokio::sync::Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl ConnSender for TcpSender {
    async fn send(&self, frame: Frame) -> io::Result<()> {
        if HEADER_LEN + frame.payload.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame exceeds size limit",
            ));
        }
        let mut buf = Vec::with_capacity(4 + HEADER_LEN + frame.payload.len());
        buf.extend_from_slice(&((HEADER_LEN + frame.payload.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&frame.mux.to_le_bytes());
        buf.push(frame.opcode);
        buf.push(if frame.reply { FLAG_REPLY } else { 0 });
        buf.extend_from_slice(&frame.payload);

        let mut write = self.write.lock().await;
        write.write_all(&buf).await
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

struct TcpReceiver {
    read: OwnedReadHalf,
}

#[async_trait]
impl ConnReceiver for TcpReceiver {
    async fn recv(&mut self) -> io::Result<Frame> {
        let mut len_bytes = [0u8; 4];
        self.read.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} out of bounds"),
            ));
        }

        let mut body = vec![0u8; len];
        self.read.read_exact(&mut body).await?;

        let mut mux_bytes = [0u8; 8];
        mux_bytes.copy_from_slice(&body[..8]);
        Ok(Frame {
            mux: u64::from_le_bytes(mux_bytes),
            opcode: body[8],
            reply: body[9] & FLAG_REPLY != 0,
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_the_stream() {
        let (server, mut server_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");
        let (client, _client_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");

        let dialed = client
            .dial(&server.local_addr())
            .await
            .expect("dial failed");
        let accepted = server_events.recv().await.expect("no accepted session");

        let mut queue = accepted.recv_queue(0x04).expect("queue already claimed");
        let mut mux = dialed.mux();
        mux.send(0x04, vec![0xde, 0xad, 0xbe, 0xef]).await.unwrap();

        let request = queue.recv().await.expect("request lost");
        assert_eq!(request.bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        request.reply(0x04, b"ok".to_vec()).await.unwrap();

        assert_eq!(mux.recv(0x04).await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn dialed_sessions_are_reusable_by_address() {
        let (server, _server_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");
        let (client, _client_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");

        let addr = server.local_addr();
        assert!(client.session_to(&addr).is_none());
        let dialed = client.dial(&addr).await.expect("dial failed");
        let found = client.session_to(&addr).expect("session not tracked");
        assert!(Arc::ptr_eq(&dialed, &found));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_locally() {
        let (server, _server_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");
        let (client, _client_events) = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("bind failed");

        let dialed = client.dial(&server.local_addr()).await.expect("dial failed");
        let mux = dialed.mux();
        let err = mux.send(0x04, vec![0u8; MAX_FRAME_LEN + 1]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
