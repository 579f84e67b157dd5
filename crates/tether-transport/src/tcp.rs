//! TCP transport implementation.
//!
//! Each connection runs a reader task and a writer task. The reader decodes
//! length-prefixed frames, answers pings, records pongs, and forwards every
//! other message to the owner. The writer drains an outbound queue guarded by
//! a lock, so any thread may send.

use bytes::{Bytes, BytesMut};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_protocol::{codec, Heartbeat, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::traits::{Connection, ConnectionEvent, ConnectionId, Link, Liveness, TransportError};

/// Listening side of the TCP transport.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP transport listening on {}", addr);
        Ok(Self { listener })
    }

    /// Wrap a listener bound synchronously. Must be called inside a runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be registered with the runtime.
    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, TransportError> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        if let Ok(addr) = listener.local_addr() {
            info!("TCP transport listening on {}", addr);
        }
        Ok(Self { listener })
    }

    /// Get the local address this acceptor is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept the next connection and start its tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept<M: WireMessage>(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent<M>>,
    ) -> Result<Arc<TcpConnection<M>>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        TcpConnection::start(stream, events)
    }
}

/// A TCP connection carrying messages of type `M`.
pub struct TcpConnection<M> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    liveness: Liveness,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    is_open: AtomicBool,
    shutdown: Notify,
    _message: PhantomData<fn() -> M>,
}

impl<M: WireMessage> TcpConnection<M> {
    /// Dial a remote endpoint, giving up after `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the handshake does not finish
    /// within `limit`, or the I/O error that prevented it.
    pub async fn connect(
        addr: SocketAddr,
        limit: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent<M>>,
    ) -> Result<Arc<Self>, TransportError> {
        let stream = within(limit, async { Ok(TcpStream::connect(addr).await?) }).await?;
        debug!("Connected to {}", addr);
        Self::start(stream, events)
    }

    fn start(
        stream: TcpStream,
        events: mpsc::UnboundedSender<ConnectionEvent<M>>,
    ) -> Result<Arc<Self>, TransportError> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id: ConnectionId::generate(),
            remote_addr,
            liveness: Liveness::new(),
            outbound: Mutex::new(Some(tx)),
            is_open: AtomicBool::new(true),
            shutdown: Notify::new(),
            _message: PhantomData,
        });

        tokio::spawn(write_loop(conn.id, writer, rx));
        tokio::spawn(read_loop(Arc::clone(&conn), reader, events));

        Ok(conn)
    }

    fn send_raw(&self, data: Bytes) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TransportError::SendFailed("outbound lock poisoned".into()))?;
        match outbound.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Mark closed and release the outbound queue. Returns `true` for the
    /// caller that performed the transition.
    fn close(&self) -> bool {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return false;
        }
        // Dropping the sender lets the writer flush what is queued, then exit.
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        true
    }
}

impl<M: WireMessage> Connection for TcpConnection<M> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    fn send_ping(&self) -> Result<(), TransportError> {
        self.send(&M::ping(Some(unix_millis())))
    }

    fn disconnect(&self) -> bool {
        if !self.close() {
            return false;
        }
        self.shutdown.notify_one();
        debug!(connection = %self.id, "Disconnect requested");
        true
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

impl<M: WireMessage> Link<M> for TcpConnection<M> {
    fn send(&self, message: &M) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let data = codec::encode(message)?;
        trace!(connection = %self.id, kind = message.kind(), "Sending");
        self.send_raw(data)
    }

    fn into_connection(self: Arc<Self>) -> Arc<dyn Connection> {
        self
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(connection = %id, "Write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<M: WireMessage>(
    conn: Arc<TcpConnection<M>>,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ConnectionEvent<M>>,
) {
    let mut buf = BytesMut::with_capacity(4096);

    'read: loop {
        tokio::select! {
            _ = conn.shutdown.notified() => break 'read,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(connection = %conn.id, "Connection closed by peer");
                    break 'read;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = %conn.id, "Read failed: {}", e);
                    break 'read;
                }
            },
        }

        loop {
            match codec::decode_from::<M>(&mut buf) {
                Ok(Some(message)) => match message.heartbeat() {
                    Some(Heartbeat::Ping(timestamp)) => {
                        if let Err(e) = conn.send(&M::pong(timestamp)) {
                            warn!(connection = %conn.id, "Failed to send pong: {}", e);
                        }
                    }
                    Some(Heartbeat::Pong(_)) => {
                        conn.liveness.record_pong();
                        let _ = events.send(ConnectionEvent::Message {
                            id: conn.id,
                            message,
                        });
                    }
                    None => {
                        let _ = events.send(ConnectionEvent::Message {
                            id: conn.id,
                            message,
                        });
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = %conn.id, "Dropping connection: {}", e);
                    break 'read;
                }
            }
        }
    }

    conn.close();
    let _ = events.send(ConnectionEvent::Closed { id: conn.id });
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn within<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| TransportError::Timeout)?
}
