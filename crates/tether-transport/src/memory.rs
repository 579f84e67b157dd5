//! In-process connection.
//!
//! Records everything sent through it and lets a test decide when the remote
//! side answers a ping or dies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::traits::{Connection, ConnectionId, Link, Liveness, TransportError};

/// A connection that never touches the network.
pub struct MemoryConnection<M> {
    id: ConnectionId,
    liveness: Liveness,
    sent: Mutex<Vec<M>>,
    is_open: AtomicBool,
    pings: AtomicUsize,
    teardowns: AtomicUsize,
}

impl<M: Clone + Send + 'static> MemoryConnection<M> {
    /// Create an open connection with a fresh ID.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::generate(),
            liveness: Liveness::new(),
            sent: Mutex::new(Vec::new()),
            is_open: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        })
    }

    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<M> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Drain the messages sent so far.
    pub fn take_sent(&self) -> Vec<M> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    /// Simulate the remote side answering a ping.
    pub fn answer_ping(&self) {
        self.liveness.record_pong();
    }

    /// Simulate the socket dying without a teardown from this side.
    pub fn kill(&self) {
        self.is_open.store(false, Ordering::SeqCst);
    }

    /// Number of pings sent.
    #[must_use]
    pub fn pings_sent(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of times `disconnect` was called, successful or not.
    #[must_use]
    pub fn teardown_attempts(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

impl<M: Clone + Send + 'static> Connection for MemoryConnection<M> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    fn send_ping(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> bool {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.is_open.swap(false, Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

impl<M: Clone + Send + 'static> Link<M> for MemoryConnection<M> {
    fn send(&self, message: &M) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent
            .lock()
            .map_err(|_| TransportError::SendFailed("poisoned".into()))?
            .push(message.clone());
        Ok(())
    }

    fn into_connection(self: Arc<Self>) -> Arc<dyn Connection> {
        self
    }
}
