//! Side effects of a channel process that leave the scheduler thread.

use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{SchedulerHandle, Tick};
use tether_protocol::ControlMessage;
use tether_transport::{Link, TcpAcceptor, TcpConnection, TransportError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::ChannelState;
use crate::net;

/// Longest wait for a TCP handshake with center.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener, center dialing, and process exit, as seen by the channel state.
pub trait ChannelIo: Send {
    /// Start accepting clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the client port cannot be bound.
    fn start_listening(&mut self) -> Result<(), TransportError>;

    /// Stop accepting clients. Connected clients stay connected.
    fn stop_listening(&mut self);

    fn is_listening(&self) -> bool;

    /// Dial center. The outcome arrives as a scheduler callback.
    fn dial_center(&mut self, addr: SocketAddr);

    /// Ask the process root to exit with `code`.
    fn exit(&mut self, code: i32);
}

/// [`ChannelIo`] over the TCP transport, running its tasks on a tokio runtime.
pub struct TokioChannelIo {
    runtime: Handle,
    scheduler: SchedulerHandle<ChannelState>,
    bind_addr: SocketAddr,
    listener: Option<JoinHandle<()>>,
    exit: Option<oneshot::Sender<i32>>,
}

impl TokioChannelIo {
    #[must_use]
    pub fn new(
        runtime: Handle,
        scheduler: SchedulerHandle<ChannelState>,
        bind_addr: SocketAddr,
        exit: oneshot::Sender<i32>,
    ) -> Self {
        Self {
            runtime,
            scheduler,
            bind_addr,
            listener: None,
            exit: Some(exit),
        }
    }
}

impl ChannelIo for TokioChannelIo {
    fn start_listening(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }

        let _runtime = self.runtime.enter();
        let listener = std::net::TcpListener::bind(self.bind_addr)?;
        let acceptor = TcpAcceptor::from_std(listener)?;

        self.listener = Some(self.runtime.spawn(net::accept_loop(
            acceptor,
            self.scheduler.clone(),
            ChannelState::on_client_connected,
            ChannelState::on_client_event,
        )));
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            info!("Stopped accepting clients");
        }
    }

    fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    fn dial_center(&mut self, addr: SocketAddr) {
        let scheduler = self.scheduler.clone();
        self.runtime.spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            match TcpConnection::<ControlMessage>::connect(addr, DIAL_TIMEOUT, tx).await {
                Ok(connection) => {
                    let link: std::sync::Arc<dyn Link<ControlMessage>> = connection;
                    scheduler.add_callback(
                        "center_connected",
                        move |state: &mut ChannelState, tick: &Tick| {
                            state.on_center_connected(tick, link);
                        },
                    );
                    net::forward_events(scheduler, rx, ChannelState::on_center_event);
                }
                Err(e) => {
                    let reason = e.to_string();
                    scheduler.add_callback(
                        "center_connect_failed",
                        move |state: &mut ChannelState, _: &Tick| {
                            state.on_center_connect_failed(addr, &reason);
                        },
                    );
                }
            }
        });
    }

    fn exit(&mut self, code: i32) {
        match self.exit.take() {
            Some(exit) => {
                let _ = exit.send(code);
            }
            None => debug!(code, "Exit already requested"),
        }
    }
}
