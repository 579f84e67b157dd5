//! Glue between transport tasks and a scheduler.
//!
//! Network tasks never touch process state. Every accepted connection and
//! every event it produces becomes a scheduler callback, in arrival order.

use std::sync::Arc;
use std::time::Duration;
use tether_core::{SchedulerHandle, Tick};
use tether_protocol::{ProtocolError, WireMessage};
use tether_transport::{Connection, ConnectionEvent, Link, TcpAcceptor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;

/// Scheduler entry point receiving a new connection.
pub type OnConnected<S, M> = fn(&mut S, &Tick, Arc<dyn Link<M>>);

/// Scheduler entry point receiving a connection event.
pub type OnEvent<S, M> = fn(&mut S, &Tick, ConnectionEvent<M>);

/// Drop a link that sent `kind` where the receiver cannot handle it.
///
/// The peer is broken or hostile; only its connection goes, the process
/// carries on.
pub fn drop_unexpected<C: Connection + ?Sized>(link: &C, kind: &'static str, context: &str) {
    let error = ProtocolError::Unexpected(format!("{kind} {context}"));
    warn!(connection = %link.id(), addr = ?link.remote_addr(), "Dropping connection: {}", error);
    metrics::record_protocol_violation(kind);
    link.disconnect();
}

/// Forward the events of one connection into the scheduler.
pub fn forward_events<S: 'static, M: WireMessage>(
    scheduler: SchedulerHandle<S>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent<M>>,
    deliver: OnEvent<S, M>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let label = match &event {
                ConnectionEvent::Message { message, .. } => message.kind(),
                ConnectionEvent::Closed { .. } => "connection_closed",
            };
            let enqueued = Instant::now();
            let queued = scheduler.add_callback(label, move |state: &mut S, tick: &Tick| {
                metrics::record_dispatch_delay(tick.since(enqueued));
                deliver(state, tick, event);
            });
            if !queued {
                debug!("Scheduler stopped, no longer forwarding events");
                break;
            }
        }
    })
}

/// Accept connections until the task is aborted.
///
/// The connection is handed to the scheduler before any of its events, so
/// the owner always knows a connection by the time it hears from it.
pub async fn accept_loop<S: 'static, M: WireMessage>(
    acceptor: TcpAcceptor,
    scheduler: SchedulerHandle<S>,
    on_connected: OnConnected<S, M>,
    deliver: OnEvent<S, M>,
) {
    loop {
        let (tx, rx) = mpsc::unbounded_channel();
        match acceptor.accept::<M>(tx).await {
            Ok(connection) => {
                let link: Arc<dyn Link<M>> = connection;
                let queued = scheduler.add_callback("accepted", move |state: &mut S, tick: &Tick| {
                    on_connected(state, tick, link);
                });
                if !queued {
                    break;
                }
                forward_events(scheduler.clone(), rx, deliver);
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
