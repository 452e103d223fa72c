//! # System event bus and its dispatcher.
//!
//! ```text
//! posters (many)                 dispatcher (one)
//!   broker loop ──┐
//!   leaf tasks  ──┼──► EventBus ──► dispatch ──┬──► leaf mailbox (by name)
//!   web / API   ──┘   (bounded mpsc)            ├──► keepalive timer / status
//!                                               └──► maintenance collaborator
//! ```
//!
//! Events reach the dispatcher in post order. Routing a `ParamChangeRequest`
//! into a leaf mailbox waits without bound, so a leaf that never drains its
//! mailbox eventually stalls delivery to every leaf.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::context::{Context, Status};
use crate::error::{GrowError, Result};
use crate::event::{Delivery, Event, EventKind};
use crate::journal::EntryKind;

/// Longest a lossy post waits on a saturated bus.
pub const LOSSY_POST_WAIT: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    /// Creates the bus and the receiver its single dispatcher consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue an event. Lossy kinds give up after [`LOSSY_POST_WAIT`];
    /// everything else waits for room.
    pub async fn post(&self, ev: Event) -> Result<()> {
        let kind = ev.kind;
        match kind.delivery() {
            Delivery::Lossy => match timeout(LOSSY_POST_WAIT, self.tx.send(ev)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(GrowError::EventNotSent(format!("{kind}: bus closed"))),
                Err(_) => Err(GrowError::EventNotSent(format!("{kind}: bus saturated"))),
            },
            Delivery::Guaranteed => self
                .tx
                .send(ev)
                .await
                .map_err(|_| GrowError::EventNotSent(format!("{kind}: bus closed"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Single consumer of the bus. Intended to be `tokio::spawn`-ed by
/// [`Context::init`].
pub(crate) async fn dispatch(ctx: Context, mut rx: mpsc::Receiver<Event>) {
    debug!("dispatcher started");
    while let Some(ev) = rx.recv().await {
        handle(&ctx, ev).await;
    }
    debug!("dispatcher stopped");
}

pub(crate) async fn handle(ctx: &Context, ev: Event) {
    match ev.kind {
        // ── Connectivity ─────────────────────────────────────────────
        EventKind::NetworkConnected => {
            info!("network connected");
            ctx.journal(EntryKind::System, "network connected").await;
        }
        EventKind::NetworkDisconnected => {
            warn!("network disconnected");
            ctx.mark_connectivity_lost(Status::NetworkError).await;
            ctx.stop_keepalive().await;
            ctx.fan_out(&ev).await;
            ctx.journal(EntryKind::Error, "network disconnected").await;
        }
        EventKind::ServerConnected => {
            info!("broker connected");
            ctx.restore_connectivity().await;
            if ctx.status().await == Status::Started {
                ctx.announce(None);
                ctx.start_keepalive().await;
            }
            ctx.journal(EntryKind::System, "broker connected").await;
        }
        EventKind::ServerDisconnected => {
            warn!("broker disconnected");
            ctx.mark_connectivity_lost(Status::ServerError).await;
            ctx.stop_keepalive().await;
            ctx.fan_out(&ev).await;
            ctx.journal(EntryKind::Error, "broker disconnected").await;
        }

        // ── Node lifecycle ───────────────────────────────────────────
        EventKind::NodeStarted => {
            if ctx.status().await == Status::Started {
                ctx.start_keepalive().await;
            }
            ctx.journal(EntryKind::System, "node started").await;
        }
        EventKind::KeepaliveTick => {
            ctx.announce(None);
            ctx.publish_all_leaves().await;
        }
        EventKind::LeafAdded => {
            debug!(leaf = ?ev.leaf, "leaf added");
        }
        EventKind::DisplayLog => {
            ctx.journal(EntryKind::Log, ev.payload_str()).await;
        }

        // ── Parameters ───────────────────────────────────────────────
        EventKind::ParamChangeRequest => {
            if let Err(e) = ctx.route(ev).await {
                warn!(label = e.as_label(), "change request dropped: {e}");
            }
        }
        EventKind::ParamChanged => ctx.notify(ev).await,

        // ── Maintenance ──────────────────────────────────────────────
        EventKind::RebootRequest => {
            ctx.journal(EntryKind::System, "reboot requested").await;
            ctx.announce(Some("reboot"));
            ctx.maintenance().reboot().await;
        }
        EventKind::UpdateRequest => {
            ctx.journal(EntryKind::System, "firmware update requested").await;
            ctx.announce(Some("ota"));
            ctx.maintenance().start_update().await;
        }
        EventKind::ResetRequest => {
            ctx.journal(EntryKind::System, "factory reset requested").await;
            ctx.announce(Some("reset"));
            if let Err(e) = ctx.store().erase().await {
                error!("factory reset could not erase store: {e}");
            }
            ctx.maintenance().factory_reset().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
