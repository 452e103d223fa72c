//! Shared fixtures for unit tests: in-memory contexts and a probe leaf.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::{BrokerHandle, Outbound};
use crate::context::Context;
use crate::event::{Event, EventKind};
use crate::leaf::{Descriptor, LeafHandle, LeafTask, LeafType, Mailbox};
use crate::leaves::{apply_change_request, log_rejected};
use crate::maintenance::RecordingMaintenance;
use crate::param::{Access, Storage};
use crate::protocol::Topics;
use crate::settings::Settings;
use crate::store::Store;

pub(crate) fn test_settings() -> Settings {
    let mut s = Settings::default();
    s.node.name = "testnode".to_string();
    s.node.base_topic = "test".to_string();
    s.store.url = "sqlite::memory:".to_string();
    s.mqtt.outbox_capacity = 256;
    s.runtime.leaf_poll_ms = 10;
    s.runtime.leaf_yield_ms = 1;
    s
}

async fn build(
    settings: Settings,
    store: Store,
) -> (Context, mpsc::Receiver<Outbound>, Arc<RecordingMaintenance>) {
    let (broker, outbox) = BrokerHandle::channel(
        Topics::new(&settings.node.base_topic),
        settings.mqtt.outbox_capacity,
    );
    let maint = Arc::new(RecordingMaintenance::default());
    let ctx = Context::new(settings, store, broker, maint.clone());
    ctx.init().await.unwrap();
    (ctx, outbox, maint)
}

pub(crate) async fn test_context_with(settings: Settings) -> (Context, mpsc::Receiver<Outbound>) {
    let store = Store::connect(&settings.store.url).await.unwrap();
    let (ctx, outbox, _) = build(settings, store).await;
    (ctx, outbox)
}

pub(crate) async fn test_context() -> (Context, mpsc::Receiver<Outbound>) {
    test_context_with(test_settings()).await
}

pub(crate) async fn test_context_recording(
) -> (Context, mpsc::Receiver<Outbound>, Arc<RecordingMaintenance>) {
    let settings = test_settings();
    let store = Store::connect(&settings.store.url).await.unwrap();
    build(settings, store).await
}

/// A second context sharing an existing store, as after a restart.
pub(crate) async fn context_on_store(store: Store) -> (Context, mpsc::Receiver<Outbound>) {
    let (ctx, outbox, _) = build(test_settings(), store).await;
    (ctx, outbox)
}

pub(crate) fn drain(outbox: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = outbox.try_recv() {
        out.push(msg);
    }
    out
}

// ---------------------------------------------------------------------------
// Probe leaf
// ---------------------------------------------------------------------------

/// Leaf with one writable transient bool `flag`. Applies change requests
/// and forwards every `ParamChanged` it observes.
pub(crate) struct ProbeLeaf {
    seen: mpsc::UnboundedSender<Event>,
}

impl ProbeLeaf {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Self { seen }, rx)
    }
}

#[async_trait]
impl LeafType for ProbeLeaf {
    fn kind(&self) -> &'static str {
        "probe"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        if let Err(e) = leaf
            .create_param("flag", false.into(), Access::Write, Storage::Transient, None)
            .await
        {
            return Descriptor::failed("probe", e.to_string());
        }
        Descriptor::new(
            "probe",
            Box::new(ProbeTask {
                seen: self.seen.clone(),
            }),
        )
    }
}

struct ProbeTask {
    seen: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl LeafTask for ProbeTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        loop {
            if let Some(ev) = mailbox.next().await {
                match ev.kind {
                    EventKind::ParamChangeRequest => {
                        if let Err(e) = apply_change_request(&leaf, &ev).await {
                            log_rejected(&leaf, &ev, &e);
                        }
                    }
                    EventKind::ParamChanged => {
                        let _ = self.seen.send(ev);
                    }
                    _ => {}
                }
            }
            mailbox.pause().await;
        }
    }
}
