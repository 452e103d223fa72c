//! Leaves: the unit of functionality inside a node.
//!
//! A leaf is created in two phases. [`Node::add_leaf`] allocates the
//! [`LeafHandle`] (name, parameter table, mailbox) and registers it, then
//! runs the leaf type's [`LeafType::configure`], which declares parameters
//! and hands back a [`Descriptor`] carrying the task body. The task is only
//! spawned by [`Node::start`].
//!
//! [`Node::add_leaf`]: crate::node::Node::add_leaf
//! [`Node::start`]: crate::node::Node::start

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{GrowError, Result};
use crate::event::{Event, EventKind};
use crate::param::{
    Access, Param, ParamTable, ParamValue, ParamView, Storage, Validation, Validator,
};
use crate::store::store_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafState {
    Created,
    Initialized,
    Running,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorStatus {
    NotInitialized,
    Initialized,
    Error,
}

// ---------------------------------------------------------------------------
// Leaf contract
// ---------------------------------------------------------------------------

/// Body of a running leaf. Consumed on start, so it runs exactly once.
#[async_trait]
pub trait LeafTask: Send + 'static {
    async fn run(self: Box<Self>, leaf: LeafHandle, mailbox: Mailbox);
}

/// A kind of leaf the node can host.
#[async_trait]
pub trait LeafType: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Declare parameters on `leaf` and return the descriptor. Runs before
    /// the leaf can be scheduled.
    async fn configure(&self, leaf: &LeafHandle) -> Descriptor;
}

pub struct Descriptor {
    kind: String,
    status: DescriptorStatus,
    task: Option<Box<dyn LeafTask>>,
    reason: Option<String>,
}

impl Descriptor {
    pub fn new(kind: &str, task: Box<dyn LeafTask>) -> Self {
        Self {
            kind: kind.to_string(),
            status: DescriptorStatus::Initialized,
            task: Some(task),
            reason: None,
        }
    }

    pub fn failed(kind: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            status: DescriptorStatus::Error,
            task: None,
            reason: Some(reason.into()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn status(&self) -> DescriptorStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Receiving side of a leaf's mailbox, handed to the task on start.
pub struct Mailbox {
    rx: mpsc::Receiver<Event>,
    poll: Duration,
    yield_for: Duration,
}

impl Mailbox {
    pub(crate) fn new(rx: mpsc::Receiver<Event>, poll: Duration, yield_for: Duration) -> Self {
        Self {
            rx,
            poll,
            yield_for,
        }
    }

    /// Next event, or `None` once the poll interval passes without one.
    pub async fn next(&mut self) -> Option<Event> {
        match timeout(self.poll, self.rx.recv()).await {
            Ok(Some(ev)) => Some(ev),
            Ok(None) => {
                sleep(self.poll).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Short sleep between periodic work cycles.
    pub async fn pause(&self) {
        sleep(self.yield_for).await;
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct LeafInner {
    name: String,
    kind: String,
    ctx: Context,
    state: RwLock<LeafState>,
    params: RwLock<ParamTable>,
    /// Serializes writers so the store and the table agree on the last value.
    write_lock: Mutex<()>,
    mailbox_tx: mpsc::Sender<Event>,
    mailbox_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    task: Mutex<Option<Box<dyn LeafTask>>>,
}

#[derive(Clone)]
pub struct LeafHandle {
    inner: Arc<LeafInner>,
}

impl fmt::Debug for LeafHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafHandle")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

impl LeafHandle {
    pub(crate) fn new(ctx: Context, name: &str, kind: &str) -> Self {
        let (tx, rx) = mpsc::channel(ctx.settings().runtime.mailbox_capacity.max(1));
        Self {
            inner: Arc::new(LeafInner {
                name: name.to_string(),
                kind: kind.to_string(),
                ctx,
                state: RwLock::new(LeafState::Created),
                params: RwLock::new(ParamTable::new()),
                write_lock: Mutex::new(()),
                mailbox_tx: tx,
                mailbox_rx: Mutex::new(Some(rx)),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub async fn state(&self) -> LeafState {
        *self.inner.state.read().await
    }

    pub(crate) async fn set_state(&self, state: LeafState) {
        *self.inner.state.write().await = state;
    }

    // -- lifecycle ----------------------------------------------------------

    /// Record the outcome of `configure`.
    pub(crate) async fn apply_descriptor(&self, descriptor: Descriptor) {
        match descriptor.status {
            DescriptorStatus::Initialized => {
                *self.inner.task.lock().await = descriptor.task;
                self.set_state(LeafState::Initialized).await;
            }
            DescriptorStatus::NotInitialized | DescriptorStatus::Error => {
                warn!(
                    leaf = %self.name(),
                    kind = %descriptor.kind,
                    reason = descriptor.reason.as_deref().unwrap_or("unspecified"),
                    "leaf failed to configure"
                );
                self.set_state(LeafState::Error).await;
            }
        }
    }

    /// Spawn the task and publish the first status. On a failed publish the
    /// leaf is left as it was so a later start can retry.
    pub(crate) async fn start(&self) -> Result<()> {
        let mut task_slot = self.inner.task.lock().await;
        let mut rx_slot = self.inner.mailbox_rx.lock().await;
        let (Some(task), Some(rx)) = (task_slot.take(), rx_slot.take()) else {
            return Err(GrowError::LeafNotStarted(self.name().to_string()));
        };

        if !self.publish_status().await {
            *task_slot = Some(task);
            *rx_slot = Some(rx);
            return Err(GrowError::LeafNotStarted(self.name().to_string()));
        }

        let runtime = &self.inner.ctx.settings().runtime;
        let mailbox = Mailbox::new(
            rx,
            Duration::from_millis(runtime.leaf_poll_ms),
            Duration::from_millis(runtime.leaf_yield_ms),
        );
        let handle = self.clone();
        tokio::spawn(async move { task.run(handle, mailbox).await });

        self.set_state(LeafState::Running).await;
        info!(leaf = %self.name(), kind = %self.kind(), "leaf running");
        Ok(())
    }

    /// Wait for mailbox room.
    pub(crate) async fn deliver(&self, ev: Event) -> Result<()> {
        let kind = ev.kind;
        self.inner
            .mailbox_tx
            .send(ev)
            .await
            .map_err(|_| GrowError::EventNotSent(format!("{kind}: mailbox of '{}' closed", self.name())))
    }

    /// Non-blocking delivery. False when the mailbox is full or closed.
    pub(crate) fn offer(&self, ev: Event) -> bool {
        self.inner.mailbox_tx.try_send(ev).is_ok()
    }

    // -- parameters ---------------------------------------------------------

    /// Declare a parameter. Persisted parameters take their stored value
    /// when one of the same type exists.
    pub async fn create_param(
        &self,
        name: &str,
        default: ParamValue,
        access: Access,
        storage: Storage,
        validator: Option<Validator>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(GrowError::invalid("parameter name is empty"));
        }
        if self.inner.params.read().await.get(name).is_some() {
            return Err(GrowError::invalid(format!(
                "parameter '{name}' already exists on leaf '{}'",
                self.name()
            )));
        }

        let mut value = default;
        if storage == Storage::Persisted {
            let key = store_key(self.name(), name);
            if let Some(bytes) = self.inner.ctx.store().get(&key).await? {
                match ParamValue::decode(&bytes) {
                    Some(stored) if stored.same_type(&value) => {
                        debug!(leaf = %self.name(), param = %name, "loaded stored value");
                        value = stored;
                    }
                    Some(stored) => warn!(
                        leaf = %self.name(),
                        param = %name,
                        stored = stored.type_name(),
                        declared = value.type_name(),
                        "stored value has another type, keeping default"
                    ),
                    None => warn!(leaf = %self.name(), param = %name, "stored value unreadable"),
                }
            }
        }

        let param = Param {
            name: name.to_string(),
            value,
            access,
            storage,
            validator,
        };
        self.inner
            .params
            .write()
            .await
            .insert(param)
            .map_err(|p| GrowError::invalid(format!("parameter '{}' already exists", p.name)))
    }

    pub async fn get(&self, name: &str) -> Result<ParamValue> {
        self.inner
            .params
            .read()
            .await
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| GrowError::not_found(self.name(), name))
    }

    pub async fn get_bool(&self, name: &str) -> Result<bool> {
        let v = self.get(name).await?;
        v.as_bool()
            .ok_or_else(|| GrowError::invalid(format!("'{name}' is a {}, not a bool", v.type_name())))
    }

    pub async fn get_double(&self, name: &str) -> Result<f64> {
        let v = self.get(name).await?;
        v.as_f64()
            .ok_or_else(|| GrowError::invalid(format!("'{name}' is a {}, not a double", v.type_name())))
    }

    pub async fn get_str(&self, name: &str) -> Result<String> {
        let v = self.get(name).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| GrowError::invalid(format!("'{name}' is a {}, not a string", v.type_name())))
    }

    pub(crate) async fn access(&self, name: &str) -> Result<Access> {
        self.inner
            .params
            .read()
            .await
            .get(name)
            .map(|p| p.access)
            .ok_or_else(|| GrowError::not_found(self.name(), name))
    }

    /// Checked write: access, type and validator, then store, memory and
    /// notification.
    pub async fn set(&self, name: &str, value: ParamValue) -> Result<()> {
        self.write(name, value, true).await
    }

    /// Owner write for values the device itself produces, such as sensor
    /// readings exposed as `Read` parameters. No access or validator check.
    pub async fn record(&self, name: &str, value: ParamValue) -> Result<()> {
        self.write(name, value, false).await
    }

    async fn write(&self, name: &str, value: ParamValue, checked: bool) -> Result<()> {
        if name.is_empty() {
            return Err(GrowError::invalid("parameter name is empty"));
        }

        let write_guard = self.inner.write_lock.lock().await;
        let (value, storage) = {
            let table = self.inner.params.read().await;
            let param = table
                .get(name)
                .ok_or_else(|| GrowError::not_found(self.name(), name))?;

            if checked && !param.access.is_writable() {
                return Err(GrowError::AccessViolation {
                    leaf: self.name().to_string(),
                    param: name.to_string(),
                });
            }
            if !param.value.same_type(&value) {
                return Err(GrowError::invalid(format!(
                    "'{name}' is a {}, got a {}",
                    param.value.type_name(),
                    value.type_name()
                )));
            }

            let value = match (checked, param.validator) {
                (true, Some(validate)) => match validate(&value) {
                    Validation::Passed => value,
                    Validation::BelowMin(bound) | Validation::AboveMax(bound) => {
                        debug!(leaf = %self.name(), param = %name, "value clamped");
                        bound
                    }
                    Validation::Error => {
                        return Err(GrowError::invalid(format!("'{name}' rejected by validator")));
                    }
                },
                _ => value,
            };
            (value, param.storage)
        };

        if storage == Storage::Persisted {
            self.inner
                .ctx
                .store()
                .set(&store_key(self.name(), name), &value.encode())
                .await?;
        }

        let snapshot = {
            let mut table = self.inner.params.write().await;
            match table.get_mut(name) {
                Some(param) => param.value = value.clone(),
                None => return Err(GrowError::not_found(self.name(), name)),
            }
            table.snapshot_json()
        };
        drop(write_guard);

        let changed = Event::for_param(
            EventKind::ParamChanged,
            self.name(),
            name,
            value.to_payload(),
        );
        if let Err(e) = self.inner.ctx.bus().post(changed).await {
            debug!(leaf = %self.name(), param = %name, "change event dropped: {e}");
        }
        self.inner
            .ctx
            .broker()
            .publish_leaf_status(self.name(), &snapshot);

        debug!(leaf = %self.name(), param = %name, value = %value.to_payload(), "param changed");
        Ok(())
    }

    // -- status -------------------------------------------------------------

    pub async fn snapshot(&self) -> serde_json::Value {
        self.inner.params.read().await.snapshot_json()
    }

    pub async fn views(&self) -> Vec<ParamView> {
        self.inner.params.read().await.views()
    }

    /// Publish the parameter snapshot on `P/{leaf}/status`.
    pub async fn publish_status(&self) -> bool {
        let snapshot = self.snapshot().await;
        self.inner
            .ctx
            .broker()
            .publish_leaf_status(self.name(), &snapshot)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::check_range;
    use crate::testing::{context_on_store, drain, test_context, test_context_with, test_settings};

    fn percent(v: &ParamValue) -> Validation {
        check_range(v, 0.0, 100.0)
    }

    async fn leaf(ctx: &Context) -> LeafHandle {
        LeafHandle::new(ctx.clone(), "plt_a", "relay")
    }

    // -- create_param -------------------------------------------------------

    #[tokio::test]
    async fn duplicate_param_keeps_first() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("status", true.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap();
        let err = l
            .create_param("status", false.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
        assert!(l.get_bool("status").await.unwrap());
        assert_eq!(l.views().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_param_name_rejected() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        let err = l
            .create_param("", true.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
        let err = l.set("", true.into()).await.unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
    }

    // -- persistence --------------------------------------------------------

    #[tokio::test]
    async fn persisted_value_survives_fresh_context() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("temp", 22.0.into(), Access::Write, Storage::Persisted, None)
            .await
            .unwrap();
        l.set("temp", ParamValue::Double(0.1 + 0.2)).await.unwrap();

        let (fresh, _outbox2) = context_on_store(ctx.store().clone()).await;
        let again = LeafHandle::new(fresh, "plt_a", "relay");
        again
            .create_param("temp", 22.0.into(), Access::Write, Storage::Persisted, None)
            .await
            .unwrap();

        let v = again.get_double("temp").await.unwrap();
        assert_eq!(v.to_bits(), (0.1f64 + 0.2).to_bits());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_leave_store_and_memory_agreeing() {
        let path = std::env::temp_dir().join(format!("grownode-{}.db", fastrand::u64(..)));
        let mut settings = test_settings();
        settings.store.url = format!("sqlite:{}?mode=rwc", path.display());
        let (ctx, _outbox) = test_context_with(settings).await;

        let l = leaf(&ctx).await;
        l.create_param("temp", 0.0.into(), Access::Write, Storage::Persisted, None)
            .await
            .unwrap();

        for round in 0..50 {
            let writers: Vec<_> = (0..8)
                .map(|i| {
                    let l = l.clone();
                    tokio::spawn(async move {
                        l.set("temp", ParamValue::Double(f64::from(round * 8 + i)))
                            .await
                            .unwrap();
                    })
                })
                .collect();
            for w in writers {
                w.await.unwrap();
            }

            let stored = ctx
                .store()
                .get(&store_key("plt_a", "temp"))
                .await
                .unwrap()
                .and_then(|b| ParamValue::decode(&b));
            assert_eq!(stored, Some(l.get("temp").await.unwrap()), "round {round}");
        }

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn stored_value_of_other_type_is_ignored() {
        let (ctx, _outbox) = test_context().await;
        ctx.store()
            .set(&store_key("plt_a", "status"), &ParamValue::Double(1.0).encode())
            .await
            .unwrap();

        let l = leaf(&ctx).await;
        l.create_param("status", false.into(), Access::Write, Storage::Persisted, None)
            .await
            .unwrap();
        assert!(!l.get_bool("status").await.unwrap());
    }

    #[tokio::test]
    async fn transient_param_is_not_stored() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("flag", false.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap();
        l.set("flag", true.into()).await.unwrap();
        assert!(ctx
            .store()
            .get(&store_key("plt_a", "flag"))
            .await
            .unwrap()
            .is_none());
    }

    // -- set ----------------------------------------------------------------

    #[tokio::test]
    async fn set_on_read_only_is_access_violation() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("level", 5.0.into(), Access::Read, Storage::Transient, None)
            .await
            .unwrap();

        let err = l.set("level", 9.0.into()).await.unwrap_err();
        assert!(matches!(err, GrowError::AccessViolation { .. }));
        assert_eq!(l.get_double("level").await.unwrap(), 5.0);

        l.record("level", 9.0.into()).await.unwrap();
        assert_eq!(l.get_double("level").await.unwrap(), 9.0);
    }

    #[tokio::test]
    async fn set_missing_param_is_not_found() {
        let (ctx, _outbox) = test_context().await;
        let err = leaf(&ctx).await.set("nope", true.into()).await.unwrap_err();
        assert!(matches!(err, GrowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn set_with_wrong_type_is_invalid() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("status", false.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap();
        let err = l.set("status", ParamValue::Double(1.0)).await.unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
        let err = l.get_double("status").await.unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn validator_commits_boundary() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param(
            "power",
            50.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(percent),
        )
        .await
        .unwrap();

        l.set("power", 150.0.into()).await.unwrap();
        assert_eq!(l.get_double("power").await.unwrap(), 100.0);
        l.set("power", (-3.0).into()).await.unwrap();
        assert_eq!(l.get_double("power").await.unwrap(), 0.0);

        let err = l.set("power", ParamValue::Double(f64::NAN)).await.unwrap_err();
        assert!(matches!(err, GrowError::InvalidArgument(_)));
        assert_eq!(l.get_double("power").await.unwrap(), 0.0);

        let stored = ctx.store().get(&store_key("plt_a", "power")).await.unwrap();
        assert_eq!(ParamValue::decode(&stored.unwrap()), Some(ParamValue::Double(0.0)));
    }

    #[tokio::test]
    async fn set_publishes_snapshot() {
        let (ctx, mut outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.create_param("status", false.into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap();
        l.create_param("name", "a".into(), Access::Write, Storage::Transient, None)
            .await
            .unwrap();
        drain(&mut outbox);

        l.set("status", true.into()).await.unwrap();

        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "test/plt_a/status");
        assert_eq!(sent[0].payload, br#"{"status":true,"name":"a"}"#.to_vec());
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn failed_descriptor_marks_error() {
        let (ctx, _outbox) = test_context().await;
        let l = leaf(&ctx).await;
        l.apply_descriptor(Descriptor::failed("relay", "no pin")).await;
        assert_eq!(l.state().await, LeafState::Error);
        assert!(matches!(l.start().await, Err(GrowError::LeafNotStarted(_))));
    }
}
