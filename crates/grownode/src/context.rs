//! Configuration root shared by the node, its leaves and the dispatcher.
//!
//! A [`Context`] is an `Arc` around everything the runtime needs: settings,
//! status, the event bus, the broker outbox, the parameter store and the
//! leaf directory used for routing. Clone it freely; every clone sees the
//! same state. Independent contexts can coexist in one process.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::BrokerHandle;
use crate::bus::{self, EventBus};
use crate::error::{GrowError, Result};
use crate::event::{Event, EventKind};
use crate::journal::{EntryKind, Journal, LeafReport, StatusReport};
use crate::leaf::LeafHandle;
use crate::maintenance::Maintenance;
use crate::param::ParamValue;
use crate::settings::Settings;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotInitialized,
    Initializing,
    Error,
    NetworkError,
    ServerError,
    Completed,
    Started,
}

impl Status {
    fn is_connectivity_error(self) -> bool {
        matches!(self, Status::NetworkError | Status::ServerError)
    }
}

/// Current status plus the one to return to once connectivity comes back.
struct StatusCell {
    current: Status,
    resume: Status,
}

struct Inner {
    settings: Settings,
    started_at: Instant,
    status: RwLock<StatusCell>,
    init_gate: Mutex<()>,
    bus: EventBus,
    bus_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    broker: BrokerHandle,
    store: Store,
    node_name: std::sync::RwLock<String>,
    directory: RwLock<Vec<LeafHandle>>,
    journal: Mutex<Journal>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    maintenance: Arc<dyn Maintenance>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Builds a context in `NotInitialized`. Nothing runs until [`init`].
    ///
    /// [`init`]: Context::init
    pub fn new(
        settings: Settings,
        store: Store,
        broker: BrokerHandle,
        maintenance: Arc<dyn Maintenance>,
    ) -> Self {
        let (bus, bus_rx) = EventBus::channel(settings.runtime.bus_capacity);
        let node_name = settings.node.name.clone();
        Self {
            inner: Arc::new(Inner {
                settings,
                started_at: Instant::now(),
                status: RwLock::new(StatusCell {
                    current: Status::NotInitialized,
                    resume: Status::Completed,
                }),
                init_gate: Mutex::new(()),
                bus,
                bus_rx: Mutex::new(Some(bus_rx)),
                broker,
                store,
                node_name: std::sync::RwLock::new(node_name),
                directory: RwLock::new(Vec::new()),
                journal: Mutex::new(Journal::new()),
                keepalive: Mutex::new(None),
                maintenance,
            }),
        }
    }

    /// Migrates the store and spawns the dispatcher. Calling it again after
    /// success is a no-op; calling it after a failed attempt is an error.
    pub async fn init(&self) -> Result<()> {
        let _gate = self.inner.init_gate.lock().await;

        match self.status().await {
            Status::NotInitialized => {}
            Status::Error => {
                return Err(GrowError::invalid("context failed to initialize earlier"));
            }
            _ => return Ok(()),
        }

        self.set_status(Status::Initializing).await;

        if let Err(e) = self.inner.store.migrate().await {
            self.set_status(Status::Error).await;
            return Err(e);
        }

        let Some(rx) = self.inner.bus_rx.lock().await.take() else {
            self.set_status(Status::Error).await;
            return Err(GrowError::invalid("event bus receiver already taken"));
        };
        tokio::spawn(bus::dispatch(self.clone(), rx));

        self.set_status(Status::Completed).await;
        info!("context initialized");
        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.inner.broker
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn maintenance(&self) -> &dyn Maintenance {
        self.inner.maintenance.as_ref()
    }

    pub fn node_name(&self) -> String {
        match self.inner.node_name.read() {
            Ok(n) => n.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_node_name(&self, name: &str) {
        match self.inner.node_name.write() {
            Ok(mut n) => *n = name.to_string(),
            Err(poisoned) => *poisoned.into_inner() = name.to_string(),
        }
    }

    // -- status -------------------------------------------------------------

    pub async fn status(&self) -> Status {
        self.inner.status.read().await.current
    }

    pub async fn set_status(&self, status: Status) {
        let mut cell = self.inner.status.write().await;
        cell.current = status;
        if matches!(status, Status::Completed | Status::Started) {
            cell.resume = status;
        }
    }

    pub fn is_initialized(status: Status) -> bool {
        !matches!(
            status,
            Status::NotInitialized | Status::Initializing | Status::Error
        )
    }

    /// Marks the node started. While connectivity is down the status stays
    /// an error and `Started` is restored on reconnect.
    pub(crate) async fn mark_started(&self) {
        let mut cell = self.inner.status.write().await;
        cell.resume = Status::Started;
        if !cell.current.is_connectivity_error() {
            cell.current = Status::Started;
        }
    }

    pub(crate) async fn mark_connectivity_lost(&self, status: Status) {
        let mut cell = self.inner.status.write().await;
        if matches!(cell.current, Status::Completed | Status::Started) {
            cell.resume = cell.current;
        }
        if Self::is_initialized(cell.current) {
            cell.current = status;
        }
    }

    pub(crate) async fn restore_connectivity(&self) {
        let mut cell = self.inner.status.write().await;
        if cell.current.is_connectivity_error() {
            cell.current = cell.resume;
        }
    }

    // -- leaf directory -----------------------------------------------------

    /// First registered leaf with this name.
    pub async fn leaf(&self, name: &str) -> Option<LeafHandle> {
        self.inner
            .directory
            .read()
            .await
            .iter()
            .find(|l| l.name() == name)
            .cloned()
    }

    pub async fn leaves(&self) -> Vec<LeafHandle> {
        self.inner.directory.read().await.clone()
    }

    pub(crate) async fn register_leaf(&self, leaf: LeafHandle) {
        self.inner.directory.write().await.push(leaf);
    }

    pub(crate) async fn clear_directory(&self) {
        self.inner.directory.write().await.clear();
    }

    async fn require_leaf(&self, name: &str) -> Result<LeafHandle> {
        self.leaf(name)
            .await
            .ok_or_else(|| GrowError::LeafNotFound(name.to_string()))
    }

    // -- cross-leaf parameter access ----------------------------------------

    /// Snapshot of another leaf's parameter, read under that leaf's lock.
    pub async fn read_param(&self, leaf: &str, param: &str) -> Result<ParamValue> {
        self.require_leaf(leaf).await?.get(param).await
    }

    /// Same checks and fan-out as [`LeafHandle::set`], on behalf of another
    /// leaf.
    pub async fn set_param(&self, leaf: &str, param: &str, value: ParamValue) -> Result<()> {
        self.require_leaf(leaf).await?.set(param, value).await
    }

    /// External change request. Access and payload type are checked up
    /// front, the value is applied asynchronously by the owning leaf.
    pub async fn request_param_change(
        &self,
        leaf: &str,
        param: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        let handle = self.require_leaf(leaf).await?;
        let access = handle.access(param).await?;
        if !access.is_writable() {
            return Err(GrowError::AccessViolation {
                leaf: leaf.to_string(),
                param: param.to_string(),
            });
        }
        let ev = Event::change_request(leaf, param, payload);
        handle.get(param).await?.parse_as(&ev.payload_str())?;
        self.inner.bus.post(ev).await
    }

    // -- routing (dispatcher side) ------------------------------------------

    /// Deliver a leaf-addressed event, waiting for mailbox room.
    pub async fn route(&self, ev: Event) -> Result<()> {
        let name = ev.leaf.clone().unwrap_or_default();
        let leaf = self.require_leaf(&name).await?;
        leaf.deliver(ev).await
    }

    /// Offer a `ParamChanged` to its leaf without waiting.
    pub(crate) async fn notify(&self, ev: Event) {
        let Some(name) = ev.leaf.clone() else {
            return;
        };
        match self.leaf(&name).await {
            Some(leaf) => {
                if !leaf.offer(ev) {
                    debug!(leaf = %name, "mailbox busy, change notification dropped");
                }
            }
            None => debug!(leaf = %name, "change notification for unknown leaf"),
        }
    }

    /// Offer an event to every leaf without waiting.
    pub(crate) async fn fan_out(&self, ev: &Event) {
        for leaf in self.leaves().await {
            if !leaf.offer(ev.clone()) {
                debug!(leaf = %leaf.name(), kind = %ev.kind, "mailbox busy, fan-out dropped");
            }
        }
    }

    // -- broker -------------------------------------------------------------

    pub fn announce(&self, action: Option<&str>) -> bool {
        self.inner.broker.announce(&self.node_name(), action)
    }

    pub async fn publish_all_leaves(&self) {
        for leaf in self.leaves().await {
            leaf.publish_status().await;
        }
    }

    // -- keepalive ----------------------------------------------------------

    pub(crate) async fn start_keepalive(&self) {
        let mut slot = self.inner.keepalive.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let period = Duration::from_secs(self.inner.settings.node.keepalive_sec.max(1));
        let bus = self.inner.bus.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = bus.post(Event::new(EventKind::KeepaliveTick)).await {
                    debug!("keepalive tick dropped: {e}");
                }
            }
        }));
        debug!(period_secs = period.as_secs(), "keepalive started");
    }

    pub(crate) async fn stop_keepalive(&self) {
        if let Some(handle) = self.inner.keepalive.lock().await.take() {
            handle.abort();
            debug!("keepalive stopped");
        }
    }

    pub async fn keepalive_running(&self) -> bool {
        self.inner
            .keepalive
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // -- journal and reporting ----------------------------------------------

    pub(crate) async fn journal(&self, kind: EntryKind, message: impl Into<String>) {
        self.inner.journal.lock().await.record(kind, message);
    }

    /// Post a human-readable line to the journal through the bus.
    pub async fn log(&self, message: &str) {
        if let Err(e) = self.inner.bus.post(Event::log(message)).await {
            warn!("log line dropped: {e}");
        }
    }

    pub async fn status_report(&self) -> StatusReport {
        let mut leaves = Vec::new();
        for leaf in self.leaves().await {
            leaves.push(LeafReport {
                name: leaf.name().to_string(),
                kind: leaf.kind().to_string(),
                state: leaf.state().await,
                params: leaf.views().await,
            });
        }

        StatusReport {
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            status: self.status().await,
            node: self.node_name(),
            leaves,
            journal: self.inner.journal.lock().await.newest_first(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
