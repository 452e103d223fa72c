//! The node: an ordered set of leaves that start together and share one
//! context.

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{GrowError, Result};
use crate::event::{Event, EventKind};
use crate::leaf::{LeafHandle, LeafState, LeafType};
use crate::settings::check_name;

/// Ordered, capacity-limited set of leaves sharing one [`Context`].
/// Insertion order is startup order.
pub struct Node {
    name: String,
    ctx: Context,
    leaves: Mutex<Vec<LeafHandle>>,
}

impl Node {
    /// Requires an initialized context whose broker outbox is still drained.
    pub async fn create(ctx: &Context, name: &str) -> Result<Self> {
        if let Some(problem) = check_name(name) {
            return Err(GrowError::invalid(format!("node {problem}")));
        }
        if !Context::is_initialized(ctx.status().await) {
            return Err(GrowError::invalid("context is not initialized"));
        }
        if !ctx.broker().is_live() {
            return Err(GrowError::invalid("broker outbox is closed"));
        }

        ctx.set_node_name(name);
        info!(node = %name, "node created");
        Ok(Self {
            name: name.to_string(),
            ctx: ctx.clone(),
            leaves: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Register a leaf and run its configure step. A leaf whose configure
    /// fails is kept in `Error` state and skipped on start.
    pub async fn add_leaf(&self, name: &str, leaf_type: &dyn LeafType) -> Result<LeafHandle> {
        if let Some(problem) = check_name(name) {
            return Err(GrowError::invalid(format!("leaf {problem}")));
        }

        let handle = {
            let mut leaves = self.leaves.lock().await;
            let capacity = self.ctx.settings().runtime.max_leaves;
            if leaves.len() >= capacity {
                return Err(GrowError::invalid(format!(
                    "node '{}' is full ({capacity} leaves)",
                    self.name
                )));
            }
            let handle = LeafHandle::new(self.ctx.clone(), name, leaf_type.kind());
            leaves.push(handle.clone());
            handle
        };
        self.ctx.register_leaf(handle.clone()).await;

        let descriptor = leaf_type.configure(&handle).await;
        handle.apply_descriptor(descriptor).await;

        let added = Event::for_param(EventKind::LeafAdded, name, "", leaf_type.kind());
        if let Err(e) = self.ctx.bus().post(added).await {
            warn!(leaf = %name, "leaf added event not sent: {e}");
        }
        Ok(handle)
    }

    pub async fn leaf(&self, name: &str) -> Option<LeafHandle> {
        self.leaves
            .lock()
            .await
            .iter()
            .find(|l| l.name() == name)
            .cloned()
    }

    pub async fn leaf_state(&self, name: &str) -> Option<LeafState> {
        match self.leaf(name).await {
            Some(l) => Some(l.state().await),
            None => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.leaves.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leaves.lock().await.is_empty()
    }

    /// Spawn every initialized leaf in insertion order. Leaves that failed
    /// to configure are skipped; a leaf that fails to start does not stop
    /// the others but makes the whole call fail.
    pub async fn start(&self) -> Result<()> {
        let leaves = self.leaves.lock().await.clone();
        let mut not_started = Vec::new();

        for leaf in leaves {
            match leaf.state().await {
                LeafState::Initialized => {}
                LeafState::Error => {
                    warn!(leaf = %leaf.name(), "skipping leaf in error state");
                    continue;
                }
                LeafState::Created | LeafState::Running => continue,
            }
            if let Err(e) = leaf.start().await {
                warn!(leaf = %leaf.name(), label = e.as_label(), "{e}");
                not_started.push(leaf.name().to_string());
            }
        }

        if !not_started.is_empty() {
            return Err(GrowError::NodeNotStarted(format!(
                "leaves not started: {}",
                not_started.join(", ")
            )));
        }

        self.ctx.mark_started().await;
        self.ctx.announce(None);
        self.ctx
            .bus()
            .post(Event::new(EventKind::NodeStarted))
            .await?;
        info!(node = %self.name, "node started");
        Ok(())
    }

    /// Stop routing to this node's leaves. Running leaf tasks are not
    /// aborted and keep their handles.
    pub async fn destroy(self) {
        self.ctx.clear_directory().await;
        self.leaves.lock().await.clear();
        info!(node = %self.name, "node destroyed");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
