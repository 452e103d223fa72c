//! Simulated water level and temperature probes.
//!
//! Readings are exposed as `Read` parameters and written through
//! [`LeafHandle::record`], so remote commands cannot overwrite them.

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::leaf::{Descriptor, LeafHandle, LeafTask, LeafType, Mailbox};
use crate::param::{check_range, Access, ParamValue, Storage, Validation};

use super::sim::{Walk, WalkProfile};
use super::{apply_change_request, log_rejected};

pub const ACTIVE: &str = "active";
pub const UPDATE_MS: &str = "update_ms";
pub const LEVEL: &str = "level";
pub const TRG_HIGH: &str = "trg_high";
pub const TRG_LOW: &str = "trg_low";
pub const TRG_HIGH_MM: &str = "trg_high_mm";
pub const TRG_LOW_MM: &str = "trg_low_mm";

fn update_range(v: &ParamValue) -> Validation {
    check_range(v, 100.0, 3_600_000.0)
}

fn level_range(v: &ParamValue) -> Validation {
    check_range(v, 0.0, 200.0)
}

pub fn temp_param(probe: usize) -> String {
    format!("temp_{probe}")
}

/// True once `update_ms` has passed since `last`.
async fn due(leaf: &LeafHandle, last: Instant) -> bool {
    let every = leaf.get_double(UPDATE_MS).await.unwrap_or(1000.0).max(1.0);
    last.elapsed() >= Duration::from_millis(every as u64)
}

async fn handle_request(leaf: &LeafHandle, ev: &crate::event::Event) {
    if ev.kind == EventKind::ParamChangeRequest {
        if let Err(e) = apply_change_request(leaf, ev).await {
            log_rejected(leaf, ev, &e);
        }
    }
}

// ---------------------------------------------------------------------------
// Water level
// ---------------------------------------------------------------------------

pub struct WaterLevelLeaf;

impl WaterLevelLeaf {
    async fn declare(leaf: &LeafHandle) -> Result<()> {
        leaf.create_param(LEVEL, 0.0.into(), Access::Read, Storage::Transient, None)
            .await?;
        leaf.create_param(TRG_HIGH, false.into(), Access::Read, Storage::Transient, None)
            .await?;
        leaf.create_param(TRG_LOW, false.into(), Access::Read, Storage::Transient, None)
            .await?;
        leaf.create_param(ACTIVE, true.into(), Access::ReadWrite, Storage::Persisted, None)
            .await?;
        leaf.create_param(
            TRG_HIGH_MM,
            150.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(level_range),
        )
        .await?;
        leaf.create_param(
            TRG_LOW_MM,
            20.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(level_range),
        )
        .await?;
        leaf.create_param(
            UPDATE_MS,
            1000.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(update_range),
        )
        .await
    }
}

#[async_trait]
impl LeafType for WaterLevelLeaf {
    fn kind(&self) -> &'static str {
        "water_level"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        match Self::declare(leaf).await {
            Ok(()) => Descriptor::new(
                "water_level",
                Box::new(WaterLevelTask {
                    walk: Walk::new(WalkProfile::WATER_LEVEL_MM),
                }),
            ),
            Err(e) => Descriptor::failed("water_level", e.to_string()),
        }
    }
}

struct WaterLevelTask {
    walk: Walk,
}

impl WaterLevelTask {
    async fn sample(&mut self, leaf: &LeafHandle) -> Result<()> {
        let level = self.walk.sample();
        let high = level > leaf.get_double(TRG_HIGH_MM).await?;
        let low = level < leaf.get_double(TRG_LOW_MM).await?;

        leaf.record(LEVEL, level.into()).await?;
        if leaf.get_bool(TRG_HIGH).await? != high {
            leaf.record(TRG_HIGH, high.into()).await?;
        }
        if leaf.get_bool(TRG_LOW).await? != low {
            leaf.record(TRG_LOW, low.into()).await?;
        }
        debug!(leaf = %leaf.name(), level, high, low, "water level sampled");
        Ok(())
    }
}

#[async_trait]
impl LeafTask for WaterLevelTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        let mut task = *self;
        let mut last: Option<Instant> = None;
        loop {
            if let Some(ev) = mailbox.next().await {
                handle_request(&leaf, &ev).await;
            }

            let active = leaf.get_bool(ACTIVE).await.unwrap_or(false);
            let is_due = match last {
                Some(t) => due(&leaf, t).await,
                None => true,
            };
            if active && is_due {
                last = Some(Instant::now());
                if let Err(e) = task.sample(&leaf).await {
                    warn!(leaf = %leaf.name(), "water level sample failed: {e}");
                }
            }
            mailbox.pause().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

pub struct TemperatureLeaf {
    probes: usize,
}

impl TemperatureLeaf {
    pub fn new(probes: usize) -> Self {
        Self {
            probes: probes.max(1),
        }
    }

    async fn declare(&self, leaf: &LeafHandle) -> Result<()> {
        leaf.create_param(ACTIVE, true.into(), Access::ReadWrite, Storage::Persisted, None)
            .await?;
        leaf.create_param(
            UPDATE_MS,
            5000.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(update_range),
        )
        .await?;
        for probe in 0..self.probes {
            leaf.create_param(
                &temp_param(probe),
                WalkProfile::TEMPERATURE_C.center.into(),
                Access::Read,
                Storage::Transient,
                None,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LeafType for TemperatureLeaf {
    fn kind(&self) -> &'static str {
        "temperature"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        if let Err(e) = self.declare(leaf).await {
            return Descriptor::failed("temperature", e.to_string());
        }
        let walks = (0..self.probes)
            .map(|_| Walk::new(WalkProfile::TEMPERATURE_C))
            .collect();
        Descriptor::new("temperature", Box::new(TemperatureTask { walks }))
    }
}

struct TemperatureTask {
    walks: Vec<Walk>,
}

#[async_trait]
impl LeafTask for TemperatureTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        let mut task = *self;
        let mut last: Option<Instant> = None;
        loop {
            if let Some(ev) = mailbox.next().await {
                handle_request(&leaf, &ev).await;
            }

            let active = leaf.get_bool(ACTIVE).await.unwrap_or(false);
            let is_due = match last {
                Some(t) => due(&leaf, t).await,
                None => true,
            };
            if active && is_due {
                last = Some(Instant::now());
                for (probe, walk) in task.walks.iter_mut().enumerate() {
                    let reading = walk.sample();
                    if let Err(e) = leaf.record(&temp_param(probe), reading.into()).await {
                        warn!(leaf = %leaf.name(), probe, "temperature record failed: {e}");
                    }
                }
            }
            mailbox.pause().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GrowError;
    use crate::node::Node;
    use crate::testing::test_context;

    #[tokio::test]
    async fn readings_are_read_only() {
        let (ctx, _outbox) = test_context().await;
        let node = Node::create(&ctx, "n").await.unwrap();
        node.add_leaf("waterlevelin", &WaterLevelLeaf).await.unwrap();

        let err = ctx
            .request_param_change("waterlevelin", LEVEL, "3")
            .await
            .unwrap_err();
        assert!(matches!(err, GrowError::AccessViolation { .. }));
        ctx.request_param_change("waterlevelin", ACTIVE, "0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn temperature_declares_one_param_per_probe() {
        let (ctx, _outbox) = test_context().await;
        let node = Node::create(&ctx, "n").await.unwrap();
        let leaf = node
            .add_leaf("ds18b20", &TemperatureLeaf::new(3))
            .await
            .unwrap();
        for probe in 0..3 {
            assert!(leaf.get_double(&temp_param(probe)).await.is_ok());
        }
        assert!(leaf.get_double(&temp_param(3)).await.is_err());
    }

    #[tokio::test]
    async fn running_water_level_publishes_readings() {
        let (ctx, _outbox) = test_context().await;
        let node = Node::create(&ctx, "n").await.unwrap();
        let leaf = node.add_leaf("waterlevelin", &WaterLevelLeaf).await.unwrap();
        node.start().await.unwrap();

        for _ in 0..100 {
            if leaf.get_double(LEVEL).await.unwrap() > 0.0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no level reading recorded");
    }
}
