//! Pump leaf: on/off output plus a `power` setting in percent.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::leaf::{Descriptor, LeafHandle, LeafTask, LeafType, Mailbox};
use crate::param::{check_range, Access, ParamValue, Storage, Validation};

use super::relay::RelayOutput;
use super::{apply_change_request, log_rejected};

pub const STATUS: &str = "status";
pub const POWER: &str = "power";

fn power_range(v: &ParamValue) -> Validation {
    check_range(v, 0.0, 100.0)
}

pub struct PumpLeaf {
    gpio: Option<u8>,
    active_low: bool,
}

impl PumpLeaf {
    pub fn new(gpio: Option<u8>, active_low: bool) -> Self {
        Self { gpio, active_low }
    }

    async fn declare(leaf: &LeafHandle) -> Result<()> {
        leaf.create_param(STATUS, false.into(), Access::Write, Storage::Persisted, None)
            .await?;
        leaf.create_param(
            POWER,
            100.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(power_range),
        )
        .await
    }
}

#[async_trait]
impl LeafType for PumpLeaf {
    fn kind(&self) -> &'static str {
        "pump"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        if let Err(e) = Self::declare(leaf).await {
            return Descriptor::failed("pump", e.to_string());
        }

        match RelayOutput::new(self.gpio, self.active_low) {
            Ok(output) => Descriptor::new("pump", Box::new(PumpTask { output })),
            Err(e) => Descriptor::failed("pump", format!("{e:#}")),
        }
    }
}

struct PumpTask {
    output: RelayOutput,
}

#[async_trait]
impl LeafTask for PumpTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        let mut task = *self;
        loop {
            if let Some(ev) = mailbox.next().await {
                if ev.kind == EventKind::ParamChangeRequest {
                    if let Err(e) = apply_change_request(&leaf, &ev).await {
                        log_rejected(&leaf, &ev, &e);
                    }
                }
            }

            // Only on/off is driven, not the duty.
            match (leaf.get_bool(STATUS).await, leaf.get_double(POWER).await) {
                (Ok(on), Ok(power)) => {
                    let wanted = on && power > 0.0;
                    if wanted != task.output.is_on() {
                        task.output.set(wanted);
                        info!(leaf = %leaf.name(), on = wanted, power, "pump switched");
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(leaf = %leaf.name(), "pump params unreadable: {e}");
                }
            }
            mailbox.pause().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;

    #[tokio::test]
    async fn power_is_clamped_to_percent() {
        let (ctx, _outbox) = test_context().await;
        let node = crate::node::Node::create(&ctx, "n").await.unwrap();
        let pump = node.add_leaf("hcc", &PumpLeaf::new(None, true)).await.unwrap();

        pump.set(POWER, 250.0.into()).await.unwrap();
        assert_eq!(pump.get_double(POWER).await.unwrap(), 100.0);
        pump.set(POWER, (-1.0).into()).await.unwrap();
        assert_eq!(pump.get_double(POWER).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn defaults_are_off_at_full_power() {
        let (ctx, _outbox) = test_context().await;
        let node = crate::node::Node::create(&ctx, "n").await.unwrap();
        let pump = node.add_leaf("hcc", &PumpLeaf::new(None, true)).await.unwrap();
        assert!(!pump.get_bool(STATUS).await.unwrap());
        assert_eq!(pump.get_double(POWER).await.unwrap(), 100.0);
    }
}
