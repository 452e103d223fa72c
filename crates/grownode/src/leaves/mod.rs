//! Leaf types the node binary can host.

pub mod pump;
pub mod relay;
pub mod sensors;
pub mod sim;
pub mod watering;

use tracing::warn;

use crate::error::{GrowError, Result};
use crate::event::Event;
use crate::leaf::{LeafHandle, LeafType};
use crate::settings::{LeafEntry, WateringSection};

/// Build the leaf type for a configured entry. `None` for unknown kinds.
pub fn build(entry: &LeafEntry, watering: &WateringSection) -> Option<Box<dyn LeafType>> {
    let gpio = entry.gpio.and_then(|p| u8::try_from(p).ok());
    let active_low = entry.active_low.unwrap_or(true);
    match entry.kind.as_str() {
        "relay" => Some(Box::new(relay::RelayLeaf::new(gpio, active_low))),
        "pump" => Some(Box::new(pump::PumpLeaf::new(gpio, active_low))),
        "water_level" => Some(Box::new(sensors::WaterLevelLeaf)),
        "temperature" => Some(Box::new(sensors::TemperatureLeaf::new(
            entry.probes.unwrap_or(2),
        ))),
        "watering" => Some(Box::new(watering::WateringLeaf::new(watering.clone()))),
        other => {
            warn!(leaf = %entry.name, kind = %other, "unknown leaf kind");
            None
        }
    }
}

/// Parse a `ParamChangeRequest` payload as the target parameter's type
/// and apply it with the usual checks.
pub(crate) async fn apply_change_request(leaf: &LeafHandle, ev: &Event) -> Result<()> {
    let param = ev
        .param
        .as_deref()
        .ok_or_else(|| GrowError::invalid("change request without parameter"))?;
    let current = leaf.get(param).await?;
    let value = current.parse_as(&ev.payload_str())?;
    leaf.set(param, value).await
}

/// Log a rejected change request. The requester has no reply channel.
pub(crate) fn log_rejected(leaf: &LeafHandle, ev: &Event, e: &GrowError) {
    warn!(
        leaf = %leaf.name(),
        param = ev.param.as_deref().unwrap_or(""),
        label = e.as_label(),
        "change request rejected: {e}"
    );
}
