//! Relay leaf: one GPIO-driven on/off output mirroring its `status`
//! parameter. The `gpio` feature gates the real rppal driver; without it a
//! mock output only tracks state and logs.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(feature = "gpio")]
use anyhow::Context as _;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::event::EventKind;
use crate::leaf::{Descriptor, LeafHandle, LeafTask, LeafType, Mailbox};
use crate::param::{Access, ParamValue, Storage};

use super::{apply_change_request, log_rejected};

pub const STATUS: &str = "status";

// ---------------------------------------------------------------------------
// Output (real GPIO)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayOutput {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl RelayOutput {
    pub(crate) fn new(gpio: Option<u8>, active_low: bool) -> Result<Self> {
        let pin_num = gpio.context("relay output needs a gpio pin")?;
        let pin = Gpio::new()?
            .get(pin_num)
            .with_context(|| format!("gpio {pin_num} unavailable"))?
            .into_output();
        let mut out = Self {
            pin,
            active_low,
            on: true,
        };
        out.set(false); // fail-safe: off at startup
        Ok(out)
    }

    pub(crate) fn set(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.on = on;
    }

    pub(crate) fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Output (mock, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayOutput {
    gpio: Option<u8>,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayOutput {
    pub(crate) fn new(gpio: Option<u8>, _active_low: bool) -> Result<Self> {
        debug!(?gpio, "mock relay output registered (not wired)");
        Ok(Self { gpio, on: false })
    }

    pub(crate) fn set(&mut self, on: bool) {
        self.on = on;
        debug!(gpio = ?self.gpio, on, "mock relay output set");
    }

    pub(crate) fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Leaf
// ---------------------------------------------------------------------------

pub struct RelayLeaf {
    gpio: Option<u8>,
    active_low: bool,
}

impl RelayLeaf {
    pub fn new(gpio: Option<u8>, active_low: bool) -> Self {
        Self { gpio, active_low }
    }
}

#[async_trait]
impl LeafType for RelayLeaf {
    fn kind(&self) -> &'static str {
        "relay"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        if let Err(e) = leaf
            .create_param(STATUS, false.into(), Access::Write, Storage::Persisted, None)
            .await
        {
            return Descriptor::failed("relay", e.to_string());
        }
        match RelayOutput::new(self.gpio, self.active_low) {
            Ok(output) => Descriptor::new("relay", Box::new(RelayTask { output })),
            Err(e) => Descriptor::failed("relay", format!("{e:#}")),
        }
    }
}

struct RelayTask {
    output: RelayOutput,
}

impl RelayTask {
    /// Drive the output to match `status`.
    async fn reconcile(&mut self, leaf: &LeafHandle) {
        match leaf.get_bool(STATUS).await {
            Ok(wanted) if wanted != self.output.is_on() => {
                self.output.set(wanted);
                info!(leaf = %leaf.name(), on = wanted, "relay switched");
            }
            Ok(_) => {}
            Err(e) => warn!(leaf = %leaf.name(), "relay status unreadable: {e}"),
        }
    }
}

#[async_trait]
impl LeafTask for RelayTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        let mut task = *self;
        task.reconcile(&leaf).await;
        loop {
            if let Some(ev) = mailbox.next().await {
                match ev.kind {
                    EventKind::ParamChangeRequest => {
                        if let Err(e) = apply_change_request(&leaf, &ev).await {
                            log_rejected(&leaf, &ev, &e);
                        }
                    }
                    EventKind::NetworkDisconnected | EventKind::ServerDisconnected => {
                        if leaf.get_bool(STATUS).await.unwrap_or(false) {
                            warn!(leaf = %leaf.name(), "connectivity lost, switching off");
                            if let Err(e) = leaf.set(STATUS, ParamValue::Bool(false)).await {
                                warn!(leaf = %leaf.name(), "fail-safe off failed: {e}");
                            }
                        }
                    }
                    _ => {}
                }
            }
            task.reconcile(&leaf).await;
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
    use crate::event::Event;
    use crate::leaf::LeafState;
    use crate::node::Node;
    use crate::testing::test_context;
    use std::time::Duration;

    async fn wait_for_status(leaf: &LeafHandle, wanted: bool) -> bool {
        for _ in 0..100 {
            if leaf.get_bool(STATUS).await.unwrap() == wanted {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // -- RelayOutput (mock) -------------------------------------------------

    #[test]
    fn output_starts_off() {
        let out = RelayOutput::new(Some(17), true).unwrap();
        assert!(!out.is_on());
    }

    #[test]
    fn output_follows_set() {
        let mut out = RelayOutput::new(Some(17), true).unwrap();
        out.set(true);
        assert!(out.is_on());
        out.set(false);
        assert!(!out.is_on());
    }

    // -- leaf ---------------------------------------------------------------

    #[tokio::test]
    async fn command_switches_relay() {
        let (ctx, _outbox) = test_context().await;
        let node = Node::create(&ctx, "n").await.unwrap();
        let relay = node
            .add_leaf("plt_a", &RelayLeaf::new(Some(17), true))
            .await
            .unwrap();
        node.start().await.unwrap();
        assert_eq!(relay.state().await, LeafState::Running);

        ctx.request_param_change("plt_a", STATUS, "on").await.unwrap();
        assert!(wait_for_status(&relay, true).await);
    }

    #[tokio::test]
    async fn disconnect_switches_relay_off() {
        let (ctx, _outbox) = test_context().await;
        let node = Node::create(&ctx, "n").await.unwrap();
        let relay = node
            .add_leaf("plt_a", &RelayLeaf::new(Some(17), true))
            .await
            .unwrap();
        node.start().await.unwrap();
        relay.set(STATUS, true.into()).await.unwrap();
        // let the leaf consume its own change notification first
        tokio::time::sleep(Duration::from_millis(100)).await;

        ctx.bus()
            .post(Event::new(EventKind::ServerDisconnected))
            .await
            .unwrap();
        assert!(wait_for_status(&relay, false).await);
    }
}
