//! Watering-control supervisor.
//!
//! Composes six sibling leaves into one thermal + irrigation cycle:
//!
//! ```text
//!          ┌──[t > T+1]──▶ Cooling  (plate A off, plate B on, pump on)
//! sensors ─┼──[t < T-1]──▶ Heating  (plate A on, plate B off, pump on)
//!          └──[in band]──▶ Stop ──▶ irrigate for wat_time ──▶ Completed
//!
//! any tick: sensor inactive / level trigger / read error ──▶ DependencyFailure
//! Heating or Cooling longer than max_thermal ──▶ plates and pump off, cycle continues
//! ```
//!
//! [`WateringCycle`] is the pure decision engine. [`run_invocation`] feeds
//! it readings and applies its actuations by setting the siblings' `status`
//! parameters. [`run_trigger`] starts one invocation per `wat_int` while
//! `active` is set.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{GrowError, Result};
use crate::event::EventKind;
use crate::leaf::{Descriptor, LeafHandle, LeafTask, LeafType, Mailbox};
use crate::param::{check_range, Access, ParamValue, Storage, Validation};
use crate::settings::WateringSection;

use super::{apply_change_request, log_rejected};

pub const WAT_TIME: &str = "wat_time";
pub const WAT_INT: &str = "wat_int";
pub const WAT_T_TEMP: &str = "wat_t_temp";
pub const ACTIVE: &str = "active";

/// Half-width of the comfort band around the target temperature, in °C.
const BAND: f64 = 1.0;

fn duration_range(v: &ParamValue) -> Validation {
    check_range(v, 10.0, 600.0)
}

fn interval_range(v: &ParamValue) -> Validation {
    check_range(v, 60.0, 86_400.0)
}

fn target_temp_range(v: &ParamValue) -> Validation {
    check_range(v, 10.0, 30.0)
}

// ---------------------------------------------------------------------------
// Pure cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalState {
    Stop,
    Heating,
    Cooling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    PlateA,
    PlateB,
    ConditioningPump,
    IrrigationPump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuation {
    pub target: Target,
    pub on: bool,
}

const fn act(target: Target, on: bool) -> Actuation {
    Actuation { target, on }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A sensor was inactive, a level trigger fired or a read failed.
    DependencyFailure,
    /// Irrigation ran for the configured duration.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished(Exit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub actuations: Vec<Actuation>,
    pub flow: Flow,
}

/// One tick's worth of dependency values.
#[derive(Debug, Clone, PartialEq)]
pub struct Readings {
    pub level_active: bool,
    pub trg_high: bool,
    pub trg_low: bool,
    pub temp_active: bool,
    pub water_temp: f64,
    pub target_temp: f64,
    pub duration_sec: f64,
}

pub struct WateringCycle {
    poll_ms: u64,
    max_thermal: Duration,
    /// `None` until the first classification; actuator state is unknown.
    thermal: Option<ThermalState>,
    thermal_since: Option<Instant>,
    irrigating: bool,
    irrigation_elapsed_ms: u64,
}

impl WateringCycle {
    pub fn new(poll_ms: u64, max_thermal: Duration) -> Self {
        Self {
            poll_ms,
            max_thermal,
            thermal: None,
            thermal_since: None,
            irrigating: false,
            irrigation_elapsed_ms: 0,
        }
    }

    pub fn thermal(&self) -> Option<ThermalState> {
        self.thermal
    }

    pub fn irrigating(&self) -> bool {
        self.irrigating
    }

    pub fn step(&mut self, r: &Readings, now: Instant) -> Step {
        if !r.level_active || !r.temp_active || r.trg_high || r.trg_low {
            return self.finish(Exit::DependencyFailure);
        }

        let wanted = if r.water_temp > r.target_temp + BAND {
            ThermalState::Cooling
        } else if r.water_temp < r.target_temp - BAND {
            ThermalState::Heating
        } else {
            ThermalState::Stop
        };

        let mut actuations = Vec::new();
        if self.thermal != Some(wanted) {
            self.thermal = Some(wanted);
            self.thermal_since = (wanted != ThermalState::Stop).then_some(now);
            actuations.extend(thermal_actuations(wanted));
        }

        // Only conditioning is capped. Irrigation carries on and the next
        // out-of-band tick starts a fresh thermal cycle.
        if let Some(since) = self.thermal_since {
            if now.saturating_duration_since(since) > self.max_thermal {
                debug!("thermal cycle cap reached");
                self.thermal = Some(ThermalState::Stop);
                self.thermal_since = None;
                actuations.extend(thermal_actuations(ThermalState::Stop));
            }
        }

        if wanted == ThermalState::Stop && !self.irrigating {
            self.irrigating = true;
            self.irrigation_elapsed_ms = 0;
            actuations.push(act(Target::IrrigationPump, true));
        }

        if self.irrigating {
            self.irrigation_elapsed_ms += self.poll_ms;
            if self.irrigation_elapsed_ms as f64 > r.duration_sec * 1000.0 {
                return self.finish(Exit::Completed);
            }
        }

        Step {
            actuations,
            flow: Flow::Continue,
        }
    }

    /// A dependency could not be read this tick.
    pub fn dependency_lost(&mut self) -> Step {
        self.finish(Exit::DependencyFailure)
    }

    /// Everything off, state reset for the next invocation.
    fn finish(&mut self, exit: Exit) -> Step {
        self.thermal = None;
        self.thermal_since = None;
        self.irrigating = false;
        self.irrigation_elapsed_ms = 0;
        Step {
            actuations: vec![
                act(Target::PlateA, false),
                act(Target::PlateB, false),
                act(Target::ConditioningPump, false),
                act(Target::IrrigationPump, false),
            ],
            flow: Flow::Finished(exit),
        }
    }
}

fn thermal_actuations(state: ThermalState) -> [Actuation; 3] {
    match state {
        ThermalState::Cooling => [
            act(Target::PlateA, false),
            act(Target::PlateB, true),
            act(Target::ConditioningPump, true),
        ],
        ThermalState::Heating => [
            act(Target::PlateA, true),
            act(Target::PlateB, false),
            act(Target::ConditioningPump, true),
        ],
        ThermalState::Stop => [
            act(Target::PlateA, false),
            act(Target::PlateB, false),
            act(Target::ConditioningPump, false),
        ],
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Names of the sibling leaves the cycle reads and drives.
#[derive(Debug, Clone)]
pub struct Deps {
    pub water_level: String,
    pub temperature: String,
    pub plate_a: String,
    pub plate_b: String,
    pub conditioning_pump: String,
    pub irrigation_pump: String,
}

impl From<&WateringSection> for Deps {
    fn from(w: &WateringSection) -> Self {
        Self {
            water_level: w.water_level.clone(),
            temperature: w.temperature.clone(),
            plate_a: w.plate_a.clone(),
            plate_b: w.plate_b.clone(),
            conditioning_pump: w.conditioning_pump.clone(),
            irrigation_pump: w.irrigation_pump.clone(),
        }
    }
}

impl Deps {
    fn leaf_for(&self, target: Target) -> &str {
        match target {
            Target::PlateA => &self.plate_a,
            Target::PlateB => &self.plate_b,
            Target::ConditioningPump => &self.conditioning_pump,
            Target::IrrigationPump => &self.irrigation_pump,
        }
    }

    /// Every `(leaf, param)` the cycle touches.
    fn required(&self) -> Vec<(&str, &str)> {
        vec![
            (self.water_level.as_str(), "level"),
            (self.water_level.as_str(), "trg_high"),
            (self.water_level.as_str(), "trg_low"),
            (self.water_level.as_str(), "active"),
            (self.temperature.as_str(), "active"),
            (self.temperature.as_str(), "temp_0"),
            (self.temperature.as_str(), "temp_1"),
            (self.plate_a.as_str(), "status"),
            (self.plate_b.as_str(), "status"),
            (self.irrigation_pump.as_str(), "status"),
            (self.conditioning_pump.as_str(), "status"),
            (self.conditioning_pump.as_str(), "power"),
        ]
    }
}

async fn read_bool(ctx: &Context, leaf: &str, param: &str) -> Result<bool> {
    let v = ctx.read_param(leaf, param).await?;
    v.as_bool()
        .ok_or_else(|| GrowError::invalid(format!("{leaf}.{param} is not a bool")))
}

async fn read_double(ctx: &Context, leaf: &str, param: &str) -> Result<f64> {
    let v = ctx.read_param(leaf, param).await?;
    v.as_f64()
        .ok_or_else(|| GrowError::invalid(format!("{leaf}.{param} is not a double")))
}

async fn read_all(leaf: &LeafHandle, deps: &Deps) -> Result<Readings> {
    let ctx = leaf.context();
    Ok(Readings {
        level_active: read_bool(ctx, &deps.water_level, "active").await?,
        trg_high: read_bool(ctx, &deps.water_level, "trg_high").await?,
        trg_low: read_bool(ctx, &deps.water_level, "trg_low").await?,
        temp_active: read_bool(ctx, &deps.temperature, "active").await?,
        water_temp: read_double(ctx, &deps.temperature, "temp_0").await?,
        target_temp: leaf.get_double(WAT_T_TEMP).await?,
        duration_sec: leaf.get_double(WAT_TIME).await?,
    })
}

async fn apply(ctx: &Context, deps: &Deps, actuations: &[Actuation]) {
    for a in actuations {
        let name = deps.leaf_for(a.target);
        if let Err(e) = ctx.set_param(name, "status", ParamValue::Bool(a.on)).await {
            warn!(leaf = %name, on = a.on, "actuation failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation and trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    pub poll: Duration,
    pub max_thermal: Duration,
}

impl From<&WateringSection> for CycleTiming {
    fn from(w: &WateringSection) -> Self {
        Self {
            poll: Duration::from_millis(w.poll_ms.max(1)),
            max_thermal: Duration::from_secs(w.max_thermal_cycle_sec),
        }
    }
}

/// Run one watering cycle to its exit. Every exit leaves all four outputs
/// off.
pub async fn run_invocation(leaf: &LeafHandle, deps: &Deps, timing: CycleTiming) -> Exit {
    let ctx = leaf.context();
    let mut cycle = WateringCycle::new(timing.poll.as_millis() as u64, timing.max_thermal);
    info!(leaf = %leaf.name(), "watering cycle started");

    loop {
        let step = match read_all(leaf, deps).await {
            Ok(r) => cycle.step(&r, Instant::now()),
            Err(e) => {
                warn!(leaf = %leaf.name(), label = e.as_label(), "dependency read failed: {e}");
                cycle.dependency_lost()
            }
        };
        apply(ctx, deps, &step.actuations).await;

        if let Flow::Finished(exit) = step.flow {
            info!(leaf = %leaf.name(), ?exit, "watering cycle finished");
            ctx.log(&format!("watering: {exit:?}")).await;
            return exit;
        }
        sleep(timing.poll).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    pub active: bool,
    pub interval: Duration,
}

impl TriggerConfig {
    async fn from_leaf(leaf: &LeafHandle) -> Self {
        let active = leaf.get_bool(ACTIVE).await.unwrap_or(false);
        let secs = leaf.get_double(WAT_INT).await.unwrap_or(3600.0).max(1.0);
        Self {
            active,
            interval: Duration::from_secs_f64(secs),
        }
    }
}

/// Push the leaf's current trigger params to `tx`. Returns whether they
/// changed.
async fn refresh_trigger(leaf: &LeafHandle, tx: &watch::Sender<TriggerConfig>) -> bool {
    let next = TriggerConfig::from_leaf(leaf).await;
    tx.send_if_modified(|cfg| {
        if *cfg == next {
            return false;
        }
        *cfg = next;
        true
    })
}

/// Invoke `cycle` every `interval` while `active`. Any config change
/// re-arms the timer; invocations never overlap.
pub async fn run_trigger<F, Fut>(mut config: watch::Receiver<TriggerConfig>, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Exit>,
{
    loop {
        let cfg = *config.borrow_and_update();
        if !cfg.active {
            debug!("watering trigger disarmed");
            if config.changed().await.is_err() {
                return;
            }
            continue;
        }

        debug!(interval_secs = cfg.interval.as_secs(), "watering trigger armed");
        let mut ticker = interval_at(Instant::now() + cfg.interval, cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let exit = cycle().await;
                    debug!(?exit, "watering invocation done");
                }
                changed = config.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Leaf
// ---------------------------------------------------------------------------

pub struct WateringLeaf {
    section: WateringSection,
}

impl WateringLeaf {
    pub fn new(section: WateringSection) -> Self {
        Self { section }
    }

    async fn declare(leaf: &LeafHandle) -> Result<()> {
        leaf.create_param(
            WAT_TIME,
            20.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(duration_range),
        )
        .await?;
        leaf.create_param(
            WAT_INT,
            3600.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(interval_range),
        )
        .await?;
        leaf.create_param(
            WAT_T_TEMP,
            22.0.into(),
            Access::Write,
            Storage::Persisted,
            Some(target_temp_range),
        )
        .await?;
        leaf.create_param(ACTIVE, false.into(), Access::ReadWrite, Storage::Persisted, None)
            .await
    }
}

#[async_trait]
impl LeafType for WateringLeaf {
    fn kind(&self) -> &'static str {
        "watering"
    }

    async fn configure(&self, leaf: &LeafHandle) -> Descriptor {
        if let Err(e) = Self::declare(leaf).await {
            return Descriptor::failed("watering", e.to_string());
        }

        let deps = Deps::from(&self.section);
        for (name, param) in deps.required() {
            if let Err(e) = leaf.context().read_param(name, param).await {
                return Descriptor::failed("watering", format!("dependency {name}.{param}: {e}"));
            }
        }

        Descriptor::new(
            "watering",
            Box::new(WateringTask {
                deps,
                timing: CycleTiming::from(&self.section),
            }),
        )
    }
}

struct WateringTask {
    deps: Deps,
    timing: CycleTiming,
}

#[async_trait]
impl LeafTask for WateringTask {
    async fn run(self: Box<Self>, leaf: LeafHandle, mut mailbox: Mailbox) {
        let (config_tx, config_rx) = watch::channel(TriggerConfig::from_leaf(&leaf).await);

        let WateringTask { deps, timing } = *self;
        let cycle_leaf = leaf.clone();
        tokio::spawn(run_trigger(config_rx, move || {
            let leaf = cycle_leaf.clone();
            let deps = deps.clone();
            async move { run_invocation(&leaf, &deps, timing).await }
        }));

        loop {
            if let Some(ev) = mailbox.next().await {
                match ev.kind {
                    EventKind::ParamChangeRequest => {
                        if let Err(e) = apply_change_request(&leaf, &ev).await {
                            log_rejected(&leaf, &ev, &e);
                        }
                    }
                    EventKind::ParamChanged => {
                        debug!(
                            leaf = %leaf.name(),
                            param = ev.param.as_deref().unwrap_or(""),
                            value = %ev.payload_str(),
                            "param changed"
                        );
                    }
                    _ => {}
                }
            }
            // Params may also be written directly, without a mailbox event.
            refresh_trigger(&leaf, &config_tx).await;
            mailbox.pause().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
