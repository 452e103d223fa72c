//! Sensor simulation for nodes without probes attached.
//!
//! Each channel is a random walk with mean reversion plus per-reading
//! noise, so consecutive samples stay coherent while wandering around a
//! resting value.

/// Approximate a sample from N(0,1) (Irwin-Hall: sum of 12 uniforms - 6).
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

#[derive(Debug, Clone, Copy)]
pub struct WalkProfile {
    /// Resting value the walk is pulled toward.
    pub center: f64,
    pub walk_sigma: f64,
    /// Fraction of the distance to `center` recovered each sample.
    pub mean_reversion: f64,
    pub noise_sigma: f64,
    pub min: f64,
    pub max: f64,
}

impl WalkProfile {
    /// Water column height in millimetres.
    pub const WATER_LEVEL_MM: WalkProfile = WalkProfile {
        center: 70.0,
        walk_sigma: 1.5,
        mean_reversion: 0.05,
        noise_sigma: 0.5,
        min: 0.0,
        max: 200.0,
    };

    /// Reservoir and plate temperature in °C.
    pub const TEMPERATURE_C: WalkProfile = WalkProfile {
        center: 22.0,
        walk_sigma: 0.15,
        mean_reversion: 0.03,
        noise_sigma: 0.05,
        min: -10.0,
        max: 60.0,
    };
}

/// One simulated channel.
pub struct Walk {
    profile: WalkProfile,
    base: f64,
}

impl Walk {
    pub fn new(profile: WalkProfile) -> Self {
        let span = profile.max - profile.min;
        let base = gaussian(profile.center, span * 0.01).clamp(profile.min, profile.max);
        Self { profile, base }
    }

    /// Advance the walk and return the next reading.
    pub fn sample(&mut self) -> f64 {
        let p = &self.profile;
        let pull = p.mean_reversion * (p.center - self.base);
        let walk = gaussian(0.0, p.walk_sigma);
        self.base = (self.base + pull + walk).clamp(p.min, p.max);

        let reading = self.base + gaussian(0.0, p.noise_sigma);
        reading.clamp(p.min, p.max)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_stay_in_range() {
        let mut w = Walk::new(WalkProfile::WATER_LEVEL_MM);
        for _ in 0..1000 {
            let v = w.sample();
            assert!((0.0..=200.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn consecutive_readings_are_coherent() {
        let mut w = Walk::new(WalkProfile::TEMPERATURE_C);
        let samples: Vec<f64> = (0..200).map(|_| w.sample()).collect();
        let max_jump = samples
            .windows(2)
            .map(|p| (p[1] - p[0]).abs())
            .fold(0.0, f64::max);
        assert!(max_jump < 3.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn walk_reverts_toward_center() {
        let mut w = Walk::new(WalkProfile::TEMPERATURE_C);
        w.base = 40.0;
        for _ in 0..300 {
            w.sample();
        }
        assert!((w.base - 22.0).abs() < 10.0, "did not revert: {}", w.base);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
