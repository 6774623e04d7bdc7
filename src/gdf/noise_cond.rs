//! Noise conditioning encoder fed to the denoiser alongside the noised input

use std::f64::consts::PI;

/// Maps log-SNR back into cosine-schedule progress, producing the timestep
/// conditioning value in [0, 1].
#[derive(Debug, Clone)]
pub struct CosineTNoiseCond {
    s: f64,
    min_var: f64,
    clamp_range: (f64, f64),
}

impl Default for CosineTNoiseCond {
    fn default() -> Self {
        Self::new(0.008, (0.0, 1.0))
    }
}

impl CosineTNoiseCond {
    pub fn new(s: f64, clamp_range: (f64, f64)) -> Self {
        let min_var = (s / (1.0 + s) * PI * 0.5).cos().powi(2);
        Self { s, min_var, clamp_range }
    }

    pub fn cond(&self, logsnr: f64) -> f64 {
        let var = super::schedule::sigmoid(logsnr).clamp(self.clamp_range.0, self.clamp_range.1);
        ((var * self.min_var).sqrt().acos() / (PI * 0.5)) * (1.0 + self.s) - self.s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdf::schedule::CosineSchedule;

    #[test]
    fn conditioning_tracks_schedule_progress() {
        let schedule = CosineSchedule::default();
        let cond = CosineTNoiseCond::default();
        for i in 1..10 {
            let t = i as f64 / 10.0;
            let c = cond.cond(schedule.logsnr(t));
            assert!(
                (c - t).abs() < 1e-3,
                "conditioning should invert the schedule at t={}: got {}",
                t,
                c
            );
        }
    }

    #[test]
    fn conditioning_stays_in_unit_range() {
        let cond = CosineTNoiseCond::default();
        for logsnr in [-40.0, -10.0, 0.0, 10.0, 40.0] {
            let c = cond.cond(logsnr);
            assert!((-1e-9..=1.0 + 1e-9).contains(&c), "cond({}) = {}", logsnr, c);
        }
    }
}
