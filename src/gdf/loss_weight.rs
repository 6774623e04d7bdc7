//! Per-sample loss weighting policies
//!
//! Two policies are supported: a fixed P2 curve over log-SNR and an adaptive
//! bucketed scheme that tracks a smoothed loss per log-SNR bucket and weights
//! by its reciprocal, equalizing effective gradient contribution across noise
//! levels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LossWeightError {
    #[error("adaptive snapshot has {ranges} boundaries but {losses} bucket losses (expected boundaries - 1)")]
    SnapshotShape { ranges: usize, losses: usize },
    #[error("adaptive snapshot boundaries are not strictly increasing at index {0}")]
    SnapshotOrder(usize),
}

/// P2 weighting: weight = (k + exp(logSNR * s))^(-gamma).
#[derive(Debug, Clone)]
pub struct P2LossWeight {
    pub k: f64,
    pub gamma: f64,
    pub s: f64,
}

impl Default for P2LossWeight {
    fn default() -> Self {
        Self { k: 1.0, gamma: 1.0, s: 1.0 }
    }
}

impl P2LossWeight {
    pub fn weight(&self, logsnr: f64) -> f64 {
        (self.k + (logsnr * self.s).exp()).powf(-self.gamma)
    }
}

/// Checkpoint-persisted view of the adaptive bucket state. Serialized into
/// the run info document and restored bit-for-bit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveLossSnapshot {
    pub bucket_ranges: Vec<f64>,
    pub bucket_losses: Vec<f64>,
}

/// Adaptive bucketed weighting over a fixed log-SNR range.
///
/// Bucket losses start at 1.0 so every bucket yields a neutral weight until
/// its first observation. Updates are exponentially smoothed; buckets that
/// never receive an observation keep their current value.
#[derive(Debug, Clone)]
pub struct AdaptiveLossWeight {
    boundaries: Vec<f64>,
    losses: Vec<f64>,
    alpha: f64,
    weight_range: (f64, f64),
}

impl Default for AdaptiveLossWeight {
    fn default() -> Self {
        Self::new((-10.0, 10.0), 300)
    }
}

impl AdaptiveLossWeight {
    pub fn new(logsnr_range: (f64, f64), buckets: usize) -> Self {
        let (lo, hi) = logsnr_range;
        let boundaries = (0..=buckets)
            .map(|i| lo + (hi - lo) * i as f64 / buckets as f64)
            .collect();
        Self::from_parts(boundaries, vec![1.0; buckets])
    }

    pub fn from_parts(boundaries: Vec<f64>, losses: Vec<f64>) -> Self {
        debug_assert_eq!(boundaries.len(), losses.len() + 1);
        Self { boundaries, losses, alpha: 0.99, weight_range: (1e-7, 1e7) }
    }

    /// Bucket index for a log-SNR value, clamped to the end buckets.
    fn bucket(&self, logsnr: f64) -> usize {
        let idx = self.boundaries.partition_point(|b| *b <= logsnr);
        idx.saturating_sub(1).min(self.losses.len() - 1)
    }

    pub fn weight(&self, logsnr: f64) -> f64 {
        let (lo, hi) = self.weight_range;
        (1.0 / self.losses[self.bucket(logsnr)]).clamp(lo, hi)
    }

    /// Fold one observed (log-SNR, loss) pair into its bucket.
    pub fn update(&mut self, logsnr: f64, loss: f64) {
        let idx = self.bucket(logsnr);
        self.losses[idx] = self.losses[idx] * self.alpha + loss * (1.0 - self.alpha);
    }

    pub fn snapshot(&self) -> AdaptiveLossSnapshot {
        AdaptiveLossSnapshot {
            bucket_ranges: self.boundaries.clone(),
            bucket_losses: self.losses.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &AdaptiveLossSnapshot) -> Result<(), LossWeightError> {
        if snapshot.bucket_ranges.len() != snapshot.bucket_losses.len() + 1 {
            return Err(LossWeightError::SnapshotShape {
                ranges: snapshot.bucket_ranges.len(),
                losses: snapshot.bucket_losses.len(),
            });
        }
        for (i, pair) in snapshot.bucket_ranges.windows(2).enumerate() {
            if pair[0] >= pair[1] {
                return Err(LossWeightError::SnapshotOrder(i));
            }
        }
        self.boundaries = snapshot.bucket_ranges.clone();
        self.losses = snapshot.bucket_losses.clone();
        Ok(())
    }
}

/// The policy in use for a run, dispatched by match at the call sites.
#[derive(Debug, Clone)]
pub enum LossWeight {
    P2(P2LossWeight),
    Adaptive(AdaptiveLossWeight),
}

impl LossWeight {
    /// Per-sample weights. `loss_shift != 1` reparameterizes the lookup as
    /// logSNR + 2*ln(1/loss_shift) without touching the stored buckets.
    pub fn weights(&self, logsnr: &[f64], loss_shift: f64) -> Vec<f64> {
        let offset = if loss_shift != 1.0 { 2.0 * (1.0 / loss_shift).ln() } else { 0.0 };
        logsnr
            .iter()
            .map(|&l| {
                let l = l + offset;
                match self {
                    LossWeight::P2(p2) => p2.weight(l),
                    LossWeight::Adaptive(ad) => ad.weight(l),
                }
            })
            .collect()
    }

    /// Feed raw (unshifted) observations back into the adaptive buckets.
    /// No-op for fixed policies.
    pub fn update_buckets(&mut self, logsnr: &[f64], losses: &[f64]) {
        if let LossWeight::Adaptive(ad) = self {
            for (&l, &loss) in logsnr.iter().zip(losses.iter()) {
                ad.update(l, loss);
            }
        }
    }

    pub fn snapshot(&self) -> Option<AdaptiveLossSnapshot> {
        match self {
            LossWeight::Adaptive(ad) => Some(ad.snapshot()),
            LossWeight::P2(_) => None,
        }
    }

    pub fn restore(&mut self, snapshot: &AdaptiveLossSnapshot) -> Result<(), LossWeightError> {
        match self {
            LossWeight::Adaptive(ad) => ad.restore(snapshot),
            LossWeight::P2(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2_defaults_match_curve() {
        let p2 = P2LossWeight::default();
        assert!((p2.weight(0.0) - 0.5).abs() < 1e-12);
        assert!(p2.weight(-10.0) > p2.weight(0.0));
        assert!(p2.weight(0.0) > p2.weight(10.0));
    }

    #[test]
    fn unobserved_buckets_weight_neutrally() {
        let ad = AdaptiveLossWeight::default();
        for logsnr in [-9.5, 0.0, 3.3, 9.9] {
            assert_eq!(ad.weight(logsnr), 1.0);
        }
    }

    #[test]
    fn update_touches_only_the_matching_bucket() {
        let mut ad = AdaptiveLossWeight::from_parts(
            vec![-10.0, -5.0, 0.0, 5.0, 10.0],
            vec![1.0; 4],
        );
        ad.update(2.0, 0.5);
        let snap = ad.snapshot();
        assert_eq!(snap.bucket_losses[0], 1.0);
        assert_eq!(snap.bucket_losses[1], 1.0);
        assert!((snap.bucket_losses[2] - (1.0 * 0.99 + 0.5 * 0.01)).abs() < 1e-12);
        assert_eq!(snap.bucket_losses[3], 1.0);
    }

    #[test]
    fn out_of_range_observations_clamp_to_end_buckets() {
        let mut ad = AdaptiveLossWeight::from_parts(
            vec![-10.0, -5.0, 0.0, 5.0, 10.0],
            vec![1.0; 4],
        );
        ad.update(-42.0, 2.0);
        ad.update(42.0, 2.0);
        let snap = ad.snapshot();
        assert!(snap.bucket_losses[0] > 1.0);
        assert!(snap.bucket_losses[3] > 1.0);
        assert_eq!(snap.bucket_losses[1], 1.0);
        assert_eq!(snap.bucket_losses[2], 1.0);
    }

    #[test]
    fn weight_is_reciprocal_of_smoothed_loss() {
        let mut ad = AdaptiveLossWeight::from_parts(vec![-10.0, 10.0], vec![1.0]);
        for _ in 0..2000 {
            ad.update(0.0, 4.0);
        }
        let w = ad.weight(0.0);
        assert!((w - 0.25).abs() < 1e-3, "weight converged to {}", w);
    }

    #[test]
    fn loss_shift_moves_the_lookup_not_the_buckets() {
        let mut ad = AdaptiveLossWeight::from_parts(
            vec![-10.0, 0.0, 10.0],
            vec![1.0, 1.0],
        );
        ad.update(5.0, 0.5);
        let lw = LossWeight::Adaptive(ad);
        // shift 0.5 adds 2*ln(2) ~ 1.386: logsnr 4 stays in the upper bucket
        let shifted = lw.weights(&[4.0], 0.5);
        let unshifted = lw.weights(&[4.0], 1.0);
        assert_eq!(shifted, unshifted);
        // a lookup just below zero crosses into the upper bucket when shifted
        let crossing = lw.weights(&[-1.0], 0.5);
        assert!(crossing[0] > 1.0);
        assert_eq!(lw.weights(&[-1.0], 1.0)[0], 1.0);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut ad = AdaptiveLossWeight::default();
        ad.update(1.0, 0.25);
        ad.update(-3.0, 2.0);
        let snap = ad.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: AdaptiveLossSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);

        let mut fresh = AdaptiveLossWeight::default();
        fresh.restore(&back).unwrap();
        assert_eq!(fresh.snapshot(), snap);
    }

    #[test]
    fn restore_rejects_malformed_snapshots() {
        let mut ad = AdaptiveLossWeight::default();
        let bad_shape = AdaptiveLossSnapshot {
            bucket_ranges: vec![0.0, 1.0],
            bucket_losses: vec![1.0, 1.0],
        };
        assert!(ad.restore(&bad_shape).is_err());
        let bad_order = AdaptiveLossSnapshot {
            bucket_ranges: vec![0.0, 2.0, 1.0],
            bucket_losses: vec![1.0, 1.0],
        };
        assert!(ad.restore(&bad_order).is_err());
    }
}
