//! Per-epoch exponential learning rate decay.

use crate::optimizer::AdamW;

/// Exponential learning rate scheduler, stepped once per epoch.
///
/// The rate is computed in closed form, `initial_lr * gamma^last_epoch`, so a
/// scheduler rebuilt at a saved epoch yields the same rate the interrupted
/// run was using.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialLr {
    /// Base learning rate
    initial_lr: f64,
    /// Multiplicative decay per epoch
    gamma: f64,
    /// Completed epochs
    last_epoch: i64,
}

impl ExponentialLr {
    /// Scheduler for a fresh run; sets the optimizer to its initial rate.
    pub fn new(optimizer: &mut AdamW, gamma: f64) -> Self {
        Self::resume(optimizer, gamma, -1)
    }

    /// Scheduler continuing from `epoch`; `-1` means a fresh run.
    ///
    /// The optimizer's rate is overwritten with the scheduled value.
    pub fn resume(optimizer: &mut AdamW, gamma: f64, epoch: i64) -> Self {
        let scheduler = Self {
            initial_lr: optimizer.initial_learning_rate(),
            gamma,
            last_epoch: epoch.max(0),
        };
        optimizer.set_learning_rate(scheduler.get_lr());
        scheduler
    }

    /// Get learning rate for the current epoch.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        #[allow(clippy::cast_possible_truncation)]
        let exponent = self.last_epoch.min(i64::from(i32::MAX)) as i32;
        self.initial_lr * self.gamma.powi(exponent)
    }

    /// Number of completed epochs.
    #[must_use]
    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.get_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::AdamWConfig;

    fn optimizer(lr: f64) -> AdamW {
        AdamW::new(
            Vec::new(),
            AdamWConfig {
                learning_rate: lr,
                ..AdamWConfig::default()
            },
        )
    }

    #[test]
    fn test_fresh_scheduler_keeps_initial_rate() {
        let mut opt = optimizer(0.1);
        let scheduler = ExponentialLr::new(&mut opt, 0.5);
        assert_eq!(scheduler.last_epoch(), 0);
        assert_eq!(opt.learning_rate(), 0.1);
    }

    #[test]
    fn test_step_decays_once_per_call() {
        let mut opt = optimizer(0.1);
        let mut scheduler = ExponentialLr::new(&mut opt, 0.5);
        scheduler.step(&mut opt);
        assert!((opt.learning_rate() - 0.05).abs() < 1e-12);
        scheduler.step(&mut opt);
        assert!((opt.learning_rate() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_resume_matches_uninterrupted_schedule() {
        let mut a = optimizer(2e-4);
        let mut scheduler = ExponentialLr::new(&mut a, 0.999);
        for _ in 0..7 {
            scheduler.step(&mut a);
        }

        let mut b = optimizer(2e-4);
        // Decayed rate from a checkpoint must not be decayed again.
        b.set_learning_rate(1e-9);
        let resumed = ExponentialLr::resume(&mut b, 0.999, 7);
        assert_eq!(resumed, scheduler);
        assert!((a.learning_rate() - b.learning_rate()).abs() < 1e-15);
    }

    #[test]
    fn test_resume_from_negative_epoch() {
        let mut opt = optimizer(1.0);
        let scheduler = ExponentialLr::resume(&mut opt, 0.9, -1);
        assert_eq!(scheduler.last_epoch(), 0);
        assert_eq!(opt.learning_rate(), 1.0);
    }
}
