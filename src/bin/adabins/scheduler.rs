use std::f64::consts::PI;
use tch::nn::Optimizer;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("total steps must be positive")]
    ZeroSteps,
    #[error("at least one parameter group is required")]
    NoGroups,
    #[error("pct_start must lie in (0, 1), got {0}")]
    InvalidPctStart(f64),
}

/// One-cycle learning rate policy with cosine annealing.
///
/// The learning rate of every group warms up from `max_lr / div_factor` to
/// `max_lr` over the first `pct_start` of the schedule and then anneals to
/// `max_lr / (div_factor * final_div_factor)`. Momentum (Adam's beta1) moves in
/// the opposite direction between `max_momentum` and `base_momentum`.
#[derive(Debug, Clone)]
pub struct OneCycleScheduler {
    max_lrs: Vec<f64>,
    total_steps: usize,
    div_factor: f64,
    final_div_factor: f64,
    pct_start: f64,
    base_momentum: f64,
    max_momentum: f64,
    step: usize,
}

impl OneCycleScheduler {
    pub fn new(
        max_lrs: Vec<f64>,
        total_steps: usize,
        div_factor: f64,
        final_div_factor: f64,
    ) -> Result<Self, SchedulerError> {
        if total_steps == 0 {
            return Err(SchedulerError::ZeroSteps);
        }
        if max_lrs.is_empty() {
            return Err(SchedulerError::NoGroups);
        }

        Ok(Self {
            max_lrs,
            total_steps,
            div_factor,
            final_div_factor,
            pct_start: 0.3,
            base_momentum: 0.85,
            max_momentum: 0.95,
            step: 0,
        })
    }

    pub fn with_pct_start(mut self, pct_start: f64) -> Result<Self, SchedulerError> {
        if !(pct_start > 0.0 && pct_start < 1.0) {
            return Err(SchedulerError::InvalidPctStart(pct_start));
        }
        self.pct_start = pct_start;
        Ok(self)
    }

    pub fn with_momentum(mut self, base_momentum: f64, max_momentum: f64) -> Self {
        self.base_momentum = base_momentum;
        self.max_momentum = max_momentum;
        self
    }

    /// Current learning rate of every parameter group, in group order.
    pub fn lrs(&self) -> Vec<f64> {
        let (warmup, pct) = self.phase();
        self.max_lrs
            .iter()
            .map(|&max_lr| {
                let initial_lr = max_lr / self.div_factor;
                let min_lr = initial_lr / self.final_div_factor;
                if warmup {
                    cosine_anneal(initial_lr, max_lr, pct)
                } else {
                    cosine_anneal(max_lr, min_lr, pct)
                }
            })
            .collect()
    }

    pub fn momentum(&self) -> f64 {
        let (warmup, pct) = self.phase();
        if warmup {
            cosine_anneal(self.max_momentum, self.base_momentum, pct)
        } else {
            cosine_anneal(self.base_momentum, self.max_momentum, pct)
        }
    }

    /// Advances one optimizer step. Past the end of the schedule the final
    /// values are held.
    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn apply(&self, optimizer: &mut Optimizer) {
        let momentum = self.momentum();
        for (group, lr) in self.lrs().into_iter().enumerate() {
            optimizer.set_lr_group(group, lr);
            optimizer.set_momentum_group(group, momentum);
        }
    }

    fn phase(&self) -> (bool, f64) {
        let step = self.step.min(self.total_steps - 1) as f64;
        let warmup_end = self.pct_start * self.total_steps as f64 - 1.0;
        let anneal_end = (self.total_steps - 1) as f64;

        if step <= warmup_end {
            (true, progress(step, 0.0, warmup_end))
        } else {
            (false, progress(step, warmup_end, anneal_end))
        }
    }
}

fn progress(step: f64, start: f64, end: f64) -> f64 {
    if end <= start {
        1.0
    } else {
        (step - start) / (end - start)
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}
