// Copyright 2022 The mt-dnn-rs Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
/// # Learning rate schedule shape after warmup
pub enum ScheduleKind {
    Linear,
    Cosine,
    Constant,
    Polynomial,
}

impl ScheduleKind {
    /// Maps the numeric `scheduler_type` option: 1 cosine, 2 constant, 3 polynomial, anything else
    /// linear.
    pub fn from_code(code: u8) -> ScheduleKind {
        match code {
            1 => ScheduleKind::Cosine,
            2 => ScheduleKind::Constant,
            3 => ScheduleKind::Polynomial,
            _ => ScheduleKind::Linear,
        }
    }
}

/// # Learning rate scheduler with warmup
/// Multiplies the base learning rate by a factor depending on the number of scheduler steps taken.
/// A scheduler without a known number of training steps keeps the base learning rate.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    kind: ScheduleKind,
    base_lr: f64,
    warmup_steps: f64,
    total_steps: Option<f64>,
    current_step: i64,
    lr_end: f64,
    power: f64,
}

impl LrScheduler {
    /// Build a new scheduler
    ///
    /// # Arguments
    ///
    /// * `kind` - schedule shape
    /// * `base_lr` - peak learning rate
    /// * `warmup` - fraction of `num_train_step` spent in linear warmup
    /// * `num_train_step` - total number of optimizer steps, non-positive if unknown
    pub fn new(kind: ScheduleKind, base_lr: f64, warmup: f64, num_train_step: i64) -> LrScheduler {
        let total_steps = (num_train_step > 0).then_some(num_train_step as f64);
        LrScheduler {
            kind,
            base_lr,
            warmup_steps: total_steps.map_or(0.0, |total| warmup * total),
            total_steps,
            current_step: 0,
            lr_end: 1e-7,
            power: 1.0,
        }
    }

    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    pub fn set_current_step(&mut self, step: i64) {
        self.current_step = step;
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Learning rate for the next optimizer step.
    pub fn lr(&self) -> f64 {
        self.base_lr * self.multiplier(self.current_step as f64)
    }

    fn multiplier(&self, step: f64) -> f64 {
        let total = match self.total_steps {
            Some(total) => total,
            None => return 1.0,
        };
        let warmup = self.warmup_steps;
        if step < warmup {
            return step / warmup.max(1.0);
        }
        match self.kind {
            ScheduleKind::Constant => 1.0,
            ScheduleKind::Linear => ((total - step) / (total - warmup).max(1.0)).max(0.0),
            ScheduleKind::Cosine => {
                let progress = (step - warmup) / (total - warmup).max(1.0);
                (0.5 * (1.0 + (PI * 0.5 * 2.0 * progress).cos())).max(0.0)
            }
            ScheduleKind::Polynomial => {
                if self.base_lr <= self.lr_end {
                    return 1.0;
                }
                if step > total {
                    return self.lr_end / self.base_lr;
                }
                let lr_range = self.base_lr - self.lr_end;
                let remaining = 1.0 - (step - warmup) / (total - warmup).max(1.0);
                (lr_range * remaining.powf(self.power) + self.lr_end) / self.base_lr
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lr_at(scheduler: &mut LrScheduler, step: i64) -> f64 {
        scheduler.set_current_step(step);
        scheduler.lr()
    }

    #[test]
    fn linear_warmup_then_decay() {
        let mut scheduler = LrScheduler::new(ScheduleKind::Linear, 1.0, 0.1, 100);
        assert_eq!(lr_at(&mut scheduler, 0), 0.0);
        assert!((lr_at(&mut scheduler, 5) - 0.5).abs() < 1e-12);
        assert!((lr_at(&mut scheduler, 10) - 1.0).abs() < 1e-12);
        assert!((lr_at(&mut scheduler, 55) - 0.5).abs() < 1e-12);
        assert_eq!(lr_at(&mut scheduler, 100), 0.0);
        assert_eq!(lr_at(&mut scheduler, 150), 0.0);
    }

    #[test]
    fn cosine_reaches_half_at_mid_decay() {
        let mut scheduler = LrScheduler::new(ScheduleKind::Cosine, 2.0, 0.0, 100);
        assert!((lr_at(&mut scheduler, 0) - 2.0).abs() < 1e-12);
        assert!((lr_at(&mut scheduler, 50) - 1.0).abs() < 1e-9);
        assert!(lr_at(&mut scheduler, 100).abs() < 1e-9);
    }

    #[test]
    fn constant_after_warmup() {
        let mut scheduler = LrScheduler::new(ScheduleKind::Constant, 1.0, 0.5, 10);
        assert!((lr_at(&mut scheduler, 1) - 0.2).abs() < 1e-12);
        assert_eq!(lr_at(&mut scheduler, 9), 1.0);
    }

    #[test]
    fn polynomial_decays_to_lr_end() {
        let mut scheduler = LrScheduler::new(ScheduleKind::Polynomial, 1e-3, 0.0, 10);
        assert!((lr_at(&mut scheduler, 0) - 1e-3).abs() < 1e-12);
        assert!((lr_at(&mut scheduler, 10) - 1e-7).abs() < 1e-12);
        assert!((lr_at(&mut scheduler, 20) - 1e-7).abs() < 1e-12);
    }

    #[test]
    fn unknown_training_length_keeps_base_lr() {
        let mut scheduler = LrScheduler::new(ScheduleKind::Linear, 3e-5, 0.1, -1);
        assert_eq!(lr_at(&mut scheduler, 0), 3e-5);
        assert_eq!(lr_at(&mut scheduler, 1000), 3e-5);
    }

    #[test]
    fn scheduler_codes() {
        assert_eq!(ScheduleKind::from_code(0), ScheduleKind::Linear);
        assert_eq!(ScheduleKind::from_code(1), ScheduleKind::Cosine);
        assert_eq!(ScheduleKind::from_code(2), ScheduleKind::Constant);
        assert_eq!(ScheduleKind::from_code(3), ScheduleKind::Polynomial);
    }
}
