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

use tch::{no_grad, Tensor};
use tracing::warn;

/// # Dynamic loss scaler for mixed precision training
/// The loss is multiplied by the current scale before the backward pass. Before the optimizer step
/// the gradients are divided by the scale and checked: on overflow the step is skipped and the scale
/// halved, after `scale_window` consecutive clean steps the scale is doubled.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    scale_window: usize,
    growth_factor: f64,
    backoff_factor: f64,
    min_scale: f64,
    clean_steps: usize,
}

impl LossScaler {
    pub fn new(init_scale: f64, scale_window: usize) -> LossScaler {
        LossScaler {
            scale: init_scale,
            scale_window: scale_window.max(1),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            min_scale: 1.0,
            clean_steps: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        loss * self.scale
    }

    /// Divides the gradients by the current scale. Returns `false` if any gradient is not finite,
    /// in which case the optimizer step must be skipped.
    pub fn unscale_gradients<'a, I>(&self, parameters: I) -> bool
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        let inverse_scale = 1.0 / self.scale;
        no_grad(|| {
            let mut finite = true;
            for param in parameters {
                let mut grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let unscaled = &grad * inverse_scale;
                grad.copy_(&unscaled);
                if finite && unscaled.isfinite().all().int64_value(&[]) == 0 {
                    finite = false;
                }
            }
            finite
        })
    }

    /// Adjusts the scale after a step attempt.
    pub fn update(&mut self, overflow: bool) {
        if overflow {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.clean_steps = 0;
            warn!(scale = self.scale, "gradient overflow, skipping step and reducing loss scale");
        } else {
            self.clean_steps += 1;
            if self.clean_steps % self.scale_window == 0 {
                self.scale *= self.growth_factor;
            }
        }
    }
}
