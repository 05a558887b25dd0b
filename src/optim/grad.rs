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

use tch::{no_grad, Kind, Tensor};

/// Rescales the gradients of `parameters` in place so that their global L2 norm does not exceed
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm<'a, I>(parameters: I, max_norm: f64) -> f64
where
    I: IntoIterator<Item = &'a Tensor>,
{
    let grads = parameters
        .into_iter()
        .map(|param| param.grad())
        .filter(|grad| grad.defined())
        .collect::<Vec<Tensor>>();
    if grads.is_empty() {
        return 0.0;
    }
    let total_norm = no_grad(|| {
        grads
            .iter()
            .map(|grad| grad.to_kind(Kind::Float).norm().square())
            .fold(Tensor::from(0f64), |acc, value| acc + value.to_kind(Kind::Double))
            .sqrt()
            .double_value(&[])
    });
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        no_grad(|| {
            for mut grad in grads {
                let clipped = &grad * clip_coef;
                grad.copy_(&clipped);
            }
        });
    }
    total_norm
}
