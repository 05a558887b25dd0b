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

use crate::common::error::MtDnnError;
use crate::config::OptimizerType;
use std::collections::HashMap;
use tch::{nn, no_grad, Kind, Tensor};

/// Parameter name fragments excluded from weight decay.
pub const NO_DECAY: [&str; 5] = ["bias", "gamma", "beta", "LayerNorm.bias", "LayerNorm.weight"];

/// # Named parameters sharing a weight decay value
pub struct ParamGroup {
    pub weight_decay: f64,
    pub params: Vec<(String, Tensor)>,
}

/// Splits the trainable variables of `vs` in a decayed group and a non-decayed group (biases and
/// layer normalization parameters). Parameters are sorted by name.
pub fn param_groups(vs: &nn::VarStore, weight_decay: f64) -> Vec<ParamGroup> {
    let mut variables = vs
        .variables()
        .into_iter()
        .filter(|(_, tensor)| tensor.requires_grad())
        .collect::<Vec<(String, Tensor)>>();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    let (no_decay, decay): (Vec<_>, Vec<_>) = variables
        .into_iter()
        .partition(|(name, _)| NO_DECAY.iter().any(|pattern| name.contains(pattern)));
    vec![
        ParamGroup {
            weight_decay,
            params: decay,
        },
        ParamGroup {
            weight_decay: 0.0,
            params: no_decay,
        },
    ]
}

struct ParamState {
    step: i64,
    exp_avg: Tensor,
    /// Second moment (Adam) or exponentially weighted infinity norm (Adamax)
    exp_second: Tensor,
}

/// # Optimizer over parameter groups
/// SGD with L2 regularization, AdamW and AdamaxW with decoupled weight decay.
pub struct Optimizer {
    kind: OptimizerType,
    groups: Vec<ParamGroup>,
    state: HashMap<String, ParamState>,
    betas: (f64, f64),
    eps: f64,
}

impl Optimizer {
    pub fn new(kind: OptimizerType, groups: Vec<ParamGroup>) -> Optimizer {
        Optimizer {
            kind,
            groups,
            state: HashMap::new(),
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.groups
            .iter()
            .flat_map(|group| group.params.iter().map(|(_, param)| param))
    }

    pub fn zero_grad(&mut self) {
        for group in self.groups.iter_mut() {
            for (_, param) in group.params.iter_mut() {
                param.zero_grad();
            }
        }
    }

    /// Applies one update with learning rate `lr` to every parameter holding a gradient.
    pub fn step(&mut self, lr: f64) {
        let (beta1, beta2) = self.betas;
        let eps = self.eps;
        let kind = self.kind;
        no_grad(|| {
            for group in self.groups.iter() {
                let weight_decay = group.weight_decay;
                for (name, param) in group.params.iter() {
                    let grad = param.grad();
                    if !grad.defined() {
                        continue;
                    }
                    let mut param = param.shallow_clone();
                    match kind {
                        OptimizerType::Sgd => {
                            let direction = if weight_decay != 0.0 {
                                &grad + &param * weight_decay
                            } else {
                                grad
                            };
                            let updated = &param - direction * lr;
                            param.copy_(&updated);
                        }
                        OptimizerType::Adam | OptimizerType::Adamax => {
                            let state = self.state.entry(name.clone()).or_insert_with(|| {
                                ParamState {
                                    step: 0,
                                    exp_avg: param.zeros_like(),
                                    exp_second: param.zeros_like(),
                                }
                            });
                            state.step += 1;
                            let bias_correction1 = 1.0 - beta1.powi(state.step as i32);
                            let decayed = &param * (1.0 - lr * weight_decay);
                            state.exp_avg = &state.exp_avg * beta1 + &grad * (1.0 - beta1);
                            let updated = if kind == OptimizerType::Adam {
                                state.exp_second =
                                    &state.exp_second * beta2 + (&grad * &grad) * (1.0 - beta2);
                                let bias_correction2 = 1.0 - beta2.powi(state.step as i32);
                                let denominator =
                                    state.exp_second.sqrt() / bias_correction2.sqrt() + eps;
                                decayed
                                    - (&state.exp_avg / denominator) * (lr / bias_correction1)
                            } else {
                                state.exp_second =
                                    (&state.exp_second * beta2).maximum(&(grad.abs() + eps));
                                decayed
                                    - (&state.exp_avg / &state.exp_second)
                                        * (lr / bias_correction1)
                            };
                            param.copy_(&updated);
                        }
                    }
                }
            }
        });
    }

    /// Optimizer state as named tensors: `{param}.exp_avg`, `{param}.exp_second`, `{param}.step`.
    pub fn state_dict(&self) -> Vec<(String, Tensor)> {
        let mut names = self.state.keys().collect::<Vec<&String>>();
        names.sort();
        let mut tensors = Vec::with_capacity(names.len() * 3);
        for name in names {
            let state = &self.state[name];
            tensors.push((format!("{name}.exp_avg"), state.exp_avg.shallow_clone()));
            tensors.push((format!("{name}.exp_second"), state.exp_second.shallow_clone()));
            tensors.push((
                format!("{name}.step"),
                Tensor::from(state.step).to_kind(Kind::Int64),
            ));
        }
        tensors
    }

    /// Restores the state of the known parameters and returns how many were restored. Entries for
    /// unknown parameters are ignored.
    pub fn load_state_dict(
        &mut self,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<usize, MtDnnError> {
        let mut restored = 0;
        for group in self.groups.iter() {
            for (name, param) in group.params.iter() {
                let entries = (
                    tensors.get(&format!("{name}.exp_avg")),
                    tensors.get(&format!("{name}.exp_second")),
                    tensors.get(&format!("{name}.step")),
                );
                if let (Some(exp_avg), Some(exp_second), Some(step)) = entries {
                    if exp_avg.size() != param.size() {
                        return Err(MtDnnError::ValueError(format!(
                            "optimizer state for {name} has shape {:?}, expected {:?}",
                            exp_avg.size(),
                            param.size()
                        )));
                    }
                    self.state.insert(
                        name.clone(),
                        ParamState {
                            step: step.int64_value(&[]),
                            exp_avg: exp_avg.to_device(param.device()),
                            exp_second: exp_second.to_device(param.device()),
                        },
                    );
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}
