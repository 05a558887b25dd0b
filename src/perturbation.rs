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

//! # SMART adversarial regularization
//! Perturbs the word embeddings with noise pushed in the direction that maximizes the divergence
//! between clean and perturbed predictions, then penalizes that divergence with the task's
//! adversarial criterion.

use crate::common::error::MtDnnError;
use crate::config::PerturbationNorm;
use crate::loss::{stable_kl, Criterion};
use crate::network::{EmbeddingForward, NetworkInput, TaskOutput};
use crate::task_def::TaskType;
use tch::{Kind, Reduction, Tensor};
use tracing::{debug, warn};

/// # Result of an adversarial pass
pub struct AdversarialOutput {
    /// Adversarial loss, attached to the graph
    pub loss: Tensor,
    /// Mean absolute value of the clean embeddings
    pub embedding_magnitude: f64,
    /// Mean absolute value of the effective perturbation
    pub effective_perturbation: f64,
}

/// # Embedding-space adversarial perturbation
pub struct SmartPerturbation {
    epsilon: f64,
    step_size: f64,
    noise_var: f64,
    norm_p: PerturbationNorm,
    k: usize,
    fp16: bool,
    sentence_level: bool,
    loss_map: Vec<Option<Criterion>>,
}

impl SmartPerturbation {
    /// Build a new `SmartPerturbation`
    ///
    /// # Arguments
    ///
    /// * `epsilon` - stabilizer added to the normalization denominators
    /// * `step_size` - step of the noise ascent
    /// * `noise_var` - scale of the initial gaussian noise
    /// * `norm_p` - norm used to project the noise
    /// * `k` - number of ascent steps
    /// * `fp16` - run the inner loop in half-precision autocast
    /// * `norm_level` - 0 normalizes per token, otherwise per sentence
    /// * `loss_map` - adversarial criterion of each task
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        epsilon: f64,
        step_size: f64,
        noise_var: f64,
        norm_p: PerturbationNorm,
        k: usize,
        fp16: bool,
        norm_level: u8,
        loss_map: Vec<Option<Criterion>>,
    ) -> SmartPerturbation {
        SmartPerturbation {
            epsilon,
            step_size,
            noise_var,
            norm_p,
            k,
            fp16,
            sentence_level: norm_level != 0,
            loss_map,
        }
    }

    /// Computes the adversarial loss of a batch.
    ///
    /// Returns `None` when the task cannot be perturbed (span outputs, no adversarial criterion) or
    /// when the noise gradient is not finite.
    pub fn forward<M>(
        &self,
        model: &M,
        logits: &TaskOutput,
        input: &NetworkInput,
        task_id: usize,
        task_type: TaskType,
        pairwise_size: i64,
    ) -> Result<Option<AdversarialOutput>, MtDnnError>
    where
        M: EmbeddingForward + ?Sized,
    {
        let criterion = match self.loss_map.get(task_id) {
            Some(Some(criterion)) => criterion,
            _ => return Ok(None),
        };
        let logits = match logits {
            TaskOutput::Single(logits) => logits,
            TaskOutput::Span { .. } => {
                debug!("span outputs are not perturbed");
                return Ok(None);
            }
        };
        let pairwise_size = pairwise_size.max(1);
        let clean_logits = if task_type == TaskType::Ranking {
            logits.view([-1, pairwise_size])
        } else {
            logits.shallow_clone()
        };

        let embed = model.embed(input)?;
        let mut noise = (embed.randn_like() * self.noise_var)
            .detach()
            .set_requires_grad(true);
        let mut effective_noise = noise.detach();

        for _ in 0..self.k {
            let perturbed = &embed + &noise;
            let adv_logits = tch::autocast(self.fp16, || {
                model.forward_embeddings_t(input, &perturbed, task_id, true)
            })?;
            let adv_logits = adv_logits.single()?;
            let adv_loss = match task_type {
                TaskType::Regression => adv_logits
                    .to_kind(Kind::Float)
                    .mse_loss(&logits.detach().to_kind(Kind::Float), Reduction::Sum),
                TaskType::Ranking => stable_kl(
                    &adv_logits.view([-1, pairwise_size]),
                    &clean_logits.detach(),
                    1e-6,
                    false,
                ),
                _ => stable_kl(adv_logits, &logits.detach(), 1e-6, false),
            };
            let delta_grad = Tensor::f_run_backward(&[&adv_loss], &[&noise], false, false)?
                .pop()
                .ok_or_else(|| {
                    MtDnnError::ValueError("no gradient computed for the noise".to_string())
                })?;
            let norm = delta_grad.norm().double_value(&[]);
            if !norm.is_finite() {
                warn!("non finite gradient norm in adversarial step, skipping perturbation");
                return Ok(None);
            }
            let effective_grad = &delta_grad * self.step_size;
            let delta_grad = &noise + &delta_grad * self.step_size;
            let (direction, effective_direction) = self.norm_grad(&delta_grad, &effective_grad);
            noise = direction.detach().set_requires_grad(true);
            effective_noise = effective_direction.detach();
        }

        let perturbed = &embed + &noise;
        let adv_logits = tch::autocast(self.fp16, || {
            model.forward_embeddings_t(input, &perturbed, task_id, true)
        })?;
        let adv_logits = adv_logits.single()?;
        let adv_logits = if task_type == TaskType::Ranking {
            adv_logits.view([-1, pairwise_size])
        } else {
            adv_logits.shallow_clone()
        };
        let loss = criterion.forward(
            &TaskOutput::Single(clean_logits),
            &TaskOutput::Single(adv_logits),
            None,
            -1,
            pairwise_size,
        )?;

        Ok(Some(AdversarialOutput {
            loss,
            embedding_magnitude: embed.detach().abs().mean(Kind::Float).double_value(&[]),
            effective_perturbation: effective_noise.abs().mean(Kind::Float).double_value(&[]),
        }))
    }

    /// Projects the ascent direction on the unit ball of the configured norm, per token or per
    /// sentence. The effective perturbation is scaled by the same denominator.
    fn norm_grad(&self, grad: &Tensor, effective_grad: &Tensor) -> (Tensor, Tensor) {
        let dims: &[i64] = if self.sentence_level { &[-2, -1] } else { &[-1] };
        match self.norm_p {
            PerturbationNorm::L2 => {
                let denominator = grad.norm_scalaropt_dim(2.0, dims, true) + self.epsilon;
                (grad / &denominator, effective_grad / &denominator)
            }
            PerturbationNorm::L1 => (grad.sign(), effective_grad.sign()),
            PerturbationNorm::Inf => {
                let denominator = grad.abs().amax(dims, true) + self.epsilon;
                (grad / &denominator, effective_grad / &denominator)
            }
        }
    }
}
