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

//! # Loss criteria
//! Loss functions registered by name (`LossKind`). Supervised criteria compare logits with hard labels,
//! distribution criteria (KL, symmetric KL, Jensen-Shannon, Hellinger) compare two sets of logits and
//! are used for knowledge distillation and adversarial regularization.

use crate::common::error::MtDnnError;
use crate::network::TaskOutput;
use crate::task_def::LossKind;
use tch::{Kind, Reduction, Tensor};

/// # Loss function instance attached to a task
#[derive(Debug, Clone)]
pub struct Criterion {
    kind: LossKind,
    name: String,
}

impl Criterion {
    pub fn new(kind: LossKind, name: impl Into<String>) -> Criterion {
        Criterion {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computes the loss of `input` logits against `target`.
    ///
    /// # Arguments
    ///
    /// * `input` - logits produced by the network
    /// * `target` - hard labels, soft logits (distribution criteria) or span boundaries
    /// * `weight` - optional per-sample weights of shape (*batch size*)
    /// * `ignore_index` - label value excluded from classification losses
    /// * `pairwise_size` - number of candidates per group for ranking criteria
    pub fn forward(
        &self,
        input: &TaskOutput,
        target: &TaskOutput,
        weight: Option<&Tensor>,
        ignore_index: i64,
        pairwise_size: i64,
    ) -> Result<Tensor, MtDnnError> {
        let loss = match (self.kind, input, target) {
            (LossKind::SpanCeCriterion, TaskOutput::Span { start, end }, TaskOutput::Span {
                start: start_target,
                end: end_target,
            }) => {
                (cross_entropy(start, start_target, None, ignore_index)
                    + cross_entropy(end, end_target, None, ignore_index))
                    * 0.5
            }
            (LossKind::SpanCeCriterion, _, _) => {
                return Err(MtDnnError::ValueError(format!(
                    "{} expects start and end logits with span targets",
                    self.name
                )));
            }
            (kind, TaskOutput::Single(input), TaskOutput::Single(target)) => match kind {
                LossKind::CeCriterion => cross_entropy(input, target, weight, ignore_index),
                LossKind::SeqCeCriterion => {
                    let num_labels = input.size().last().copied().unwrap_or(1);
                    cross_entropy(
                        &input.view([-1, num_labels]),
                        &target.view([-1]),
                        weight,
                        ignore_index,
                    )
                }
                LossKind::MseCriterion => mse(input, target, weight),
                LossKind::RankCeCriterion => {
                    if pairwise_size < 1 {
                        return Err(MtDnnError::ValueError(format!(
                            "invalid pairwise size {pairwise_size} for {}",
                            self.name
                        )));
                    }
                    let input = input.contiguous().view([-1, pairwise_size]);
                    let target = target.contiguous().view([-1, pairwise_size]).select(1, 0);
                    cross_entropy(&input, &target, None, ignore_index)
                }
                LossKind::KlCriterion => kl_batchmean(
                    &input.log_softmax(-1, Kind::Float),
                    &target.softmax(-1, Kind::Float),
                ),
                LossKind::SymKlCriterion => symmetric_kl(input, target),
                LossKind::JsCriterion => jensen_shannon(input, target),
                LossKind::HlCriterion => {
                    let source = input.softmax(-1, Kind::Float).sqrt();
                    let reference = target.detach().softmax(-1, Kind::Float).sqrt();
                    source.mse_loss(&reference, Reduction::Mean)
                }
                LossKind::SpanCeCriterion => {
                    return Err(MtDnnError::ValueError(format!(
                        "{} expects start and end logits",
                        self.name
                    )));
                }
            },
            (_, _, _) => {
                return Err(MtDnnError::ValueError(format!(
                    "{} expects single logits and targets",
                    self.name
                )));
            }
        };
        Ok(loss)
    }
}

fn cross_entropy(
    logits: &Tensor,
    target: &Tensor,
    weight: Option<&Tensor>,
    ignore_index: i64,
) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    let target = target.to_kind(Kind::Int64);
    match weight {
        Some(weight) => {
            let losses =
                log_probs.g_nll_loss(&target, None::<Tensor>, Reduction::None, ignore_index);
            (losses * weight.to_kind(Kind::Float)).mean(Kind::Float)
        }
        None => log_probs.g_nll_loss(&target, None::<Tensor>, Reduction::Mean, ignore_index),
    }
}

/// Drops a trailing dimension of size 1, (*batch size*, 1) scores become (*batch size*).
fn squeeze_scores(scores: &Tensor) -> Tensor {
    let size = scores.size();
    match size.last() {
        Some(1) if size.len() > 1 => scores.squeeze_dim(-1),
        _ => scores.shallow_clone(),
    }
    .to_kind(Kind::Float)
}

fn mse(input: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Tensor {
    let input = squeeze_scores(input);
    let target = squeeze_scores(target);
    match weight {
        Some(weight) => (input.mse_loss(&target, Reduction::None) * weight.to_kind(Kind::Float))
            .mean(Kind::Float),
        None => input.mse_loss(&target, Reduction::Mean),
    }
}

/// KL divergence summed over the distribution and averaged over the batch.
fn kl_batchmean(log_input: &Tensor, target: &Tensor) -> Tensor {
    let batch_size = log_input.size().first().copied().unwrap_or(1).max(1);
    log_input.kl_div(target, Reduction::Sum, false) / batch_size as f64
}

fn symmetric_kl(input: &Tensor, target: &Tensor) -> Tensor {
    kl_batchmean(
        &input.log_softmax(-1, Kind::Float),
        &target.detach().softmax(-1, Kind::Float),
    ) + kl_batchmean(
        &target.log_softmax(-1, Kind::Float),
        &input.detach().softmax(-1, Kind::Float),
    )
}

fn jensen_shannon(input: &Tensor, target: &Tensor) -> Tensor {
    let mixture = (target.detach().softmax(-1, Kind::Float)
        + input.detach().softmax(-1, Kind::Float))
        * 0.5;
    kl_batchmean(&input.log_softmax(-1, Kind::Float), &mixture)
        + kl_batchmean(&target.log_softmax(-1, Kind::Float), &mixture)
}

/// Symmetric KL between two logit sets computed in a numerically stable way, used by the adversarial
/// inner loop. Returns the sum over the batch when `reduce` is false.
pub fn stable_kl(logit: &Tensor, target: &Tensor, epsilon: f64, reduce: bool) -> Tensor {
    let num_labels = logit.size().last().copied().unwrap_or(1);
    let logit = logit.view([-1, num_labels]).to_kind(Kind::Float);
    let target = target.view([-1, num_labels]).to_kind(Kind::Float);
    let batch_size = logit.size()[0].max(1);
    let p = logit.log_softmax(1, Kind::Float).exp();
    let y = target.log_softmax(1, Kind::Float).exp();
    let rp = -((&p + epsilon).reciprocal() - 1.0 + epsilon).detach().log();
    let ry = -((&y + epsilon).reciprocal() - 1.0 + epsilon).detach().log();
    let divergence = (p * (rp - ry) * 2.0).sum(Kind::Float);
    if reduce {
        divergence / batch_size as f64
    } else {
        divergence
    }
}
