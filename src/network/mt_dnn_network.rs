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
use crate::network::backbone::{Backbone, BackboneConfig, EncoderOutput};
use crate::network::heads::{Pooler, TaskHead};
use crate::network::{EmbeddingForward, NetworkInput, TaskOutput};
use crate::task_def::{EncoderModelType, TaskDef, TaskType};
use std::borrow::Borrow;
use tch::{nn, Tensor};

/// # MT-DNN network
/// Shared backbone and pooler with one head per task. Heads are stored under `scoring_list.{task_id}`.
pub struct MtDnnNetwork {
    backbone: Backbone,
    pooler: Pooler,
    heads: Vec<TaskHead>,
    task_types: Vec<TaskType>,
}

impl MtDnnNetwork {
    /// Build a new `MtDnnNetwork`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the network
    /// * `encoder_type` - backbone registry key
    /// * `backbone_config` - configuration of the backbone, must match `encoder_type`
    /// * `task_defs` - one definition per task, in task id order
    /// * `dropout_p` - head dropout for tasks that do not set their own
    pub fn new<'p, P>(
        p: P,
        encoder_type: EncoderModelType,
        backbone_config: &BackboneConfig,
        task_defs: &[TaskDef],
        dropout_p: f64,
    ) -> Result<MtDnnNetwork, MtDnnError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let backbone = Backbone::new(p, encoder_type, backbone_config)?;
        let hidden_size = backbone.hidden_size();
        let pooler = Pooler::new(p / "pooler", hidden_size);

        let scoring_list = p / "scoring_list";
        let mut heads = Vec::with_capacity(task_defs.len());
        for (task_id, task_def) in task_defs.iter().enumerate() {
            if task_def.task_type == TaskType::SequenceGeneration && !encoder_type.is_generative() {
                return Err(MtDnnError::InvalidConfigurationError(format!(
                    "task {} requires a sequence-to-sequence backbone, got {encoder_type:?}",
                    task_def.name
                )));
            }
            heads.push(TaskHead::new(
                &scoring_list / task_id,
                task_def,
                hidden_size,
                dropout_p,
            ));
        }
        let task_types = task_defs.iter().map(|task_def| task_def.task_type).collect();

        Ok(MtDnnNetwork {
            backbone,
            pooler,
            heads,
            task_types,
        })
    }

    pub fn task_type(&self, task_id: usize) -> Result<TaskType, MtDnnError> {
        self.task_types.get(task_id).copied().ok_or_else(|| {
            MtDnnError::ValueError(format!(
                "task id {task_id} out of range ({} tasks)",
                self.task_types.len()
            ))
        })
    }

    /// Encoder hidden states for the input tokens.
    pub fn encode(&self, input: &NetworkInput, train: bool) -> Result<EncoderOutput, MtDnnError> {
        self.backbone.forward_t(
            Some(input.input_ids),
            input.attention_mask,
            input.token_type_ids,
            None,
            train,
        )
    }

    pub fn pool(&self, sequence_output: &Tensor) -> Tensor {
        self.pooler.forward(sequence_output)
    }

    /// Computes the logits of task `task_id`.
    ///
    /// # Returns
    ///
    /// * `TaskOutput` with
    ///   - classification, regression, ranking: (*batch size*, *n_class*)
    ///   - sequence labeling: (*batch size* x *sequence_length*, *n_class*)
    ///   - span: start and end logits of shape (*batch size*, *sequence_length*)
    ///   - sequence generation: (*batch size* x *target_length*, *vocab_size*)
    pub fn forward_t(
        &self,
        input: &NetworkInput,
        task_id: usize,
        train: bool,
    ) -> Result<TaskOutput, MtDnnError> {
        if self.task_type(task_id)? == TaskType::SequenceGeneration {
            let decoder_input_ids = input.y_input_ids.ok_or_else(|| {
                MtDnnError::ValueError(
                    "sequence generation training requires decoder input ids".to_string(),
                )
            })?;
            let logits = self.backbone.lm_logits_t(
                input.input_ids,
                input.attention_mask,
                decoder_input_ids,
                train,
            )?;
            let vocab_size = logits.size()[2];
            return Ok(TaskOutput::Single(logits.view([-1, vocab_size])));
        }
        let encoder_output = self.encode(input, train)?;
        self.score_t(&encoder_output.sequence_output, task_id, train)
    }

    /// Greedy generation for sequence generation tasks.
    pub fn generate(&self, input: &NetworkInput, max_length: i64) -> Result<Tensor, MtDnnError> {
        self.backbone
            .generate(input.input_ids, input.attention_mask, max_length)
    }

    fn score_t(
        &self,
        sequence_output: &Tensor,
        task_id: usize,
        train: bool,
    ) -> Result<TaskOutput, MtDnnError> {
        let task_type = self.task_type(task_id)?;
        let pooled_output = if task_type.is_sentence_level() {
            Some(self.pooler.forward(sequence_output))
        } else {
            None
        };
        self.heads[task_id]
            .forward_t(sequence_output, pooled_output.as_ref(), train)
            .ok_or_else(|| {
                MtDnnError::ValueError(format!(
                    "task {task_id} of type {task_type:?} has no scoring head"
                ))
            })
    }
}

impl EmbeddingForward for MtDnnNetwork {
    fn embed(&self, input: &NetworkInput) -> Result<Tensor, MtDnnError> {
        self.backbone.embed(input.input_ids)
    }

    fn forward_embeddings_t(
        &self,
        input: &NetworkInput,
        embeds: &Tensor,
        task_id: usize,
        train: bool,
    ) -> Result<TaskOutput, MtDnnError> {
        let encoder_output = self.backbone.forward_t(
            None,
            input.attention_mask,
            input.token_type_ids,
            Some(embeds),
            train,
        )?;
        self.score_t(&encoder_output.sequence_output, task_id, train)
    }
}
