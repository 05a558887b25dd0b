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

//! # Multi-task network
//! A pretrained backbone shared across tasks, a shared pooler and one scoring head per task.
//! The network can be run from token ids or from (possibly perturbed) word embeddings, which is
//! what adversarial training relies on.

mod backbone;
mod heads;
mod mt_dnn_network;

pub use backbone::{Backbone, BackboneConfig, EncoderOutput};
pub use heads::{Pooler, TaskHead};
pub use mt_dnn_network::MtDnnNetwork;

use crate::common::error::MtDnnError;
use tch::Tensor;

/// # Inputs of a forward pass
/// Token ids of shape (*batch size*, *sequence_length*) with optional segment ids and attention mask
/// of the same shape. `y_input_ids` holds decoder inputs for sequence generation tasks.
#[derive(Debug, Clone, Copy)]
pub struct NetworkInput<'a> {
    pub input_ids: &'a Tensor,
    pub token_type_ids: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub y_input_ids: Option<&'a Tensor>,
}

impl<'a> NetworkInput<'a> {
    pub fn new(input_ids: &'a Tensor) -> NetworkInput<'a> {
        NetworkInput {
            input_ids,
            token_type_ids: None,
            attention_mask: None,
            y_input_ids: None,
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.input_ids.size()[0]
    }
}

/// # Output of a task head
#[derive(Debug)]
pub enum TaskOutput {
    /// Logits (or labels) of shape (*batch size*, *num_labels*), or flattened token-level values
    Single(Tensor),
    /// Start and end logits (or positions) for span extraction
    Span { start: Tensor, end: Tensor },
}

impl TaskOutput {
    pub fn single(&self) -> Result<&Tensor, MtDnnError> {
        match self {
            TaskOutput::Single(logits) => Ok(logits),
            TaskOutput::Span { .. } => Err(MtDnnError::ValueError(
                "expected a single logits tensor, got span logits".to_string(),
            )),
        }
    }
}

/// # Forward pass over externally supplied embeddings
/// Implemented by networks that can be perturbed in embedding space.
pub trait EmbeddingForward {
    /// Returns the word embeddings of the input tokens, shape (*batch size*, *sequence_length*, *dim*).
    fn embed(&self, input: &NetworkInput) -> Result<Tensor, MtDnnError>;

    /// Computes the logits of task `task_id` with `embeds` replacing the word embedding lookup.
    fn forward_embeddings_t(
        &self,
        input: &NetworkInput,
        embeds: &Tensor,
        task_id: usize,
        train: bool,
    ) -> Result<TaskOutput, MtDnnError>;
}
