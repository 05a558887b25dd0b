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

//! # Batches
//! A batch is made of tensors fed to the network (`BatchData`) and of metadata describing the task
//! and the gold annotations used for loss computation and evaluation (`BatchMeta`).

use crate::network::{NetworkInput, TaskOutput};
use crate::task_def::TaskDef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::{Device, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Gold annotations returned alongside predictions
pub enum GoldLabels {
    Classes(Vec<i64>),
    Scores(Vec<f32>),
    Sequences(Vec<Vec<i64>>),
    Texts(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// # Metadata of span extraction batches
pub struct SpanMeta {
    /// Character offsets `(start, end)` of every token in its context, `None` outside the context
    pub offset_mapping: Vec<Vec<Option<(i64, i64)>>>,
    /// Whether each token position has its maximal context in this feature
    pub token_is_max_context: Option<Vec<HashMap<usize, bool>>>,
    pub context: Vec<String>,
    /// Token index representing the absence of answer
    pub null_ans_index: Option<i64>,
}

/// # Task and annotation metadata of a batch
#[derive(Debug)]
pub struct BatchMeta {
    pub task_id: usize,
    pub task_def: TaskDef,
    /// Number of candidates per group for ranking tasks
    pub pairwise_size: i64,
    pub uids: Vec<String>,
    /// Gold labels returned with predictions
    pub label: Option<GoldLabels>,
    /// Gold labels of ranking groups
    pub true_label: Option<GoldLabels>,
    /// Teacher logits for knowledge distillation
    pub soft_label: Option<Tensor>,
    /// Gold answers of span and generation tasks
    pub answers: Vec<String>,
    pub span: Option<SpanMeta>,
}

impl BatchMeta {
    pub fn new(task_id: usize, task_def: TaskDef) -> BatchMeta {
        BatchMeta {
            task_id,
            task_def,
            pairwise_size: 1,
            uids: Vec::new(),
            label: None,
            true_label: None,
            soft_label: None,
            answers: Vec::new(),
            span: None,
        }
    }
}

/// # Tensors of a batch
#[derive(Debug)]
pub struct BatchData {
    /// Token ids of shape (*batch size*, *sequence_length*)
    pub input_ids: Tensor,
    pub token_type_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    /// Training targets: class ids, regression scores, token labels or span boundaries
    pub labels: Option<TaskOutput>,
    /// Decoder input ids for sequence generation
    pub y_input_ids: Option<Tensor>,
    /// Per-sample loss weights
    pub weights: Option<Tensor>,
}

impl BatchData {
    pub fn new(input_ids: Tensor) -> BatchData {
        BatchData {
            input_ids,
            token_type_ids: None,
            attention_mask: None,
            labels: None,
            y_input_ids: None,
            weights: None,
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.input_ids.size()[0]
    }

    pub fn network_input(&self) -> NetworkInput {
        NetworkInput {
            input_ids: &self.input_ids,
            token_type_ids: self.token_type_ids.as_ref(),
            attention_mask: self.attention_mask.as_ref(),
            y_input_ids: self.y_input_ids.as_ref(),
        }
    }

    /// Copies all tensors to `device`. The copies do not track gradients.
    pub fn to_device(&self, device: Device) -> BatchData {
        let move_tensor = |tensor: &Tensor| tensor.to_device(device).detach();
        BatchData {
            input_ids: move_tensor(&self.input_ids),
            token_type_ids: self.token_type_ids.as_ref().map(move_tensor),
            attention_mask: self.attention_mask.as_ref().map(move_tensor),
            labels: self.labels.as_ref().map(|labels| match labels {
                TaskOutput::Single(labels) => TaskOutput::Single(move_tensor(labels)),
                TaskOutput::Span { start, end } => TaskOutput::Span {
                    start: move_tensor(start),
                    end: move_tensor(end),
                },
            }),
            y_input_ids: self.y_input_ids.as_ref().map(move_tensor),
            weights: self.weights.as_ref().map(move_tensor),
        }
    }
}
