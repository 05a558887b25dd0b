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

//! # Task definitions
//! Each task trained by the multi-task model is described by a `TaskDef`: its output type, number of
//! classes and the loss criteria used for the supervised, knowledge-distillation and adversarial
//! objectives.

use crate::common::error::MtDnnError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
/// # Output type of a task, drives the head layout, the loss reshaping and the prediction decoding
pub enum TaskType {
    Classification,
    Regression,
    Ranking,
    Span,
    SpanYN,
    SequenceLabeling,
    SequenceGeneration,
}

impl TaskType {
    /// Tasks producing a single logits vector per example from the pooled representation.
    pub fn is_sentence_level(&self) -> bool {
        matches!(
            self,
            TaskType::Classification | TaskType::Regression | TaskType::Ranking
        )
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
/// # Identifies the pretrained backbone
pub enum EncoderModelType {
    Bert,
    Roberta,
    Xlm,
    Albert,
    Electra,
    Deberta,
    /// T5 encoder only
    T5,
    /// T5 encoder-decoder, required by sequence generation tasks
    T5g,
}

impl EncoderModelType {
    pub fn is_generative(&self) -> bool {
        matches!(self, EncoderModelType::T5g)
    }

    /// Whether the backbone can run from externally supplied word embeddings, which adversarial
    /// training needs.
    pub fn accepts_input_embeddings(&self) -> bool {
        !matches!(self, EncoderModelType::T5 | EncoderModelType::T5g)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
/// # Loss registry keys
pub enum LossKind {
    CeCriterion,
    SeqCeCriterion,
    MseCriterion,
    KlCriterion,
    SymKlCriterion,
    JsCriterion,
    HlCriterion,
    RankCeCriterion,
    SpanCeCriterion,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn default_n_class() -> i64 {
    2
}

fn default_loss() -> LossKind {
    LossKind::CeCriterion
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// # Definition of a single task
pub struct TaskDef {
    /// Task name, used for logging and output files
    pub name: String,
    pub task_type: TaskType,
    /// Number of output labels (1 for regression and ranking)
    #[serde(default = "default_n_class")]
    pub n_class: i64,
    #[serde(default = "default_loss")]
    pub loss: LossKind,
    /// Criterion comparing the logits to the soft labels of a teacher model
    #[serde(default)]
    pub kd_loss: Option<LossKind>,
    /// Criterion comparing clean and adversarial logits
    #[serde(default)]
    pub adv_loss: Option<LossKind>,
    /// Task-specific dropout on the head input, falls back to the global setting
    #[serde(default)]
    pub dropout_p: Option<f64>,
}

impl TaskDef {
    pub fn new(name: &str, task_type: TaskType, n_class: i64, loss: LossKind) -> TaskDef {
        TaskDef {
            name: name.to_string(),
            task_type,
            n_class,
            loss,
            kd_loss: None,
            adv_loss: None,
            dropout_p: None,
        }
    }

    pub fn with_kd_loss(mut self, kd_loss: LossKind) -> TaskDef {
        self.kd_loss = Some(kd_loss);
        self
    }

    pub fn with_adv_loss(mut self, adv_loss: LossKind) -> TaskDef {
        self.adv_loss = Some(adv_loss);
        self
    }

    /// Checks the head shape is coherent with the task type.
    pub fn validate(&self) -> Result<(), MtDnnError> {
        let valid = match self.task_type {
            TaskType::Regression | TaskType::Ranking => self.n_class == 1,
            TaskType::Span | TaskType::SpanYN => self.n_class == 2,
            TaskType::SequenceGeneration => true,
            TaskType::Classification | TaskType::SequenceLabeling => self.n_class > 1,
        };
        if valid {
            Ok(())
        } else {
            Err(MtDnnError::InvalidConfigurationError(format!(
                "task {} of type {:?} cannot have {} classes",
                self.name, self.task_type, self.n_class
            )))
        }
    }
}
