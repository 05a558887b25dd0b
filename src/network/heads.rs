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

use crate::network::TaskOutput;
use crate::task_def::{TaskDef, TaskType};
use std::borrow::Borrow;
use tch::nn::{self, Init, LinearConfig};
use tch::Tensor;

fn linear_config(initializer_range: f64) -> LinearConfig {
    LinearConfig {
        ws_init: Init::Randn {
            mean: 0.,
            stdev: initializer_range,
        },
        bs_init: Some(Init::Const(0.)),
        bias: true,
    }
}

/// # Shared pooler
/// Dense layer and tanh activation applied to the hidden state of the first token.
#[derive(Debug)]
pub struct Pooler {
    dense: nn::Linear,
}

impl Pooler {
    pub fn new<'p, P>(p: P, hidden_size: i64) -> Pooler
    where
        P: Borrow<nn::Path<'p>>,
    {
        let dense = nn::linear(
            p.borrow() / "dense",
            hidden_size,
            hidden_size,
            linear_config(0.02),
        );
        Pooler { dense }
    }

    pub fn forward(&self, sequence_output: &Tensor) -> Tensor {
        sequence_output.select(1, 0).apply(&self.dense).tanh()
    }
}

/// # Task-specific scoring layer
#[derive(Debug)]
pub enum TaskHead {
    /// Classification, regression and ranking scores from the pooled representation
    Sentence {
        dropout_p: f64,
        classifier: nn::Linear,
    },
    /// Start and end scores for every token
    Span { qa_outputs: nn::Linear },
    /// Label scores for every token
    Token {
        dropout_p: f64,
        classifier: nn::Linear,
    },
    /// Logits come from the backbone language modeling head
    Generation,
}

impl TaskHead {
    pub fn new<'p, P>(p: P, task_def: &TaskDef, hidden_size: i64, default_dropout: f64) -> TaskHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let dropout_p = task_def.dropout_p.unwrap_or(default_dropout);
        match task_def.task_type {
            TaskType::Classification | TaskType::Regression | TaskType::Ranking => {
                TaskHead::Sentence {
                    dropout_p,
                    classifier: nn::linear(p, hidden_size, task_def.n_class, linear_config(0.02)),
                }
            }
            TaskType::Span | TaskType::SpanYN => TaskHead::Span {
                qa_outputs: nn::linear(p, hidden_size, 2, linear_config(0.02)),
            },
            TaskType::SequenceLabeling => TaskHead::Token {
                dropout_p,
                classifier: nn::linear(p, hidden_size, task_def.n_class, linear_config(0.02)),
            },
            TaskType::SequenceGeneration => TaskHead::Generation,
        }
    }

    /// Scores the encoder output. `pooled_output` is only used by sentence-level heads.
    pub fn forward_t(
        &self,
        sequence_output: &Tensor,
        pooled_output: Option<&Tensor>,
        train: bool,
    ) -> Option<TaskOutput> {
        match self {
            TaskHead::Sentence {
                dropout_p,
                classifier,
            } => pooled_output.map(|pooled| {
                TaskOutput::Single(pooled.dropout(*dropout_p, train).apply(classifier))
            }),
            TaskHead::Span { qa_outputs } => {
                let logits = sequence_output.apply(qa_outputs).split(1, -1);
                Some(TaskOutput::Span {
                    start: logits[0].squeeze_dim(-1),
                    end: logits[1].squeeze_dim(-1),
                })
            }
            TaskHead::Token {
                dropout_p,
                classifier,
            } => {
                let logits = sequence_output
                    .dropout(*dropout_p, train)
                    .apply(classifier);
                let num_labels = logits.size()[2];
                Some(TaskOutput::Single(logits.view([-1, num_labels])))
            }
            TaskHead::Generation => None,
        }
    }
}
