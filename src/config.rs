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

//! # Training configuration
//! `MtDnnConfig` gathers the options of the multi-task model wrapper. It is usually read from a JSON
//! file with `Config::from_file`; every field except the backbone and the task list has a default.

use crate::common::error::MtDnnError;
use crate::task_def::{EncoderModelType, TaskDef};
use crate::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// # Optimizer family
pub enum OptimizerType {
    Sgd,
    Adamax,
    Adam,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// # Norm used to project the adversarial noise
pub enum PerturbationNorm {
    L2,
    L1,
    Inf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// # MT-DNN model wrapper configuration
pub struct MtDnnConfig {
    pub encoder_type: EncoderModelType,
    /// Path to the backbone (rust-bert) JSON configuration
    pub backbone_config: PathBuf,
    /// Optional pretrained backbone weights, loaded non-strictly
    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,
    /// Tokenizer files, only required to decode generated sequences
    #[serde(default)]
    pub vocab_path: Option<PathBuf>,
    #[serde(default)]
    pub merges_path: Option<PathBuf>,
    #[serde(default)]
    pub lower_case: bool,
    pub task_def_list: Vec<TaskDef>,

    /// Rank of the process in distributed training, -1 when not distributed
    #[serde(default = "defaults::local_rank")]
    pub local_rank: i64,
    #[serde(default = "defaults::world_size")]
    pub world_size: usize,
    #[serde(default)]
    pub multi_gpu_on: bool,

    #[serde(default = "defaults::optimizer")]
    pub optimizer: OptimizerType,
    #[serde(default = "defaults::learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "defaults::weight_decay")]
    pub weight_decay: f64,
    /// Fraction of the total number of steps used for learning rate warmup
    #[serde(default = "defaults::warmup")]
    pub warmup: f64,
    /// 0: linear, 1: cosine, 2: constant, 3: polynomial decay
    #[serde(default)]
    pub scheduler_type: u8,

    #[serde(default)]
    pub fp16: bool,
    #[serde(default = "defaults::fp16_init_scale")]
    pub fp16_init_scale: f64,
    #[serde(default = "defaults::fp16_scale_window")]
    pub fp16_scale_window: usize,

    #[serde(default = "defaults::grad_accumulation_step")]
    pub grad_accumulation_step: usize,
    #[serde(default = "defaults::global_grad_clipping")]
    pub global_grad_clipping: f64,
    /// Rescale the loss by the actual batch size when batches are built dynamically
    #[serde(default)]
    pub bin_on: bool,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    /// Use per-sample weights provided with the batch
    #[serde(default)]
    pub weighted_on: bool,

    /// Knowledge distillation is enabled when strictly positive
    #[serde(default)]
    pub mkd_opt: u8,

    #[serde(default)]
    pub adv_train: bool,
    #[serde(default = "defaults::adv_epsilon")]
    pub adv_epsilon: f64,
    #[serde(default = "defaults::adv_step_size")]
    pub adv_step_size: f64,
    #[serde(default = "defaults::adv_noise_var")]
    pub adv_noise_var: f64,
    #[serde(default = "defaults::adv_p_norm")]
    pub adv_p_norm: PerturbationNorm,
    #[serde(default = "defaults::adv_k")]
    pub adv_k: usize,
    /// 0: token level normalization, otherwise sentence level
    #[serde(default)]
    pub adv_norm_level: u8,
    #[serde(default = "defaults::adv_alpha")]
    pub adv_alpha: f64,

    #[serde(default = "defaults::dropout_p")]
    pub dropout_p: f64,
    /// Maximum length of generated sequences and extracted spans
    #[serde(default = "defaults::max_answer_len")]
    pub max_answer_len: i64,
}

impl Config for MtDnnConfig {}

mod defaults {
    use super::{OptimizerType, PerturbationNorm};

    pub fn local_rank() -> i64 {
        -1
    }
    pub fn world_size() -> usize {
        1
    }
    pub fn optimizer() -> OptimizerType {
        OptimizerType::Adamax
    }
    pub fn learning_rate() -> f64 {
        5e-5
    }
    pub fn weight_decay() -> f64 {
        0.01
    }
    pub fn warmup() -> f64 {
        0.1
    }
    pub fn fp16_init_scale() -> f64 {
        65536.0
    }
    pub fn fp16_scale_window() -> usize {
        2000
    }
    pub fn grad_accumulation_step() -> usize {
        1
    }
    pub fn global_grad_clipping() -> f64 {
        1.0
    }
    pub fn batch_size() -> usize {
        8
    }
    pub fn adv_epsilon() -> f64 {
        1e-6
    }
    pub fn adv_step_size() -> f64 {
        1e-5
    }
    pub fn adv_noise_var() -> f64 {
        1e-5
    }
    pub fn adv_p_norm() -> PerturbationNorm {
        PerturbationNorm::Inf
    }
    pub fn adv_k() -> usize {
        1
    }
    pub fn adv_alpha() -> f64 {
        1.0
    }
    pub fn dropout_p() -> f64 {
        0.1
    }
    pub fn max_answer_len() -> i64 {
        30
    }
}

impl MtDnnConfig {
    /// Creates a configuration with default training options for a backbone and a set of tasks.
    pub fn new(
        encoder_type: EncoderModelType,
        backbone_config: impl Into<PathBuf>,
        task_def_list: Vec<TaskDef>,
    ) -> MtDnnConfig {
        MtDnnConfig {
            encoder_type,
            backbone_config: backbone_config.into(),
            init_checkpoint: None,
            vocab_path: None,
            merges_path: None,
            lower_case: false,
            task_def_list,
            local_rank: defaults::local_rank(),
            world_size: defaults::world_size(),
            multi_gpu_on: false,
            optimizer: defaults::optimizer(),
            learning_rate: defaults::learning_rate(),
            weight_decay: defaults::weight_decay(),
            warmup: defaults::warmup(),
            scheduler_type: 0,
            fp16: false,
            fp16_init_scale: defaults::fp16_init_scale(),
            fp16_scale_window: defaults::fp16_scale_window(),
            grad_accumulation_step: defaults::grad_accumulation_step(),
            global_grad_clipping: defaults::global_grad_clipping(),
            bin_on: false,
            batch_size: defaults::batch_size(),
            weighted_on: false,
            mkd_opt: 0,
            adv_train: false,
            adv_epsilon: defaults::adv_epsilon(),
            adv_step_size: defaults::adv_step_size(),
            adv_noise_var: defaults::adv_noise_var(),
            adv_p_norm: defaults::adv_p_norm(),
            adv_k: defaults::adv_k(),
            adv_norm_level: 0,
            adv_alpha: defaults::adv_alpha(),
            dropout_p: defaults::dropout_p(),
            max_answer_len: defaults::max_answer_len(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    pub fn kd_enabled(&self) -> bool {
        self.mkd_opt > 0
    }

    /// Rejects option combinations the model wrapper cannot run with.
    pub fn validate(&self) -> Result<(), MtDnnError> {
        if self.task_def_list.is_empty() {
            return Err(MtDnnError::InvalidConfigurationError(
                "at least one task definition is required".to_string(),
            ));
        }
        if self.grad_accumulation_step == 0 {
            return Err(MtDnnError::InvalidConfigurationError(
                "grad_accumulation_step must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MtDnnError::InvalidConfigurationError(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.world_size == 0 {
            return Err(MtDnnError::InvalidConfigurationError(
                "world_size must be at least 1".to_string(),
            ));
        }
        if self.is_distributed() && self.local_rank as usize >= self.world_size {
            return Err(MtDnnError::InvalidConfigurationError(format!(
                "local_rank {} is out of range for world_size {}",
                self.local_rank, self.world_size
            )));
        }
        for task_def in self.task_def_list.iter() {
            task_def.validate()?;
            if self.kd_enabled() && task_def.kd_loss.is_none() {
                return Err(MtDnnError::InvalidConfigurationError(format!(
                    "knowledge distillation requires a kd_loss for task {}",
                    task_def.name
                )));
            }
            if self.adv_train && task_def.adv_loss.is_none() {
                return Err(MtDnnError::InvalidConfigurationError(format!(
                    "adversarial training requires an adv_loss for task {}",
                    task_def.name
                )));
            }
        }
        if self.adv_train && !self.encoder_type.accepts_input_embeddings() {
            return Err(MtDnnError::InvalidConfigurationError(format!(
                "adversarial training is not available for {:?} backbones",
                self.encoder_type
            )));
        }
        Ok(())
    }
}
