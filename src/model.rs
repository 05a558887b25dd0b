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

//! # MT-DNN model wrapper
//! Owns the multi-task network together with its optimizer, learning rate scheduler, loss
//! criteria and adversarial regularizer, and exposes training (`update`), inference (`predict`,
//! `encode`, `extract`) and checkpointing (`save`, `load`).
//!
//! ```no_run
//! # fn main() -> Result<(), mt_dnn::MtDnnError> {
//! use mt_dnn::{Config, MtDnnConfig, MtDnnModel};
//! use tch::Device;
//!
//! let config = MtDnnConfig::from_file("path/to/mt_dnn_config.json")?;
//! let mut model = MtDnnModel::new(config, Device::cuda_if_available(), None, 10_000)?;
//! model.save("path/to/checkpoint.ot")?;
//! # Ok(())
//! # }
//! ```

use crate::batch::{BatchData, BatchMeta, GoldLabels};
use crate::common::config::Config;
use crate::common::error::MtDnnError;
use crate::common::meter::AverageMeter;
use crate::config::MtDnnConfig;
use crate::distributed::{
    all_reduce_gradients, all_reduce_statistics, ProcessGroup, SingleProcess,
};
use crate::loss::Criterion;
use crate::network::{BackboneConfig, MtDnnNetwork, TaskOutput};
use crate::optim::{clip_grad_norm, param_groups, LossScaler, LrScheduler, Optimizer, ScheduleKind};
use crate::perturbation::SmartPerturbation;
use crate::predict::{
    clean_generated_answer, decode_classification, decode_ranking, decode_sequence_labeling,
    extract_answer, PredictionOutput, SpanFeature,
};
use crate::task_def::{EncoderModelType, LossKind, TaskDef, TaskType};
use rust_bert::pipelines::common::{ModelType, TokenizerOption};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tch::{nn, no_grad, Device, Kind, Tensor};
use tracing::{debug, info, warn};

const STATE_PREFIX: &str = "state.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const UPDATES_KEY: &str = "meta.updates";
const SCHEDULER_STEP_KEY: &str = "meta.scheduler_step";

/// # Multi-task model with its training state
pub struct MtDnnModel {
    config: MtDnnConfig,
    device: Device,
    var_store: nn::VarStore,
    network: MtDnnNetwork,
    optimizer: Optimizer,
    scheduler: LrScheduler,
    loss_scaler: Option<LossScaler>,
    task_loss_criterion: Vec<Option<Criterion>>,
    kd_task_loss_criterion: Vec<Option<Criterion>>,
    adv_teacher: Option<SmartPerturbation>,
    tokenizer: Option<TokenizerOption>,
    process_group: Arc<dyn ProcessGroup>,
    updates: i64,
    local_updates: i64,
    pub train_loss: AverageMeter,
    pub adv_loss: AverageMeter,
    pub emb_val: AverageMeter,
    pub eff_perturb: AverageMeter,
}

impl MtDnnModel {
    /// Build a new `MtDnnModel`
    ///
    /// # Arguments
    ///
    /// * `config` - `MtDnnConfig` describing the backbone, the tasks and the training options
    /// * `device` - device holding the weights and running the computations
    /// * `checkpoint` - optional checkpoint written by `save`, restored non-strictly
    /// * `num_train_step` - total number of optimizer steps, used by the learning rate schedule.
    ///   Non-positive values keep the learning rate constant.
    pub fn new(
        config: MtDnnConfig,
        device: Device,
        checkpoint: Option<&Path>,
        num_train_step: i64,
    ) -> Result<MtDnnModel, MtDnnError> {
        let backbone_config =
            BackboneConfig::from_file(config.encoder_type, &config.backbone_config)?;
        MtDnnModel::new_with_backbone_config(
            config,
            backbone_config,
            device,
            checkpoint,
            num_train_step,
        )
    }

    /// Same as `new`, with an already loaded backbone configuration.
    pub fn new_with_backbone_config(
        config: MtDnnConfig,
        backbone_config: BackboneConfig,
        device: Device,
        checkpoint: Option<&Path>,
        num_train_step: i64,
    ) -> Result<MtDnnModel, MtDnnError> {
        config.validate()?;
        if config.multi_gpu_on {
            warn!("multi_gpu_on is not supported, use one process per device with a process group");
        }

        let mut var_store = nn::VarStore::new(device);
        let network = MtDnnNetwork::new(
            var_store.root(),
            config.encoder_type,
            &backbone_config,
            &config.task_def_list,
            config.dropout_p,
        )?;
        if let Some(init_checkpoint) = config.init_checkpoint.as_ref() {
            let missing = var_store.load_partial(init_checkpoint)?;
            info!(
                path = %init_checkpoint.display(),
                missing = missing.len(),
                "loaded initial backbone weights"
            );
            if !missing.is_empty() {
                debug!(?missing, "variables not found in the initial checkpoint");
            }
        }

        let optimizer = Optimizer::new(
            config.optimizer,
            param_groups(&var_store, config.weight_decay),
        );
        let scheduler = LrScheduler::new(
            ScheduleKind::from_code(config.scheduler_type),
            config.learning_rate,
            config.warmup,
            num_train_step,
        );
        let loss_scaler = config
            .fp16
            .then(|| LossScaler::new(config.fp16_init_scale, config.fp16_scale_window));

        let task_loss_criterion = build_criteria(&config, "Loss func", |task_def| {
            Some(task_def.loss)
        });
        let kd_task_loss_criterion = if config.kd_enabled() {
            build_criteria(&config, "KD Loss func", |task_def| task_def.kd_loss)
        } else {
            Vec::new()
        };
        let adv_teacher = config.adv_train.then(|| {
            SmartPerturbation::new(
                config.adv_epsilon,
                config.adv_step_size,
                config.adv_noise_var,
                config.adv_p_norm,
                config.adv_k,
                config.fp16,
                config.adv_norm_level,
                build_criteria(&config, "Adv Loss func", |task_def| task_def.adv_loss),
            )
        });

        let tokenizer = load_tokenizer(&config);

        let mut model = MtDnnModel {
            config,
            device,
            var_store,
            network,
            optimizer,
            scheduler,
            loss_scaler,
            task_loss_criterion,
            kd_task_loss_criterion,
            adv_teacher,
            tokenizer,
            process_group: Arc::new(SingleProcess),
            updates: 0,
            local_updates: 0,
            train_loss: AverageMeter::new(),
            adv_loss: AverageMeter::new(),
            emb_val: AverageMeter::new(),
            eff_perturb: AverageMeter::new(),
        };
        if let Some(checkpoint) = checkpoint {
            model.load(checkpoint)?;
        }
        Ok(model)
    }

    /// Attaches the process group used to synchronize gradients and statistics across ranks.
    pub fn with_process_group(
        mut self,
        process_group: Arc<dyn ProcessGroup>,
    ) -> Result<MtDnnModel, MtDnnError> {
        if process_group.world_size() != self.config.world_size {
            return Err(MtDnnError::InvalidConfigurationError(format!(
                "process group has {} ranks, configuration expects {}",
                process_group.world_size(),
                self.config.world_size
            )));
        }
        self.process_group = process_group;
        Ok(self)
    }

    /// Replaces the tokenizer used to decode generated sequences.
    pub fn with_tokenizer(mut self, tokenizer: TokenizerOption) -> MtDnnModel {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn config(&self) -> &MtDnnConfig {
        &self.config
    }

    pub fn network(&self) -> &MtDnnNetwork {
        &self.network
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    /// Number of optimizer steps taken
    pub fn updates(&self) -> i64 {
        self.updates
    }

    /// Number of `update` calls, including those accumulating gradients
    pub fn local_updates(&self) -> i64 {
        self.local_updates
    }

    /// Learning rate of the next optimizer step
    pub fn learning_rate(&self) -> f64 {
        self.scheduler.lr()
    }

    fn is_distributed(&self) -> bool {
        self.config.is_distributed() && self.process_group.world_size() > 1
    }

    /// Averages the loss and the adversarial statistics (embedding magnitude, effective
    /// perturbation) over the ranks. Ranks that skipped the perturbation take part in the same
    /// collective call.
    fn reduce_statistics(
        &self,
        loss: f64,
        adversarial: Option<[f64; 3]>,
    ) -> Result<(f64, Option<[f64; 3]>), MtDnnError> {
        if self.is_distributed() {
            all_reduce_statistics(self.process_group.as_ref(), loss, adversarial)
        } else {
            Ok((loss, adversarial))
        }
    }

    /// Runs a training step on a batch. Gradients are accumulated over `grad_accumulation_step`
    /// calls before the optimizer steps.
    pub fn update(&mut self, meta: &BatchMeta, data: &BatchData) -> Result<(), MtDnnError> {
        let data = data.to_device(self.device);
        let input = data.network_input();
        let task_id = meta.task_id;
        let task_type = self.network.task_type(task_id)?;
        let fp16 = self.config.fp16;

        let network = &self.network;
        let logits = tch::autocast(fp16, || network.forward_t(&input, task_id, true))?;

        let weight = if self.config.weighted_on {
            data.weights.as_ref()
        } else {
            None
        };
        let mut loss: Option<Tensor> = None;

        if let (Some(Some(criterion)), Some(labels)) =
            (self.task_loss_criterion.get(task_id), data.labels.as_ref())
        {
            let task_loss = if criterion.kind() == LossKind::RankCeCriterion
                && meta.pairwise_size > 1
            {
                criterion.forward(&logits, labels, weight, -1, meta.pairwise_size)?
            } else if task_type == TaskType::SequenceGeneration {
                let target = labels.single()?;
                let sequence_weight = inverse_length_weights(target);
                criterion.forward(
                    &logits,
                    &TaskOutput::Single(target.view([-1])),
                    Some(&sequence_weight),
                    -1,
                    1,
                )?
            } else {
                criterion.forward(&logits, labels, weight, -1, meta.pairwise_size)?
            };
            loss = Some(task_loss);
        }

        if self.config.kd_enabled() {
            if let (Some(soft_label), Some(Some(criterion))) = (
                meta.soft_label.as_ref(),
                self.kd_task_loss_criterion.get(task_id),
            ) {
                let soft_label = TaskOutput::Single(soft_label.to_device(self.device));
                let kd_loss =
                    criterion.forward(&logits, &soft_label, weight, -1, meta.pairwise_size)?;
                loss = Some(add_loss(loss, kd_loss));
            }
        }

        let mut adversarial = None;
        if let Some(adv_teacher) = self.adv_teacher.as_ref() {
            adversarial = adv_teacher.forward(
                &self.network,
                &logits,
                &input,
                task_id,
                task_type,
                meta.pairwise_size,
            )?;
            if let Some(output) = adversarial.as_ref() {
                loss = Some(add_loss(loss, &output.loss * self.config.adv_alpha));
            }
        }

        let mut loss = loss.ok_or_else(|| {
            MtDnnError::ValueError(format!(
                "batch of task {} carries neither labels nor soft labels",
                meta.task_def.name
            ))
        })?;
        if !loss.requires_grad() {
            return Err(MtDnnError::ValueError(
                "training loss is not attached to the network parameters".to_string(),
            ));
        }

        let batch_size = data.batch_size();
        if self.config.bin_on {
            loss = loss * (batch_size as f64 / self.config.batch_size as f64);
        }
        let adversarial_statistics = adversarial.as_ref().map(|output| {
            [
                output.loss.double_value(&[]),
                output.embedding_magnitude,
                output.effective_perturbation,
            ]
        });
        let (loss_value, adversarial_statistics) =
            self.reduce_statistics(loss.double_value(&[]), adversarial_statistics)?;
        self.train_loss.update(loss_value, batch_size as usize);
        if let Some([adv_value, emb_value, perturbation_value]) = adversarial_statistics {
            self.adv_loss.update(adv_value, batch_size as usize);
            self.emb_val.update(emb_value, batch_size as usize);
            self.eff_perturb.update(perturbation_value, batch_size as usize);
        }

        let loss = loss / self.config.grad_accumulation_step as f64;
        match self.loss_scaler.as_ref() {
            Some(loss_scaler) => loss_scaler.scale_loss(&loss).backward(),
            None => loss.backward(),
        }
        self.local_updates += 1;
        debug!(
            task = %meta.task_def.name,
            loss = loss_value,
            local_updates = self.local_updates,
            "training step"
        );
        if self.local_updates % self.config.grad_accumulation_step as i64 == 0 {
            self.optimizer_step()?;
        }
        Ok(())
    }

    fn optimizer_step(&mut self) -> Result<(), MtDnnError> {
        if self.is_distributed() {
            all_reduce_gradients(self.process_group.as_ref(), self.optimizer.parameters())?;
        }
        let finite = match self.loss_scaler.as_ref() {
            Some(loss_scaler) => loss_scaler.unscale_gradients(self.optimizer.parameters()),
            None => true,
        };
        if let Some(loss_scaler) = self.loss_scaler.as_mut() {
            loss_scaler.update(!finite);
        }
        if finite {
            if self.config.global_grad_clipping > 0.0 {
                let total_norm =
                    clip_grad_norm(self.optimizer.parameters(), self.config.global_grad_clipping);
                debug!(total_norm, "gradient norm before clipping");
            }
            self.optimizer.step(self.scheduler.lr());
        }
        self.updates += 1;
        self.optimizer.zero_grad();
        self.scheduler.step();
        Ok(())
    }

    /// Runs inference on a batch and decodes the scores according to the task type.
    pub fn predict(
        &self,
        meta: &BatchMeta,
        data: &BatchData,
    ) -> Result<PredictionOutput, MtDnnError> {
        let data = data.to_device(self.device);
        let input = data.network_input();
        let task_id = meta.task_id;
        let task_type = self.network.task_type(task_id)?;

        if task_type == TaskType::SequenceGeneration {
            return self.predict_generation(meta, &data);
        }

        let logits = no_grad(|| self.network.forward_t(&input, task_id, false))?;
        match task_type {
            TaskType::Classification => {
                let logits = logits.single()?;
                let num_labels = logits.size()[1];
                let scores = to_vec(&logits.softmax(-1, Kind::Float))?;
                let predictions = decode_classification(&scores, num_labels as usize)?;
                Ok(PredictionOutput::Classification {
                    scores,
                    predictions,
                    golds: meta.label.clone(),
                })
            }
            TaskType::Regression => {
                let scores = to_vec(logits.single()?)?;
                Ok(PredictionOutput::Regression {
                    predictions: scores.clone(),
                    scores,
                    golds: meta.label.clone(),
                })
            }
            TaskType::Ranking => {
                let (scores, predictions) =
                    decode_ranking(&to_vec(logits.single()?)?, meta.pairwise_size.max(1) as usize)?;
                Ok(PredictionOutput::Ranking {
                    scores,
                    predictions,
                    golds: meta.true_label.clone(),
                })
            }
            TaskType::SequenceLabeling => {
                let logits = logits.single()?;
                let num_labels = logits.size()[1];
                let mask = data.attention_mask.as_ref().ok_or_else(|| {
                    MtDnnError::ValueError(
                        "sequence labeling prediction requires an attention mask".to_string(),
                    )
                })?;
                let scores = to_vec(logits)?;
                let predictions =
                    decode_sequence_labeling(&scores, num_labels as usize, &to_rows(mask)?)?;
                Ok(PredictionOutput::SequenceLabeling {
                    scores,
                    predictions,
                    golds: meta.label.clone(),
                })
            }
            TaskType::Span | TaskType::SpanYN => self.decode_spans(meta, &logits),
            TaskType::SequenceGeneration => self.predict_generation(meta, &data),
        }
    }

    fn decode_spans(
        &self,
        meta: &BatchMeta,
        logits: &TaskOutput,
    ) -> Result<PredictionOutput, MtDnnError> {
        let (start, end) = match logits {
            TaskOutput::Span { start, end } => (start, end),
            TaskOutput::Single(_) => {
                return Err(MtDnnError::ValueError(
                    "span tasks must produce start and end logits".to_string(),
                ));
            }
        };
        let span_meta = meta.span.as_ref().ok_or_else(|| {
            MtDnnError::ValueError(format!(
                "span prediction for task {} requires span metadata",
                meta.task_def.name
            ))
        })?;
        let start_logits = to_float_rows(start)?;
        let end_logits = to_float_rows(end)?;
        let labels = match meta.label.as_ref() {
            Some(GoldLabels::Classes(labels)) => Some(labels),
            _ => None,
        };

        let mut features = Vec::with_capacity(span_meta.offset_mapping.len());
        for (idx, offset_mapping) in span_meta.offset_mapping.iter().enumerate() {
            features.push(SpanFeature {
                uid: meta.uids.get(idx).cloned().unwrap_or_default(),
                offset_mapping: offset_mapping.clone(),
                token_is_max_context: span_meta
                    .token_is_max_context
                    .as_ref()
                    .and_then(|flags| flags.get(idx).cloned()),
                context: span_meta.context.get(idx).cloned().unwrap_or_default(),
                answer: meta.answers.get(idx).cloned(),
                label: labels.and_then(|labels| labels.get(idx).copied()),
                null_ans_index: span_meta.null_ans_index,
            });
        }
        if features.len() != start_logits.len() {
            return Err(MtDnnError::ValueError(format!(
                "{} span features for a batch of {}",
                features.len(),
                start_logits.len()
            )));
        }
        let max_answer_len = self.config.max_answer_len.max(1) as usize;
        let predictions = features
            .iter()
            .zip(start_logits.iter().zip(end_logits.iter()))
            .map(|(feature, (start, end))| extract_answer(start, end, feature, max_answer_len))
            .collect();

        Ok(PredictionOutput::Span {
            start_logits,
            end_logits,
            predictions,
            features,
        })
    }

    fn predict_generation(
        &self,
        meta: &BatchMeta,
        data: &BatchData,
    ) -> Result<PredictionOutput, MtDnnError> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            MtDnnError::InvalidConfigurationError(
                "decoding generated sequences requires a tokenizer (vocab_path)".to_string(),
            )
        })?;
        let input = data.network_input();
        let generated = no_grad(|| self.network.generate(&input, self.config.max_answer_len))?;
        let sequences = to_rows(&generated)?;

        let mut predictions = HashMap::with_capacity(sequences.len());
        let mut golds = HashMap::with_capacity(sequences.len());
        for (idx, sequence) in sequences.iter().enumerate() {
            let uid = meta.uids.get(idx).cloned().ok_or_else(|| {
                MtDnnError::ValueError(format!("missing uid for generated sequence {idx}"))
            })?;
            let text = tokenizer.decode(sequence, true, true);
            predictions.insert(uid.clone(), clean_generated_answer(&text));
            golds.insert(uid, meta.answers.get(idx).cloned().unwrap_or_default());
        }
        Ok(PredictionOutput::Generation {
            sequences,
            predictions,
            golds,
        })
    }

    /// Last hidden state of the backbone, shape (*batch size*, *sequence_length*, *hidden_size*).
    pub fn encode(&self, data: &BatchData) -> Result<Tensor, MtDnnError> {
        let data = data.to_device(self.device);
        let input = data.network_input();
        let output = no_grad(|| self.network.encode(&input, false))?;
        Ok(output.sequence_output)
    }

    /// Hidden states of all backbone layers (the last one only when the backbone is not configured
    /// to output them) and the pooled representation of the first token.
    pub fn extract(&self, data: &BatchData) -> Result<(Vec<Tensor>, Tensor), MtDnnError> {
        let data = data.to_device(self.device);
        let input = data.network_input();
        no_grad(|| {
            let output = self.network.encode(&input, false)?;
            let pooled_output = self.network.pool(&output.sequence_output);
            let all_hidden_states = output
                .all_hidden_states
                .unwrap_or_else(|| vec![output.sequence_output]);
            Ok((all_hidden_states, pooled_output))
        })
    }

    /// Saves network weights, optimizer state and training progress to `path`, and the
    /// configuration as JSON next to it (same path with a `.json` extension).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MtDnnError> {
        let path = path.as_ref();
        let mut variables = self.var_store.variables().into_iter().collect::<Vec<_>>();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let mut named_tensors = Vec::with_capacity(variables.len() + 2);
        for (name, tensor) in variables {
            named_tensors.push((
                format!("{STATE_PREFIX}{name}"),
                tensor.detach().to_device(Device::Cpu),
            ));
        }
        for (name, tensor) in self.optimizer.state_dict() {
            named_tensors.push((
                format!("{OPTIMIZER_PREFIX}{name}"),
                tensor.to_device(Device::Cpu),
            ));
        }
        named_tensors.push((UPDATES_KEY.to_string(), Tensor::from(self.updates)));
        named_tensors.push((
            SCHEDULER_STEP_KEY.to_string(),
            Tensor::from(self.scheduler.current_step()),
        ));
        Tensor::save_multi(&named_tensors, path)?;
        self.config.to_file(path.with_extension("json"))?;
        info!(path = %path.display(), "model saved");
        Ok(())
    }

    /// Restores a checkpoint written by `save`. Variables absent from the checkpoint keep their
    /// current value and unknown entries are ignored.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), MtDnnError> {
        let path = path.as_ref();
        let mut network_state = HashMap::new();
        let mut optimizer_state = HashMap::new();
        for (name, tensor) in Tensor::load_multi(path)? {
            if let Some(name) = name.strip_prefix(STATE_PREFIX) {
                network_state.insert(name.to_string(), tensor);
            } else if let Some(name) = name.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer_state.insert(name.to_string(), tensor);
            } else if name == UPDATES_KEY {
                self.updates = tensor.int64_value(&[]);
            } else if name == SCHEDULER_STEP_KEY {
                self.scheduler.set_current_step(tensor.int64_value(&[]));
            }
        }

        let mut missing = Vec::new();
        no_grad(|| -> Result<(), MtDnnError> {
            for (name, mut variable) in self.var_store.variables() {
                match network_state.get(&name) {
                    Some(value) if value.size() == variable.size() => {
                        variable.f_copy_(&value.to_device(variable.device()))?;
                    }
                    Some(value) => {
                        return Err(MtDnnError::ValueError(format!(
                            "checkpoint variable {name} has shape {:?}, expected {:?}",
                            value.size(),
                            variable.size()
                        )));
                    }
                    None => missing.push(name),
                }
            }
            Ok(())
        })?;
        if !missing.is_empty() {
            warn!(count = missing.len(), "variables missing from checkpoint");
            debug!(?missing, "missing variables");
        }
        let restored = self.optimizer.load_state_dict(&optimizer_state)?;

        let config_path = path.with_extension("json");
        if config_path.is_file() {
            let saved_config = MtDnnConfig::from_file(&config_path)?;
            if saved_config.encoder_type == self.config.encoder_type
                && saved_config.task_def_list.len() == self.config.task_def_list.len()
            {
                self.config.task_def_list = saved_config.task_def_list;
            } else {
                warn!(
                    path = %config_path.display(),
                    "saved configuration describes another architecture, ignoring it"
                );
            }
        }
        info!(
            path = %path.display(),
            updates = self.updates,
            optimizer_states = restored,
            "model loaded"
        );
        Ok(())
    }
}

fn build_criteria<F>(config: &MtDnnConfig, label: &str, kind: F) -> Vec<Option<Criterion>>
where
    F: Fn(&TaskDef) -> Option<LossKind>,
{
    config
        .task_def_list
        .iter()
        .enumerate()
        .map(|(idx, task_def)| {
            kind(task_def).map(|kind| {
                let criterion = Criterion::new(kind, format!("{label} of task {idx}: {kind}"));
                info!("{}", criterion.name());
                criterion
            })
        })
        .collect()
}

fn load_tokenizer(config: &MtDnnConfig) -> Option<TokenizerOption> {
    let vocab_path = config.vocab_path.as_ref()?.to_str()?;
    let merges_path = config.merges_path.as_ref().and_then(|path| path.to_str());
    let model_type = match config.encoder_type {
        EncoderModelType::Bert => ModelType::Bert,
        EncoderModelType::Roberta => ModelType::Roberta,
        EncoderModelType::Xlm => ModelType::XLMRoberta,
        EncoderModelType::Albert => ModelType::Albert,
        EncoderModelType::Electra => ModelType::Electra,
        EncoderModelType::Deberta => ModelType::Deberta,
        EncoderModelType::T5 | EncoderModelType::T5g => ModelType::T5,
    };
    match TokenizerOption::from_file(
        model_type,
        vocab_path,
        merges_path,
        config.lower_case,
        None::<bool>,
        None::<bool>,
    ) {
        Ok(tokenizer) => Some(tokenizer),
        Err(error) => {
            warn!(%error, "could not load the tokenizer, generated sequences cannot be decoded");
            None
        }
    }
}

fn add_loss(loss: Option<Tensor>, other: Tensor) -> Tensor {
    match loss {
        Some(loss) => loss + other,
        None => other,
    }
}

/// Weights of 1 / *valid length* for every target position of a (*batch size*, *target_length*)
/// label tensor, flattened. Positions labeled -1 are padding.
fn inverse_length_weights(target: &Tensor) -> Tensor {
    let target_length = target.size()[1];
    target
        .gt(-1)
        .to_kind(Kind::Float)
        .sum_dim_intlist([1i64].as_slice(), true, Kind::Float)
        .clamp_min(1.0)
        .reciprocal()
        .repeat([1, target_length])
        .view([-1])
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>, MtDnnError> {
    Ok(Vec::<f32>::try_from(
        tensor
            .detach()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .contiguous()
            .view([-1]),
    )?)
}

fn to_float_rows(tensor: &Tensor) -> Result<Vec<Vec<f32>>, MtDnnError> {
    let width = tensor.size().last().copied().unwrap_or(1).max(1) as usize;
    Ok(to_vec(tensor)?
        .chunks(width)
        .map(|row| row.to_vec())
        .collect())
}

fn to_rows(tensor: &Tensor) -> Result<Vec<Vec<i64>>, MtDnnError> {
    let width = tensor.size().last().copied().unwrap_or(1).max(1) as usize;
    let values = Vec::<i64>::try_from(
        tensor
            .to_kind(Kind::Int64)
            .to_device(Device::Cpu)
            .contiguous()
            .view([-1]),
    )?;
    Ok(values.chunks(width).map(|row| row.to_vec()).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequence_weights_average_over_valid_positions() {
        let target = Tensor::from_slice(&[3i64, 4, -1, -1, 5, 6, 7, 8]).view([2, 4]);
        let weights = Vec::<f32>::try_from(inverse_length_weights(&target)).unwrap();
        assert_eq!(weights, vec![0.5, 0.5, 0.5, 0.5, 0.25, 0.25, 0.25, 0.25]);
    }

    #[test]
    fn rows_follow_the_last_dimension() {
        let tensor = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6]).view([3, 2]);
        assert_eq!(
            to_rows(&tensor).unwrap(),
            vec![vec![1, 2], vec![3, 4], vec![5, 6]]
        );
    }
}
