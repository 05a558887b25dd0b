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
use crate::task_def::EncoderModelType;
use rust_bert::albert::{AlbertConfig, AlbertModel};
use rust_bert::bert::{BertConfig, BertEmbeddings, BertModel};
use rust_bert::deberta::{DebertaConfig, DebertaModel};
use rust_bert::electra::{ElectraConfig, ElectraModel};
use rust_bert::roberta::RobertaEmbeddings;
use rust_bert::t5::{T5Config, T5ForConditionalGeneration};
use rust_bert::Config;
use std::borrow::Borrow;
use std::path::Path;
use tch::{nn, Kind, Tensor};

/// # Abstraction that holds a backbone configuration, can be of any of the supported backbones
#[derive(Debug)]
pub enum BackboneConfig {
    /// Bert configuration (also used by RoBERTa and XLM-RoBERTa)
    Bert(BertConfig),
    Albert(AlbertConfig),
    Electra(ElectraConfig),
    Deberta(DebertaConfig),
    /// T5 configuration, for the encoder-only and the generative backbones
    T5(T5Config),
}

impl BackboneConfig {
    /// Interface method to load a configuration from file
    pub fn from_file<P: AsRef<Path>>(
        encoder_type: EncoderModelType,
        path: P,
    ) -> Result<Self, MtDnnError> {
        if !path.as_ref().is_file() {
            return Err(MtDnnError::IOError(format!(
                "backbone configuration {} not found",
                path.as_ref().display()
            )));
        }
        Ok(match encoder_type {
            EncoderModelType::Bert | EncoderModelType::Roberta | EncoderModelType::Xlm => {
                BackboneConfig::Bert(BertConfig::from_file(path))
            }
            EncoderModelType::Albert => BackboneConfig::Albert(AlbertConfig::from_file(path)),
            EncoderModelType::Electra => BackboneConfig::Electra(ElectraConfig::from_file(path)),
            EncoderModelType::Deberta => BackboneConfig::Deberta(DebertaConfig::from_file(path)),
            EncoderModelType::T5 | EncoderModelType::T5g => {
                BackboneConfig::T5(T5Config::from_file(path))
            }
        })
    }

    /// Size of the hidden states produced by the backbone
    pub fn hidden_size(&self) -> i64 {
        match self {
            BackboneConfig::Bert(config) => config.hidden_size,
            BackboneConfig::Albert(config) => config.hidden_size,
            BackboneConfig::Electra(config) => config.hidden_size,
            BackboneConfig::Deberta(config) => config.hidden_size,
            BackboneConfig::T5(config) => config.d_model,
        }
    }
}

enum BackboneModel {
    Bert(BertModel<BertEmbeddings>),
    Roberta(BertModel<RobertaEmbeddings>),
    Albert(AlbertModel),
    Electra(ElectraModel),
    Deberta(DebertaModel),
    T5Encoder(T5ForConditionalGeneration),
    T5 {
        model: T5ForConditionalGeneration,
        decoder_start_token_id: i64,
        eos_token_id: i64,
        pad_token_id: i64,
    },
}

/// # Container for the backbone output
pub struct EncoderOutput {
    /// Last hidden state of shape (*batch size*, *sequence_length*, *hidden_size*)
    pub sequence_output: Tensor,
    /// Hidden states of all layers, when the backbone is configured to output them
    pub all_hidden_states: Option<Vec<Tensor>>,
}

/// # Pretrained transformer shared by all tasks
pub struct Backbone {
    encoder_type: EncoderModelType,
    model: BackboneModel,
    word_embeddings: Option<Tensor>,
    hidden_size: i64,
}

impl Backbone {
    /// Builds the backbone matching `encoder_type` under the variable store path `p`.
    /// Variable names follow the rust-bert conventions so that converted pretrained weights load
    /// without renaming (`bert.`, `roberta.`, `albert.`, `electra.`, `deberta.` prefixes, root for
    /// T5).
    pub fn new<'p, P>(
        p: P,
        encoder_type: EncoderModelType,
        config: &BackboneConfig,
    ) -> Result<Backbone, MtDnnError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let (model, prefix) = match (encoder_type, config) {
            (EncoderModelType::Bert, BackboneConfig::Bert(config)) => (
                BackboneModel::Bert(BertModel::new(p / "bert", config)),
                Some("bert"),
            ),
            (EncoderModelType::Roberta | EncoderModelType::Xlm, BackboneConfig::Bert(config)) => (
                BackboneModel::Roberta(BertModel::new(p / "roberta", config)),
                Some("roberta"),
            ),
            (EncoderModelType::Albert, BackboneConfig::Albert(config)) => (
                BackboneModel::Albert(AlbertModel::new(p / "albert", config)),
                Some("albert"),
            ),
            (EncoderModelType::Electra, BackboneConfig::Electra(config)) => (
                BackboneModel::Electra(ElectraModel::new(p / "electra", config)),
                Some("electra"),
            ),
            (EncoderModelType::Deberta, BackboneConfig::Deberta(config)) => (
                BackboneModel::Deberta(DebertaModel::new(p / "deberta", config)),
                Some("deberta"),
            ),
            (EncoderModelType::T5, BackboneConfig::T5(config)) => (
                BackboneModel::T5Encoder(T5ForConditionalGeneration::new(p, config)),
                None,
            ),
            (EncoderModelType::T5g, BackboneConfig::T5(config)) => (
                BackboneModel::T5 {
                    model: T5ForConditionalGeneration::new(p, config),
                    decoder_start_token_id: config.decoder_start_token_id.unwrap_or(0),
                    eos_token_id: config.eos_token_id.unwrap_or(1),
                    pad_token_id: config.pad_token_id.unwrap_or(0),
                },
                None,
            ),
            (encoder_type, _) => {
                return Err(MtDnnError::InvalidConfigurationError(format!(
                    "the supplied backbone configuration does not match {encoder_type:?}"
                )));
            }
        };
        let word_embeddings =
            prefix.and_then(|prefix| (p / prefix / "embeddings" / "word_embeddings").get("weight"));
        Ok(Backbone {
            encoder_type,
            model,
            word_embeddings,
            hidden_size: config.hidden_size(),
        })
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    /// Word embedding lookup, the input of the perturbation loop.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor, MtDnnError> {
        let weight = self.word_embeddings.as_ref().ok_or_else(|| {
            MtDnnError::InvalidConfigurationError(format!(
                "word embeddings are not exposed for {:?}",
                self.encoder_type
            ))
        })?;
        Ok(Tensor::embedding(weight, input_ids, -1, false, false))
    }

    /// Runs the encoder from token ids or from pre-computed word embeddings.
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        mask: Option<&Tensor>,
        token_type_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput, MtDnnError> {
        Ok(match &self.model {
            BackboneModel::Bert(model) => {
                let output = model.forward_t(
                    input_ids,
                    mask,
                    token_type_ids,
                    None,
                    input_embeds,
                    None,
                    None,
                    train,
                )?;
                EncoderOutput {
                    sequence_output: output.hidden_state,
                    all_hidden_states: output.all_hidden_states,
                }
            }
            BackboneModel::Roberta(model) => {
                let output = model.forward_t(
                    input_ids,
                    mask,
                    token_type_ids,
                    None,
                    input_embeds,
                    None,
                    None,
                    train,
                )?;
                EncoderOutput {
                    sequence_output: output.hidden_state,
                    all_hidden_states: output.all_hidden_states,
                }
            }
            BackboneModel::Albert(model) => {
                let output =
                    model.forward_t(input_ids, mask, token_type_ids, None, input_embeds, train)?;
                EncoderOutput {
                    sequence_output: output.hidden_state,
                    all_hidden_states: output.all_hidden_states,
                }
            }
            BackboneModel::Electra(model) => {
                let output =
                    model.forward_t(input_ids, mask, token_type_ids, None, input_embeds, train)?;
                EncoderOutput {
                    sequence_output: output.hidden_state,
                    all_hidden_states: output.all_hidden_states,
                }
            }
            BackboneModel::Deberta(model) => {
                let output =
                    model.forward_t(input_ids, mask, token_type_ids, None, input_embeds, train)?;
                EncoderOutput {
                    sequence_output: output.hidden_state,
                    all_hidden_states: output.all_hidden_states,
                }
            }
            BackboneModel::T5Encoder(model) | BackboneModel::T5 { model, .. } => {
                let input_ids = input_ids.ok_or_else(|| {
                    MtDnnError::ValueError("T5 encoding requires input ids".to_string())
                })?;
                EncoderOutput {
                    sequence_output: model.encode(input_ids, mask),
                    all_hidden_states: None,
                }
            }
        })
    }

    /// Language modeling logits of shape (*batch size*, *target_length*, *vocab_size*) for
    /// encoder-decoder backbones, teacher-forced with `decoder_input_ids`.
    pub fn lm_logits_t(
        &self,
        input_ids: &Tensor,
        mask: Option<&Tensor>,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor, MtDnnError> {
        match &self.model {
            BackboneModel::T5 { model, .. } => Ok(model
                .forward_t(
                    Some(input_ids),
                    mask,
                    None,
                    Some(decoder_input_ids),
                    None,
                    None,
                    None,
                    None,
                    train,
                )
                .decoder_output),
            _ => Err(MtDnnError::InvalidConfigurationError(format!(
                "{:?} is not a sequence-to-sequence backbone",
                self.encoder_type
            ))),
        }
    }

    /// Greedy decoding of at most `max_length` tokens. The returned ids exclude the decoder start
    /// token; finished sequences are right-padded with the pad token.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        mask: Option<&Tensor>,
        max_length: i64,
    ) -> Result<Tensor, MtDnnError> {
        let (model, decoder_start_token_id, eos_token_id, pad_token_id) = match &self.model {
            BackboneModel::T5 {
                model,
                decoder_start_token_id,
                eos_token_id,
                pad_token_id,
            } => (
                model,
                *decoder_start_token_id,
                *eos_token_id,
                *pad_token_id,
            ),
            _ => {
                return Err(MtDnnError::InvalidConfigurationError(format!(
                    "{:?} cannot generate sequences",
                    self.encoder_type
                )));
            }
        };
        let batch_size = input_ids.size()[0];
        let device = input_ids.device();
        let encoder_output = model.encode(input_ids, mask);
        let mut generated = Tensor::full(
            [batch_size, 1],
            decoder_start_token_id,
            (Kind::Int64, device),
        );
        let mut finished = Tensor::zeros([batch_size], (Kind::Bool, device));
        for _ in 0..max_length {
            let logits = model
                .forward_t(
                    None,
                    mask,
                    Some(&encoder_output),
                    Some(&generated),
                    None,
                    None,
                    None,
                    None,
                    false,
                )
                .decoder_output;
            let next_tokens = logits.select(1, -1).argmax(-1, false);
            let next_tokens = next_tokens.where_self(
                &finished.logical_not(),
                &next_tokens.full_like(pad_token_id),
            );
            finished = finished.logical_or(&next_tokens.eq(eos_token_id));
            generated = Tensor::cat(&[generated, next_tokens.unsqueeze(1)], 1);
            if finished.all().int64_value(&[]) != 0 {
                break;
            }
        }
        let length = generated.size()[1];
        Ok(generated.narrow(1, 1, length - 1))
    }
}
