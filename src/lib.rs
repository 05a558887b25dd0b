//! # MT-DNN: multi-task fine-tuning of pretrained transformers
//!
//! This crate fine-tunes a pretrained transformer backbone ([rust-bert](https://docs.rs/rust-bert))
//! on several natural language understanding tasks at once. The backbone is shared across tasks and
//! each task gets its own scoring head. Training supports:
//! - task losses for classification, regression, ranking, span extraction, sequence labeling and
//!   sequence generation
//! - knowledge distillation from teacher soft labels
//! - SMART adversarial regularization in the word embedding space
//! - gradient accumulation, global gradient clipping and warmup learning rate schedules
//! - mixed precision with dynamic loss scaling
//! - data-parallel gradient averaging through a `ProcessGroup`
//!
//! ```no_run
//! # fn main() -> Result<(), mt_dnn::MtDnnError> {
//! use mt_dnn::batch::{BatchData, BatchMeta};
//! use mt_dnn::network::TaskOutput;
//! use mt_dnn::task_def::{EncoderModelType, LossKind, TaskDef, TaskType};
//! use mt_dnn::{MtDnnConfig, MtDnnModel};
//! use tch::{Device, Tensor};
//!
//! let rte = TaskDef::new("rte", TaskType::Classification, 2, LossKind::CeCriterion);
//! let config = MtDnnConfig::new(EncoderModelType::Bert, "path/to/bert_config.json", vec![rte]);
//! let mut model = MtDnnModel::new(config, Device::cuda_if_available(), None, 1_000)?;
//!
//! let meta = BatchMeta::new(0, model.config().task_def_list[0].clone());
//! let mut data = BatchData::new(Tensor::from_slice(&[101i64, 2023, 102]).view([1, 3]));
//! data.labels = Some(TaskOutput::Single(Tensor::from_slice(&[1i64])));
//! model.update(&meta, &data)?;
//! println!("loss: {:.4}", model.train_loss.avg);
//! # Ok(())
//! # }
//! ```
//!
//! SuperGLUE annotations can be flattened with the `superglue-prepro` binary or the loaders of
//! [`data::superglue`].

pub mod batch;
pub mod common;
pub mod config;
pub mod data;
pub mod distributed;
pub mod loss;
pub mod model;
pub mod network;
pub mod optim;
pub mod perturbation;
pub mod predict;
pub mod task_def;

pub use common::error::MtDnnError;
pub use common::{AverageMeter, Config};
pub use config::MtDnnConfig;
pub use model::MtDnnModel;
pub use predict::PredictionOutput;
