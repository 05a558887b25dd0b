extern crate anyhow;

use mt_dnn::batch::{BatchData, BatchMeta, GoldLabels, SpanMeta};
use mt_dnn::network::TaskOutput;
use mt_dnn::task_def::{EncoderModelType, LossKind, TaskDef, TaskType};
use mt_dnn::{MtDnnConfig, MtDnnModel, PredictionOutput};
use rust_bert::pipelines::common::{ModelType, TokenizerOption};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

const BATCH_SIZE: i64 = 4;
const SEQUENCE_LENGTH: i64 = 6;

fn tiny_bert_config(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("bert_config.json");
    std::fs::write(
        &path,
        r#"{
            "hidden_act": "gelu",
            "attention_probs_dropout_prob": 0.0,
            "hidden_dropout_prob": 0.0,
            "hidden_size": 32,
            "initializer_range": 0.02,
            "intermediate_size": 64,
            "max_position_embeddings": 64,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "type_vocab_size": 2,
            "vocab_size": 100
        }"#,
    )?;
    Ok(path)
}

fn tiny_deberta_config(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("deberta_config.json");
    std::fs::write(
        &path,
        r#"{
            "hidden_act": "gelu",
            "attention_probs_dropout_prob": 0.0,
            "hidden_dropout_prob": 0.0,
            "hidden_size": 32,
            "embedding_size": 32,
            "initializer_range": 0.02,
            "intermediate_size": 64,
            "max_position_embeddings": 64,
            "max_relative_positions": -1,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "type_vocab_size": 0,
            "vocab_size": 100,
            "relative_attention": true,
            "position_biased_input": false,
            "pos_att_type": ["c2p", "p2c"],
            "layer_norm_eps": 1e-7,
            "pad_token_id": 0,
            "pooler_dropout": 0.0,
            "pooler_hidden_act": "gelu",
            "pooler_hidden_size": 32
        }"#,
    )?;
    Ok(path)
}

fn tiny_t5_config(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("t5_config.json");
    std::fs::write(
        &path,
        r#"{
            "dropout_rate": 0.0,
            "d_model": 32,
            "d_ff": 64,
            "d_kv": 16,
            "decoder_start_token_id": 0,
            "eos_token_id": 1,
            "pad_token_id": 0,
            "initializer_factor": 1.0,
            "is_encoder_decoder": true,
            "layer_norm_epsilon": 1e-6,
            "num_heads": 2,
            "num_layers": 2,
            "relative_attention_num_buckets": 8,
            "vocab_size": 100
        }"#,
    )?;
    Ok(path)
}

fn config(dir: &Path, task_defs: Vec<TaskDef>) -> anyhow::Result<MtDnnConfig> {
    backbone_config(EncoderModelType::Bert, tiny_bert_config(dir)?, task_defs)
}

fn backbone_config(
    encoder_type: EncoderModelType,
    backbone_config: PathBuf,
    task_defs: Vec<TaskDef>,
) -> anyhow::Result<MtDnnConfig> {
    let mut config = MtDnnConfig::new(encoder_type, backbone_config, task_defs);
    config.dropout_p = 0.0;
    config.learning_rate = 1e-3;
    config.warmup = 0.0;
    config.scheduler_type = 2;
    Ok(config)
}

fn input_batch(labels: TaskOutput) -> BatchData {
    let input_ids = Tensor::from_slice(&[
        1i64, 15, 27, 33, 2, 0, //
        1, 44, 45, 2, 0, 0, //
        1, 71, 8, 9, 10, 2, //
        1, 63, 2, 0, 0, 0,
    ])
    .view([BATCH_SIZE, SEQUENCE_LENGTH]);
    let mut data = BatchData::new(input_ids.shallow_clone());
    data.attention_mask = Some(input_ids.ne(0).to_kind(Kind::Int64));
    data.token_type_ids = Some(input_ids.zeros_like());
    data.labels = Some(labels);
    data
}

fn class_labels(labels: &[i64]) -> TaskOutput {
    TaskOutput::Single(Tensor::from_slice(labels))
}

#[test]
fn mt_dnn_classification_training() -> anyhow::Result<()> {
    //    Set-up model
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("rte", TaskType::Classification, 3, LossKind::CeCriterion);
    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.optimizer = mt_dnn::config::OptimizerType::Adam;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 100)?;

    //    Train on a single batch
    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(class_labels(&[0, 2, 1, 2]));
    model.update(&meta, &data)?;
    let initial_loss = model.train_loss.val;
    for _ in 0..30 {
        model.update(&meta, &data)?;
    }

    assert!(model.train_loss.val < initial_loss);
    assert_eq!(model.updates(), 31);
    assert_eq!(model.train_loss.count, 31 * BATCH_SIZE as usize);

    //    Predict
    let output = model.predict(&meta, &data)?;
    match output {
        PredictionOutput::Classification {
            scores,
            predictions,
            golds,
        } => {
            assert_eq!(scores.len(), 12);
            for row in scores.chunks(3) {
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
            }
            assert_eq!(predictions.len(), 4);
            assert!(golds.is_none());
        }
        other => panic!("unexpected prediction output {other:?}"),
    }
    Ok(())
}

#[test]
fn mt_dnn_gradient_accumulation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("sst", TaskType::Classification, 2, LossKind::CeCriterion);
    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.grad_accumulation_step = 3;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(class_labels(&[0, 1, 1, 0]));
    let classifier = model.var_store().variables()["scoring_list.0.weight"].copy();

    model.update(&meta, &data)?;
    model.update(&meta, &data)?;
    assert_eq!(model.updates(), 0);
    assert_eq!(model.local_updates(), 2);
    let unchanged = &model.var_store().variables()["scoring_list.0.weight"];
    assert!(unchanged.allclose(&classifier, 0.0, 0.0, false));

    model.update(&meta, &data)?;
    assert_eq!(model.updates(), 1);
    let updated = &model.var_store().variables()["scoring_list.0.weight"];
    assert!(!updated.allclose(&classifier, 1e-8, 1e-8, false));
    Ok(())
}

#[test]
fn mt_dnn_multi_task_ranking_and_labeling() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ranking = TaskDef::new("copa", TaskType::Ranking, 1, LossKind::RankCeCriterion);
    let labeling = TaskDef::new("ner", TaskType::SequenceLabeling, 5, LossKind::SeqCeCriterion);
    let config = config(dir.path(), vec![ranking.clone(), labeling.clone()])?;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    //    Ranking: two groups of two candidates, positive index first in each group
    let mut ranking_meta = BatchMeta::new(0, ranking);
    ranking_meta.pairwise_size = 2;
    ranking_meta.true_label = Some(GoldLabels::Classes(vec![0, 1]));
    let ranking_data = input_batch(class_labels(&[0, 0, 1, 1]));
    model.update(&ranking_meta, &ranking_data)?;
    match model.predict(&ranking_meta, &ranking_data)? {
        PredictionOutput::Ranking {
            scores,
            predictions,
            golds,
        } => {
            assert_eq!(scores.len(), 4);
            for group in predictions.chunks(2) {
                assert_eq!(group.iter().sum::<i64>(), 1);
            }
            assert_eq!(golds, Some(GoldLabels::Classes(vec![0, 1])));
        }
        other => panic!("unexpected prediction output {other:?}"),
    }

    //    Sequence labeling: padded positions are ignored
    let token_labels = Tensor::from_slice(&[
        0i64, 1, 2, 3, 0, -1, //
        0, 4, 4, 0, -1, -1, //
        0, 1, 1, 1, 1, 0, //
        0, 2, 0, -1, -1, -1,
    ])
    .view([BATCH_SIZE, SEQUENCE_LENGTH]);
    let labeling_meta = BatchMeta::new(1, labeling);
    let labeling_data = input_batch(TaskOutput::Single(token_labels));
    model.update(&labeling_meta, &labeling_data)?;
    match model.predict(&labeling_meta, &labeling_data)? {
        PredictionOutput::SequenceLabeling {
            scores,
            predictions,
            ..
        } => {
            assert_eq!(scores.len(), (BATCH_SIZE * SEQUENCE_LENGTH * 5) as usize);
            let lengths = predictions.iter().map(Vec::len).collect::<Vec<usize>>();
            assert_eq!(lengths, vec![5, 4, 6, 3]);
        }
        other => panic!("unexpected prediction output {other:?}"),
    }
    assert_eq!(model.updates(), 2);
    Ok(())
}

#[test]
fn mt_dnn_span_prediction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let squad = TaskDef::new("squad", TaskType::Span, 2, LossKind::SpanCeCriterion);
    let mut config = config(dir.path(), vec![squad.clone()])?;
    config.max_answer_len = 3;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let labels = TaskOutput::Span {
        start: Tensor::from_slice(&[1i64, 1, 2, 1]),
        end: Tensor::from_slice(&[2i64, 2, 3, 1]),
    };
    let mut meta = BatchMeta::new(0, squad);
    meta.uids = (0..4).map(|idx| format!("q{idx}")).collect();
    meta.answers = vec!["ab".into(), "cd".into(), "ef".into(), "g".into()];
    let offsets = vec![
        None,
        Some((0, 2)),
        Some((3, 5)),
        Some((6, 8)),
        None,
        None,
    ];
    meta.span = Some(SpanMeta {
        offset_mapping: vec![offsets; 4],
        token_is_max_context: None,
        context: vec!["ab cd ef".to_string(); 4],
        null_ans_index: None,
    });
    let data = input_batch(labels);
    model.update(&meta, &data)?;

    match model.predict(&meta, &data)? {
        PredictionOutput::Span {
            start_logits,
            end_logits,
            predictions,
            features,
        } => {
            assert_eq!(start_logits.len(), 4);
            assert_eq!(end_logits[0].len(), SEQUENCE_LENGTH as usize);
            assert_eq!(features[2].uid, "q2");
            assert_eq!(features[2].answer.as_deref(), Some("ef"));
            for prediction in predictions {
                assert!(!prediction.is_empty());
                assert!("ab cd ef".contains(&prediction));
            }
        }
        other => panic!("unexpected prediction output {other:?}"),
    }
    Ok(())
}

#[test]
fn mt_dnn_distillation_and_adversarial_training() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("mnli", TaskType::Classification, 3, LossKind::CeCriterion)
        .with_kd_loss(LossKind::KlCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.mkd_opt = 1;
    config.adv_train = true;
    config.adv_p_norm = mt_dnn::config::PerturbationNorm::L2;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let mut meta = BatchMeta::new(0, task_def);
    meta.soft_label = Some(Tensor::from_slice(&[
        2.0f32, 0.1, -1.0, //
        -0.5, 1.5, 0.0, //
        0.0, 0.0, 3.0, //
        1.0, 1.0, 1.0,
    ])
    .view([BATCH_SIZE, 3]));
    let data = input_batch(class_labels(&[0, 1, 2, 0]));
    model.update(&meta, &data)?;

    assert_eq!(model.updates(), 1);
    assert!(model.train_loss.val.is_finite());
    assert_eq!(model.adv_loss.count, BATCH_SIZE as usize);
    assert!(model.adv_loss.val >= 0.0);
    assert!(model.emb_val.val > 0.0);
    Ok(())
}

#[test]
fn mt_dnn_encode_and_extract() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("stsb", TaskType::Regression, 1, LossKind::MseCriterion);
    let config = config(dir.path(), vec![task_def])?;
    let model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let data = input_batch(TaskOutput::Single(Tensor::from_slice(&[0.5f32, 1.0, 2.5, 4.0])));
    let sequence_output = model.encode(&data)?;
    assert_eq!(sequence_output.size(), vec![BATCH_SIZE, SEQUENCE_LENGTH, 32]);

    let (hidden_states, pooled_output) = model.extract(&data)?;
    assert!(!hidden_states.is_empty());
    assert_eq!(pooled_output.size(), vec![BATCH_SIZE, 32]);
    Ok(())
}

#[test]
fn mt_dnn_save_and_load() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("stsb", TaskType::Regression, 1, LossKind::MseCriterion);
    let config = config(dir.path(), vec![task_def.clone()])?;
    let mut model = MtDnnModel::new(config.clone(), Device::Cpu, None, 10)?;

    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(TaskOutput::Single(Tensor::from_slice(&[0.5f32, 1.0, 2.5, 4.0])));
    model.update(&meta, &data)?;
    model.update(&meta, &data)?;
    let checkpoint = dir.path().join("model.ot");
    model.save(&checkpoint)?;
    assert!(dir.path().join("model.json").is_file());

    let restored = MtDnnModel::new(config, Device::Cpu, Some(&checkpoint), 10)?;
    assert_eq!(restored.updates(), 2);
    assert!((restored.learning_rate() - model.learning_rate()).abs() < 1e-12);
    let expected = model.var_store().variables();
    for (name, variable) in restored.var_store().variables() {
        assert!(variable.allclose(&expected[&name], 0.0, 0.0, false), "{name} differs");
    }

    let (original, loaded) = match (model.predict(&meta, &data)?, restored.predict(&meta, &data)?) {
        (
            PredictionOutput::Regression { scores: original, .. },
            PredictionOutput::Regression { scores: loaded, .. },
        ) => (original, loaded),
        other => panic!("unexpected prediction outputs {other:?}"),
    };
    assert_eq!(original, loaded);
    Ok(())
}

#[test]
fn mt_dnn_rejects_generation_on_encoder_backbone() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new(
        "squad_gen",
        TaskType::SequenceGeneration,
        1,
        LossKind::SeqCeCriterion,
    );
    let config = config(dir.path(), vec![task_def])?;
    assert!(MtDnnModel::new(config, Device::Cpu, None, 10).is_err());
    Ok(())
}

#[test]
fn mt_dnn_data_parallel_ranks_stay_in_sync() -> anyhow::Result<()> {
    use mt_dnn::distributed::{ProcessGroup, ThreadGroup};
    use std::sync::Arc;

    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("qnli", TaskType::Classification, 2, LossKind::CeCriterion);
    let mut models = Vec::new();
    for (rank, group) in ThreadGroup::new_group(2).into_iter().enumerate() {
        let mut config = config(dir.path(), vec![task_def.clone()])?;
        config.local_rank = rank as i64;
        config.world_size = 2;
        tch::manual_seed(42);
        let group: Arc<dyn ProcessGroup> = Arc::new(group);
        models.push(MtDnnModel::new(config, Device::Cpu, None, 10)?.with_process_group(group)?);
    }

    let weights = std::thread::scope(|scope| {
        let handles = models
            .into_iter()
            .enumerate()
            .map(|(rank, mut model)| {
                let meta = BatchMeta::new(0, task_def.clone());
                scope.spawn(move || -> Result<Tensor, mt_dnn::MtDnnError> {
                    let labels = if rank == 0 { [0, 1, 1, 0] } else { [1, 1, 0, 0] };
                    model.update(&meta, &input_batch(class_labels(&labels)))?;
                    Ok(model.var_store().variables()["scoring_list.0.weight"].copy())
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank panicked"))
            .collect::<Result<Vec<Tensor>, _>>()
    })?;
    assert!(weights[0].allclose(&weights[1], 1e-6, 1e-6, false));
    Ok(())
}

#[test]
fn mt_dnn_ranks_skipping_the_perturbation_stay_in_sync() -> anyhow::Result<()> {
    use mt_dnn::distributed::{ProcessGroup, ThreadGroup};
    use std::sync::Arc;

    //    Rank 0 trains a perturbed classification task, rank 1 a span task (never perturbed)
    let dir = tempfile::tempdir()?;
    let qnli = TaskDef::new("qnli", TaskType::Classification, 2, LossKind::CeCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let squad = TaskDef::new("squad", TaskType::Span, 2, LossKind::SpanCeCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let mut models = Vec::new();
    for (rank, group) in ThreadGroup::new_group(2).into_iter().enumerate() {
        let mut config = config(dir.path(), vec![qnli.clone(), squad.clone()])?;
        config.local_rank = rank as i64;
        config.world_size = 2;
        config.adv_train = true;
        tch::manual_seed(42);
        let group: Arc<dyn ProcessGroup> = Arc::new(group);
        models.push(MtDnnModel::new(config, Device::Cpu, None, 10)?.with_process_group(group)?);
    }

    let results = std::thread::scope(|scope| {
        let handles = models
            .into_iter()
            .enumerate()
            .map(|(rank, mut model)| {
                let (meta, data) = if rank == 0 {
                    (
                        BatchMeta::new(0, qnli.clone()),
                        input_batch(class_labels(&[0, 1, 1, 0])),
                    )
                } else {
                    (
                        BatchMeta::new(1, squad.clone()),
                        input_batch(TaskOutput::Span {
                            start: Tensor::from_slice(&[1i64, 1, 2, 1]),
                            end: Tensor::from_slice(&[2i64, 2, 3, 1]),
                        }),
                    )
                };
                scope.spawn(move || -> Result<MtDnnModel, mt_dnn::MtDnnError> {
                    model.update(&meta, &data)?;
                    model.update(&meta, &data)?;
                    Ok(model)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank panicked"))
            .collect::<Result<Vec<MtDnnModel>, _>>()
    })?;

    for model in results.iter() {
        assert_eq!(model.updates(), 2);
        assert_eq!(model.adv_loss.count, 2 * BATCH_SIZE as usize);
    }
    assert_eq!(results[0].adv_loss.avg, results[1].adv_loss.avg);
    let expected = results[0].var_store().variables();
    for (name, variable) in results[1].var_store().variables() {
        assert!(
            variable.allclose(&expected[&name], 1e-6, 1e-6, false),
            "{name} differs across ranks"
        );
    }
    Ok(())
}

fn first_step_loss(
    config: MtDnnConfig,
    task_def: &TaskDef,
    data: &BatchData,
) -> anyhow::Result<f64> {
    tch::manual_seed(7);
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;
    model.update(&BatchMeta::new(0, task_def.clone()), data)?;
    Ok(model.train_loss.val)
}

#[test]
fn mt_dnn_sample_weights_scale_the_loss() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("rte", TaskType::Classification, 2, LossKind::CeCriterion);
    let mut data = input_batch(class_labels(&[0, 1, 1, 0]));
    data.weights = Some(Tensor::from_slice(&[2.0f32, 2.0, 2.0, 2.0]));

    //    Weights are ignored unless enabled
    let config = config(dir.path(), vec![task_def.clone()])?;
    let unweighted = first_step_loss(config.clone(), &task_def, &data)?;
    let mut weighted_config = config;
    weighted_config.weighted_on = true;
    let weighted = first_step_loss(weighted_config, &task_def, &data)?;

    assert!(unweighted > 0.0);
    assert!((weighted - 2.0 * unweighted).abs() < 1e-4 * unweighted);
    Ok(())
}

#[test]
fn mt_dnn_partial_batches_are_rescaled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("rte", TaskType::Classification, 2, LossKind::CeCriterion);
    let data = input_batch(class_labels(&[0, 1, 1, 0]));

    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.batch_size = 2 * BATCH_SIZE as usize;
    let full = first_step_loss(config.clone(), &task_def, &data)?;
    let mut rescaled_config = config;
    rescaled_config.bin_on = true;
    let rescaled = first_step_loss(rescaled_config, &task_def, &data)?;

    assert!((rescaled - 0.5 * full).abs() < 1e-4 * full);
    Ok(())
}

#[test]
fn mt_dnn_adversarial_regression() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("stsb", TaskType::Regression, 1, LossKind::MseCriterion)
        .with_adv_loss(LossKind::MseCriterion);
    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.adv_train = true;
    config.adv_step_size = 0.1;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(TaskOutput::Single(Tensor::from_slice(&[0.5f32, 1.0, 2.5, 4.0])));
    model.update(&meta, &data)?;

    assert_eq!(model.adv_loss.count, BATCH_SIZE as usize);
    assert!(model.adv_loss.val > 0.0);
    assert!(model.adv_loss.val < model.train_loss.val);
    assert!(model.eff_perturb.val > 0.0);
    Ok(())
}

#[test]
fn mt_dnn_adversarial_ranking() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("copa", TaskType::Ranking, 1, LossKind::RankCeCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let mut config = config(dir.path(), vec![task_def.clone()])?;
    config.adv_train = true;
    config.adv_step_size = 0.1;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let mut meta = BatchMeta::new(0, task_def);
    meta.pairwise_size = 2;
    let data = input_batch(class_labels(&[0, 0, 1, 1]));
    model.update(&meta, &data)?;

    //    Single scores compared one by one would have no divergence
    assert_eq!(model.adv_loss.count, BATCH_SIZE as usize);
    assert!(model.adv_loss.val > 0.0);
    assert!(model.emb_val.val > 0.0);
    Ok(())
}

#[test]
fn mt_dnn_sentence_level_perturbation_is_smaller() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("mrpc", TaskType::Classification, 2, LossKind::CeCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let meta = BatchMeta::new(0, task_def.clone());
    let data = input_batch(class_labels(&[0, 1, 1, 0]));

    let mut perturbations = Vec::new();
    for norm_level in [0u8, 1] {
        let mut config = config(dir.path(), vec![task_def.clone()])?;
        config.adv_train = true;
        config.adv_p_norm = mt_dnn::config::PerturbationNorm::L2;
        config.adv_norm_level = norm_level;
        tch::manual_seed(11);
        let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;
        model.update(&meta, &data)?;
        perturbations.push(model.eff_perturb.val);
    }

    //    Normalizing over the whole sequence spreads the unit norm over several tokens
    assert!(perturbations[1] > 0.0);
    assert!(perturbations[1] < perturbations[0]);
    Ok(())
}

#[test]
fn mt_dnn_deberta_backbone() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("mnli", TaskType::Classification, 3, LossKind::CeCriterion)
        .with_adv_loss(LossKind::SymKlCriterion);
    let mut config = backbone_config(
        EncoderModelType::Deberta,
        tiny_deberta_config(dir.path())?,
        vec![task_def.clone()],
    )?;
    config.adv_train = true;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;
    assert!(model
        .var_store()
        .variables()
        .contains_key("deberta.embeddings.word_embeddings.weight"));

    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(class_labels(&[0, 1, 2, 0]));
    model.update(&meta, &data)?;
    assert_eq!(model.updates(), 1);
    assert_eq!(model.adv_loss.count, BATCH_SIZE as usize);

    let sequence_output = model.encode(&data)?;
    assert_eq!(sequence_output.size(), vec![BATCH_SIZE, SEQUENCE_LENGTH, 32]);
    Ok(())
}

#[test]
fn mt_dnn_t5_encoder_backbone() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new("sst", TaskType::Classification, 2, LossKind::CeCriterion);
    let config = backbone_config(
        EncoderModelType::T5,
        tiny_t5_config(dir.path())?,
        vec![task_def.clone()],
    )?;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 10)?;

    let meta = BatchMeta::new(0, task_def);
    let data = input_batch(class_labels(&[0, 1, 1, 0]));
    model.update(&meta, &data)?;
    match model.predict(&meta, &data)? {
        PredictionOutput::Classification { predictions, .. } => assert_eq!(predictions.len(), 4),
        other => panic!("unexpected prediction output {other:?}"),
    }
    let (_, pooled_output) = model.extract(&data)?;
    assert_eq!(pooled_output.size(), vec![BATCH_SIZE, 32]);
    Ok(())
}

fn wordpiece_tokenizer(dir: &Path) -> anyhow::Result<TokenizerOption> {
    let path = dir.join("vocab.txt");
    let mut vocab = vec!["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"]
        .into_iter()
        .map(String::from)
        .collect::<Vec<String>>();
    vocab.extend((5..100).map(|idx| format!("w{idx}")));
    std::fs::write(&path, vocab.join("\n"))?;
    Ok(TokenizerOption::from_file(
        ModelType::Bert,
        path.to_str().expect("temporary path is valid UTF-8"),
        None,
        true,
        None,
        None,
    )?)
}

#[test]
fn mt_dnn_sequence_generation() -> anyhow::Result<()> {
    //    Set-up model
    let dir = tempfile::tempdir()?;
    let task_def = TaskDef::new(
        "squad_gen",
        TaskType::SequenceGeneration,
        1,
        LossKind::SeqCeCriterion,
    );
    let mut config = backbone_config(
        EncoderModelType::T5g,
        tiny_t5_config(dir.path())?,
        vec![task_def.clone()],
    )?;
    config.optimizer = mt_dnn::config::OptimizerType::Adam;
    config.max_answer_len = 4;
    let mut model = MtDnnModel::new(config, Device::Cpu, None, 100)?
        .with_tokenizer(wordpiece_tokenizer(dir.path())?);

    //    Targets of different lengths, padded with -1 and closed by the end of sequence token
    let targets = Tensor::from_slice(&[
        10i64, 11, 1, //
        12, 1, -1, //
        13, 14, 1, //
        15, 1, -1,
    ])
    .view([BATCH_SIZE, 3]);
    let decoder_inputs = Tensor::from_slice(&[
        0i64, 10, 11, //
        0, 12, 0, //
        0, 13, 14, //
        0, 15, 0,
    ])
    .view([BATCH_SIZE, 3]);
    let mut data = input_batch(TaskOutput::Single(targets));
    data.y_input_ids = Some(decoder_inputs);
    let mut meta = BatchMeta::new(0, task_def);
    meta.uids = (0..4).map(|idx| format!("g{idx}")).collect();
    meta.answers = vec!["w10 w11".into(), "w12".into(), "w13 w14".into(), "w15".into()];

    //    Train
    model.update(&meta, &data)?;
    let initial_loss = model.train_loss.val;
    for _ in 0..20 {
        model.update(&meta, &data)?;
    }
    assert!(model.train_loss.val < initial_loss);

    //    Generate
    match model.predict(&meta, &data)? {
        PredictionOutput::Generation {
            sequences,
            predictions,
            golds,
        } => {
            assert_eq!(sequences.len(), 4);
            for sequence in sequences.iter() {
                assert!(!sequence.is_empty());
                assert!(sequence.len() <= 4);
            }
            assert_eq!(predictions.len(), 4);
            assert!(predictions.contains_key("g3"));
            assert_eq!(golds["g0"], "w10 w11");
        }
        other => panic!("unexpected prediction output {other:?}"),
    }
    Ok(())
}
