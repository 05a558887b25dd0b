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

//! # Prediction decoding
//! Turns raw network scores into task-level predictions: argmax over classes, one positive per ranking
//! group, per-token labels truncated to the valid length, answer spans and generated strings.

use crate::batch::GoldLabels;
use crate::common::error::MtDnnError;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder emitted by generative models for questions without answer.
pub const DUMMY_STRING_FOR_EMPTY_ANS: &str = "no answer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Span extraction feature returned with the raw span logits
pub struct SpanFeature {
    pub uid: String,
    pub offset_mapping: Vec<Option<(i64, i64)>>,
    pub token_is_max_context: Option<HashMap<usize, bool>>,
    pub context: String,
    pub answer: Option<String>,
    pub label: Option<i64>,
    pub null_ans_index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Output of `MtDnnModel::predict`
pub enum PredictionOutput {
    /// Class probabilities flattened row-major, predicted class per example
    Classification {
        scores: Vec<f32>,
        predictions: Vec<i64>,
        golds: Option<GoldLabels>,
    },
    Regression {
        scores: Vec<f32>,
        predictions: Vec<f32>,
        golds: Option<GoldLabels>,
    },
    /// Probabilities normalized within each group, 1 for the best candidate of each group
    Ranking {
        scores: Vec<f32>,
        predictions: Vec<i64>,
        golds: Option<GoldLabels>,
    },
    /// Token label scores flattened row-major, label ids truncated to each sequence length
    SequenceLabeling {
        scores: Vec<f32>,
        predictions: Vec<Vec<i64>>,
        golds: Option<GoldLabels>,
    },
    Span {
        start_logits: Vec<Vec<f32>>,
        end_logits: Vec<Vec<f32>>,
        predictions: Vec<String>,
        features: Vec<SpanFeature>,
    },
    /// Generated token ids, decoded answers and gold answers keyed by uid
    Generation {
        sequences: Vec<Vec<i64>>,
        predictions: HashMap<String, String>,
        golds: HashMap<String, String>,
    },
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by_key(|(_, value)| OrderedFloat(**value))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn check_rows(values: &[f32], width: usize, what: &str) -> Result<(), MtDnnError> {
    if width == 0 || values.len() % width != 0 {
        return Err(MtDnnError::ValueError(format!(
            "{what}: {} scores cannot be split in rows of {width}",
            values.len()
        )));
    }
    Ok(())
}

/// Predicted class of each row of `scores` (shape (*batch size*, `num_labels`) flattened).
pub fn decode_classification(scores: &[f32], num_labels: usize) -> Result<Vec<i64>, MtDnnError> {
    check_rows(scores, num_labels, "classification")?;
    Ok(scores
        .chunks(num_labels)
        .map(|row| argmax(row) as i64)
        .collect())
}

/// Normalizes the scores of each group of `pairwise_size` candidates with a softmax and marks the
/// best candidate of each group with 1.
pub fn decode_ranking(
    logits: &[f32],
    pairwise_size: usize,
) -> Result<(Vec<f32>, Vec<i64>), MtDnnError> {
    check_rows(logits, pairwise_size, "ranking")?;
    let mut scores = Vec::with_capacity(logits.len());
    let mut predictions = Vec::with_capacity(logits.len());
    for group in logits.chunks(pairwise_size) {
        let max = group.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exponentials = group.iter().map(|value| (value - max).exp()).collect::<Vec<f32>>();
        let total: f32 = exponentials.iter().sum();
        let best = argmax(group);
        scores.extend(exponentials.iter().map(|value| value / total));
        predictions.extend((0..group.len()).map(|index| (index == best) as i64));
    }
    Ok((scores, predictions))
}

/// Per-token argmax reshaped to the attention mask rows and truncated to each row's valid length
/// (the mask sum).
pub fn decode_sequence_labeling(
    scores: &[f32],
    num_labels: usize,
    mask: &[Vec<i64>],
) -> Result<Vec<Vec<i64>>, MtDnnError> {
    let labels = decode_classification(scores, num_labels)?;
    let sequence_length = mask.first().map_or(0, |row| row.len());
    if labels.len() != mask.len() * sequence_length {
        return Err(MtDnnError::ValueError(format!(
            "{} token predictions do not match a mask of {} x {sequence_length}",
            labels.len(),
            mask.len()
        )));
    }
    Ok(mask
        .iter()
        .zip(labels.chunks(sequence_length.max(1)))
        .map(|(mask_row, row)| {
            let valid_length = mask_row.iter().sum::<i64>().clamp(0, row.len() as i64) as usize;
            row[..valid_length].to_vec()
        })
        .collect())
}

/// Best answer span `(start, end, score)` with `start <= end`, at most `max_answer_len` tokens, both
/// boundaries inside the context and a start token having its maximal context in this feature.
pub fn best_span(
    start_logits: &[f32],
    end_logits: &[f32],
    feature: &SpanFeature,
    max_answer_len: usize,
) -> Option<(usize, usize, f32)> {
    let in_context = |index: usize| matches!(feature.offset_mapping.get(index), Some(Some(_)));
    let max_context = |index: usize| {
        feature
            .token_is_max_context
            .as_ref()
            .map_or(true, |flags| flags.get(&index).copied().unwrap_or(false))
    };
    let mut best: Option<(usize, usize, f32)> = None;
    for (start, start_score) in start_logits.iter().enumerate() {
        if !in_context(start) || !max_context(start) {
            continue;
        }
        let last = (start + max_answer_len).min(end_logits.len());
        for (end, end_score) in end_logits.iter().enumerate().take(last).skip(start) {
            if !in_context(end) {
                continue;
            }
            let score = start_score + end_score;
            if best.map_or(true, |(_, _, best_score)| score > best_score) {
                best = Some((start, end, score));
            }
        }
    }
    best
}

/// Answer text of the best span, empty when no span qualifies or when the null answer scores higher.
pub fn extract_answer(
    start_logits: &[f32],
    end_logits: &[f32],
    feature: &SpanFeature,
    max_answer_len: usize,
) -> String {
    let best = match best_span(start_logits, end_logits, feature, max_answer_len) {
        Some(best) => best,
        None => return String::new(),
    };
    if let Some(null_index) = feature.null_ans_index {
        let null_index = null_index as usize;
        if let (Some(start), Some(end)) = (start_logits.get(null_index), end_logits.get(null_index))
        {
            if start + end > best.2 {
                return String::new();
            }
        }
    }
    match (
        feature.offset_mapping[best.0],
        feature.offset_mapping[best.1],
    ) {
        (Some((char_start, _)), Some((_, char_end))) if char_end >= char_start => feature
            .context
            .chars()
            .skip(char_start.max(0) as usize)
            .take((char_end - char_start) as usize)
            .collect(),
        _ => String::new(),
    }
}

/// Normalizes a decoded generated answer.
pub fn clean_generated_answer(text: &str) -> String {
    let text = text.trim();
    if text == DUMMY_STRING_FOR_EMPTY_ANS {
        String::new()
    } else {
        text.to_string()
    }
}
