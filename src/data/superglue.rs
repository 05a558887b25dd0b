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

//! # SuperGLUE loaders
//! Each loader reads a JSON lines file of the SuperGLUE distribution and flattens it into
//! `Sample`s made of a premise, one or two hypotheses and a label.
//!
//! | Task | Premise | Hypothesis | Extra hypothesis |
//! |---|---|---|---|
//! | BoolQ | passage | question | |
//! | CB | premise | hypothesis | |
//! | MultiRC | passage | question (one sample per answer) | |
//! | ReCoRD | passage | query with a candidate entity | query with a second candidate (training pairs) |
//! | COPA | premise | `because`/`so` + choice 1 | `because`/`so` + choice 2 |
//! | WiC | word | sentence 1 | sentence 2 |
//! | WSC | text | text with the pronoun replaced by its candidate referent | |

use crate::common::error::MtDnnError;
use rand::rngs::StdRng;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{info, warn};

const PLACEHOLDER: &str = "@placeholder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
/// # Sample label, a class index or a class name (CB)
pub enum Label {
    Index(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
/// # Answer attached to a sample
pub enum Answer {
    Text(String),
    /// Candidate entities of a ReCoRD training pair, in hypothesis order
    Candidates(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// # Flattened SuperGLUE example
pub struct Sample {
    pub uid: String,
    pub premise: String,
    pub hypothesis: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hypothesis_extra: Option<String>,
    pub label: Label,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub answer: Option<Answer>,
}

impl Sample {
    fn new(uid: String, premise: &str, hypothesis: String, label: Label) -> Sample {
        Sample {
            uid,
            premise: premise.to_string(),
            hypothesis,
            hypothesis_extra: None,
            label,
            answer: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// # SuperGLUE tasks with a loader
pub enum SuperGlueTask {
    BoolQ,
    Cb,
    MultiRc,
    Record,
    /// ReCoRD scored entity by entity, for all splits
    RecordEval,
    Copa,
    /// COPA as a ranking problem, one sample per choice
    #[serde(rename = "copa_v0")]
    CopaV0,
    Wic,
    Wsc,
}

impl SuperGlueTask {
    /// Tasks prepared by default
    pub const ALL: [SuperGlueTask; 8] = [
        SuperGlueTask::BoolQ,
        SuperGlueTask::Cb,
        SuperGlueTask::MultiRc,
        SuperGlueTask::Record,
        SuperGlueTask::Copa,
        SuperGlueTask::Wic,
        SuperGlueTask::RecordEval,
        SuperGlueTask::Wsc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SuperGlueTask::BoolQ => "boolq",
            SuperGlueTask::Cb => "cb",
            SuperGlueTask::MultiRc => "multirc",
            SuperGlueTask::Record => "record",
            SuperGlueTask::RecordEval => "recordeval",
            SuperGlueTask::Copa => "copa",
            SuperGlueTask::CopaV0 => "copa_v0",
            SuperGlueTask::Wic => "wic",
            SuperGlueTask::Wsc => "wsc",
        }
    }

    /// Directory of the task in the SuperGLUE distribution
    pub fn data_dir(&self) -> &'static str {
        match self {
            SuperGlueTask::BoolQ => "BoolQ",
            SuperGlueTask::Cb => "CB",
            SuperGlueTask::MultiRc => "MultiRC",
            SuperGlueTask::Record | SuperGlueTask::RecordEval => "ReCoRD",
            SuperGlueTask::Copa | SuperGlueTask::CopaV0 => "COPA",
            SuperGlueTask::Wic => "WiC",
            SuperGlueTask::Wsc => "WSC",
        }
    }

    pub fn splits(&self) -> [&'static str; 3] {
        ["train.jsonl", "val.jsonl", "test.jsonl"]
    }

    pub fn from_name(name: &str) -> Option<SuperGlueTask> {
        SuperGlueTask::ALL
            .iter()
            .chain(std::iter::once(&SuperGlueTask::CopaV0))
            .find(|task| task.name() == name)
            .copied()
    }

    /// Loads `path` with the loader of this task. `rng` drives the ReCoRD pair sampling.
    pub fn load<P: AsRef<Path>>(
        &self,
        path: P,
        rng: &mut StdRng,
    ) -> Result<Vec<Sample>, MtDnnError> {
        let path = path.as_ref();
        let samples = match self {
            SuperGlueTask::BoolQ => load_boolq(path),
            SuperGlueTask::Cb => load_cb(path),
            SuperGlueTask::MultiRc => load_multirc(path),
            SuperGlueTask::Record => load_record(path, rng),
            SuperGlueTask::RecordEval => load_record_eval(path),
            SuperGlueTask::Copa => load_copa(path),
            SuperGlueTask::CopaV0 => load_copa_v0(path),
            SuperGlueTask::Wic => load_wic(path),
            SuperGlueTask::Wsc => load_wsc(path),
        }?;
        info!(task = self.name(), path = %path.display(), samples = samples.len(), "loaded");
        Ok(samples)
    }
}

fn read_json_lines<T, P>(path: P) -> Result<Vec<T>, MtDnnError>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|error| {
        MtDnnError::IOError(format!("{} could not be opened: {error}", path.display()))
    })?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Identifiers are integers in most tasks and strings in others.
fn uid_of(idx: &Value) -> String {
    match idx {
        Value::String(idx) => idx.clone(),
        other => other.to_string(),
    }
}

fn binary_label(label: Option<bool>) -> Label {
    Label::Index(label.unwrap_or(false) as i64)
}

#[derive(Deserialize)]
struct BoolQRecord {
    idx: Value,
    passage: String,
    question: String,
    label: Option<bool>,
}

pub fn load_boolq<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    Ok(read_json_lines::<BoolQRecord, _>(path)?
        .into_iter()
        .map(|record| {
            Sample::new(
                uid_of(&record.idx),
                &record.passage,
                record.question,
                binary_label(record.label),
            )
        })
        .collect())
}

#[derive(Deserialize)]
struct CbRecord {
    idx: Value,
    premise: String,
    hypothesis: String,
    label: Option<Label>,
}

pub fn load_cb<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    Ok(read_json_lines::<CbRecord, _>(path)?
        .into_iter()
        .map(|record| {
            Sample::new(
                uid_of(&record.idx),
                &record.premise,
                record.hypothesis,
                record.label.unwrap_or(Label::Index(0)),
            )
        })
        .collect())
}

#[derive(Deserialize)]
struct MultiRcAnswer {
    idx: Value,
    text: String,
    label: Option<i64>,
}

#[derive(Deserialize)]
struct MultiRcQuestion {
    idx: Value,
    question: String,
    answers: Vec<MultiRcAnswer>,
}

#[derive(Deserialize)]
struct MultiRcPassage {
    text: String,
    questions: Vec<MultiRcQuestion>,
}

#[derive(Deserialize)]
struct MultiRcRecord {
    idx: Value,
    passage: MultiRcPassage,
}

/// One sample per candidate answer, identified by `{passage}_{question}_{answer}`.
pub fn load_multirc<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    let mut samples = Vec::new();
    for record in read_json_lines::<MultiRcRecord, _>(path)? {
        let passage_idx = uid_of(&record.idx);
        for question in record.passage.questions {
            let question_idx = uid_of(&question.idx);
            for answer in question.answers {
                let mut sample = Sample::new(
                    format!("{passage_idx}_{question_idx}_{}", uid_of(&answer.idx)),
                    &record.passage.text,
                    question.question.clone(),
                    Label::Index(answer.label.unwrap_or(0)),
                );
                sample.answer = Some(Answer::Text(answer.text));
                samples.push(sample);
            }
        }
    }
    Ok(samples)
}

#[derive(Deserialize)]
struct WicRecord {
    idx: Value,
    word: String,
    sentence1: String,
    sentence2: String,
    label: Option<bool>,
}

pub fn load_wic<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    Ok(read_json_lines::<WicRecord, _>(path)?
        .into_iter()
        .map(|record| {
            let mut sample = Sample::new(
                uid_of(&record.idx),
                &record.word,
                record.sentence1,
                binary_label(record.label),
            );
            sample.hypothesis_extra = Some(record.sentence2);
            sample
        })
        .collect())
}

#[derive(Deserialize)]
struct RecordEntity {
    start: usize,
    end: usize,
}

#[derive(Deserialize)]
struct RecordAnswer {
    text: String,
}

#[derive(Deserialize)]
struct RecordQuery {
    idx: Value,
    query: String,
    answers: Option<Vec<RecordAnswer>>,
}

#[derive(Deserialize)]
struct RecordPassage {
    text: String,
    entities: Vec<RecordEntity>,
}

#[derive(Deserialize)]
struct RecordRecord {
    passage: RecordPassage,
    qas: Vec<RecordQuery>,
}

impl RecordRecord {
    /// Passage with newlines replaced by spaces and the distinct entity strings it mentions.
    /// Entity offsets are inclusive character positions.
    fn passage_and_entities(&self) -> (String, BTreeSet<String>) {
        let passage = self.passage.text.replace('\n', " ");
        let characters = passage.chars().collect::<Vec<char>>();
        let entities = self
            .passage
            .entities
            .iter()
            .filter(|entity| entity.start <= entity.end && entity.start < characters.len())
            .map(|entity| {
                let end = (entity.end + 1).min(characters.len());
                characters[entity.start..end].iter().collect::<String>()
            })
            .collect();
        (passage, entities)
    }
}

impl RecordQuery {
    fn answer_texts(&self) -> BTreeSet<String> {
        self.answers
            .iter()
            .flatten()
            .map(|answer| answer.text.clone())
            .collect()
    }
}

fn record_entity_samples(
    uid: &str,
    passage: &str,
    query: &RecordQuery,
    entities: &BTreeSet<String>,
    with_extra: bool,
) -> Vec<Sample> {
    let answers = query.answer_texts();
    entities
        .iter()
        .map(|entity| {
            let updated_query = query.query.replace(PLACEHOLDER, entity);
            let mut sample = Sample::new(
                uid.to_string(),
                passage,
                updated_query.clone(),
                Label::Index(answers.contains(entity) as i64),
            );
            if with_extra {
                sample.hypothesis_extra = Some(updated_query);
            }
            sample.answer = Some(Answer::Text(entity.clone()));
            sample
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// ReCoRD as pairwise classification on training and validation files: every negative entity is
/// paired with a randomly drawn gold entity, the label tells whether the first hypothesis holds the
/// gold entity. The pair order is shuffled on training files only. Other files are scored entity
/// by entity.
pub fn load_record<P: AsRef<Path>>(path: P, rng: &mut StdRng) -> Result<Vec<Sample>, MtDnnError> {
    let path = path.as_ref();
    let name = file_name(path);
    let is_training = name.contains("train") || name.contains("val");
    let shuffle_pairs = name.contains("train");

    let mut samples = Vec::new();
    for record in read_json_lines::<RecordRecord, _>(path)? {
        let (passage, entities) = record.passage_and_entities();
        for query in record.qas.iter() {
            let uid = uid_of(&query.idx);
            if !is_training {
                samples.extend(record_entity_samples(&uid, &passage, query, &entities, true));
                continue;
            }
            let answers = query.answer_texts();
            let positives = answers.iter().collect::<Vec<&String>>();
            for negative in entities.difference(&answers) {
                let positive = match positives.iter().choose(rng) {
                    Some(positive) => *positive,
                    None => {
                        warn!(uid = %uid, "query without gold answer, skipping its negatives");
                        break;
                    }
                };
                let mut orders = [0usize, 1];
                if shuffle_pairs {
                    orders.shuffle(rng);
                }
                let queries = [
                    query.query.replace(PLACEHOLDER, negative),
                    query.query.replace(PLACEHOLDER, positive),
                ];
                let candidates = [negative.clone(), positive.clone()];
                let mut sample = Sample::new(
                    uid.clone(),
                    &passage,
                    queries[orders[0]].clone(),
                    Label::Index((orders[0] == 0) as i64),
                );
                sample.hypothesis_extra = Some(queries[orders[1]].clone());
                sample.answer = Some(Answer::Candidates(
                    orders.iter().map(|&idx| candidates[idx].clone()).collect(),
                ));
                samples.push(sample);
            }
        }
    }
    Ok(samples)
}

/// ReCoRD scored entity by entity: one sample per distinct passage entity and query.
pub fn load_record_eval<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    let mut samples = Vec::new();
    for record in read_json_lines::<RecordRecord, _>(path)? {
        let (passage, entities) = record.passage_and_entities();
        for query in record.qas.iter() {
            samples.extend(record_entity_samples(
                &uid_of(&query.idx),
                &passage,
                query,
                &entities,
                false,
            ));
        }
    }
    Ok(samples)
}

#[derive(Deserialize)]
struct CopaRecord {
    idx: Value,
    premise: String,
    choice1: String,
    choice2: String,
    question: String,
    label: Option<i64>,
}

impl CopaRecord {
    fn hypotheses(&self) -> [String; 2] {
        let connective = if self.question == "cause" {
            "because"
        } else {
            "so"
        };
        [
            format!("{connective} {}", self.choice1),
            format!("{connective} {}", self.choice2),
        ]
    }
}

pub fn load_copa<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    Ok(read_json_lines::<CopaRecord, _>(path)?
        .into_iter()
        .map(|record| {
            let [first, second] = record.hypotheses();
            let mut sample = Sample::new(
                uid_of(&record.idx),
                &record.premise,
                first,
                Label::Index(record.label.unwrap_or(0)),
            );
            sample.hypothesis_extra = Some(second);
            sample
        })
        .collect())
}

/// COPA for a ranking objective: two samples per example, the correct choice labeled 1.
pub fn load_copa_v0<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    let mut samples = Vec::new();
    for record in read_json_lines::<CopaRecord, _>(path)? {
        let label = record.label.unwrap_or(0);
        if !(0..2).contains(&label) {
            return Err(MtDnnError::ValueError(format!(
                "COPA label {label} out of range for example {}",
                uid_of(&record.idx)
            )));
        }
        let uid = uid_of(&record.idx);
        for (choice, hypothesis) in record.hypotheses().into_iter().enumerate() {
            samples.push(Sample::new(
                uid.clone(),
                &record.premise,
                hypothesis,
                Label::Index((choice as i64 == label) as i64),
            ));
        }
    }
    Ok(samples)
}

#[derive(Deserialize)]
struct WscTarget {
    span1_text: String,
    span2_index: usize,
}

#[derive(Deserialize)]
struct WscRecord {
    idx: Value,
    text: String,
    target: WscTarget,
    label: Option<Value>,
}

/// The hypothesis is the text with the pronoun (token `span2_index`) replaced by the candidate
/// referent.
pub fn load_wsc<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, MtDnnError> {
    let mut samples = Vec::new();
    for record in read_json_lines::<WscRecord, _>(path)? {
        let mut tokens = record.text.split_whitespace().collect::<Vec<&str>>();
        let index = record.target.span2_index;
        if index >= tokens.len() {
            return Err(MtDnnError::ValueError(format!(
                "span2_index {index} out of range for WSC example {}",
                uid_of(&record.idx)
            )));
        }
        tokens[index] = record.target.span1_text.as_str();
        let label = match record.label {
            Some(Value::Bool(label)) => label,
            Some(Value::String(label)) => label.to_lowercase() == "true",
            _ => false,
        };
        samples.push(Sample::new(
            uid_of(&record.idx),
            &record.text,
            tokens.join(" "),
            Label::Index(label as i64),
        ));
    }
    Ok(samples)
}

/// Writes samples as JSON lines.
pub fn save_samples<P: AsRef<Path>>(samples: &[Sample], path: P) -> Result<(), MtDnnError> {
    let lines = samples
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<String>, _>>()?;
    let mut file = File::create(path)?;
    file.write_all(lines.join("\n").as_bytes())?;
    Ok(())
}

/// Seeded generator for reproducible ReCoRD pairs.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
