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

use mt_dnn::data::superglue::{save_samples, seeded_rng, SuperGlueTask};
use mt_dnn::MtDnnError;
use std::path::Path;
use tracing::{info, warn};

pub fn main() -> Result<(), MtDnnError> {
    tracing_subscriber::fmt::init();

    let args: Vec<_> = std::env::args().collect();
    if !(3..=4).contains(&args.len()) {
        return Err(MtDnnError::ValueError(format!(
            "usage: {} superglue_dir output_dir [seed]",
            args[0].as_str()
        )));
    }
    let data_dir = Path::new(&args[1]);
    let output_dir = Path::new(&args[2]);
    let seed = match args.get(3) {
        Some(seed) => seed
            .parse::<u64>()
            .map_err(|error| MtDnnError::ValueError(format!("invalid seed {seed}: {error}")))?,
        None => 13,
    };
    std::fs::create_dir_all(output_dir)?;

    let mut rng = seeded_rng(seed);
    for task in SuperGlueTask::ALL {
        for split in task.splits() {
            let source = data_dir.join(task.data_dir()).join(split);
            if !source.is_file() {
                warn!(task = task.name(), path = %source.display(), "split not found, skipping");
                continue;
            }
            let samples = task.load(&source, &mut rng)?;
            let split_name = split.trim_end_matches(".jsonl");
            let destination = output_dir.join(format!("{}_{split_name}.json", task.name()));
            save_samples(&samples, &destination)?;
            info!(path = %destination.display(), samples = samples.len(), "saved");
        }
    }
    Ok(())
}
