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
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// # Utility to deserialize JSON config files
pub trait Config
where
    Self: DeserializeOwned + Serialize,
{
    /// Loads a `Config` object from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - `Path` to the configuration JSON file.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mt_dnn::{Config, MtDnnConfig};
    /// use std::path::Path;
    ///
    /// let config_path = Path::new("path/to/config.json");
    /// let config = MtDnnConfig::from_file(config_path)?;
    /// # Ok::<(), mt_dnn::MtDnnError>(())
    /// ```
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, MtDnnError> {
        let f = File::open(path.as_ref()).map_err(|e| {
            MtDnnError::IOError(format!(
                "could not open configuration file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let br = BufReader::new(f);
        Ok(serde_json::from_reader(br)?)
    }

    /// Writes the configuration as pretty-printed JSON.
    fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), MtDnnError> {
        let f = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }
}
