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

use rust_bert::RustBertError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MtDnnError {
    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),

    #[error("Backbone error: {0}")]
    BackboneError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("Value error: {0}")]
    ValueError(String),
}

impl From<std::io::Error> for MtDnnError {
    fn from(error: std::io::Error) -> Self {
        MtDnnError::IOError(error.to_string())
    }
}

impl From<TchError> for MtDnnError {
    fn from(error: TchError) -> Self {
        MtDnnError::TchError(error.to_string())
    }
}

impl From<RustBertError> for MtDnnError {
    fn from(error: RustBertError) -> Self {
        MtDnnError::BackboneError(error.to_string())
    }
}

impl From<serde_json::Error> for MtDnnError {
    fn from(error: serde_json::Error) -> Self {
        MtDnnError::SerializationError(error.to_string())
    }
}
