// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

/// Errors that can abort the whole run.
///
/// Per-descriptor and per-batch failures never surface here — the compiler
/// rejects by returning `None`, and the probe driver classifies failures
/// into [`crate::probe::PhaseAStatus`] variants. This type is reserved for
/// startup configuration problems and internal invariant violations.
#[derive(thiserror::Error, Debug)]
pub enum ProxError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize runtime config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid URL in settings: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("bug: {0}")]
    Bug(String),
}
