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

//! Process-wide geo cache: keyed by server host, last-writer
//! wins. Benign races are acceptable since values are stable per host —
//! encapsulated in a handle rather than a bare global.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct GeoCache {
    inner: Mutex<HashMap<String, String>>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<String> {
        self.inner.lock().unwrap().get(host).cloned()
    }

    pub fn set(&self, host: &str, country: String) {
        self.inner.lock().unwrap().insert(host.to_string(), country);
    }

    /// Cleared at the start of each full pipeline run (`process_all` in
    /// the original), not per-batch.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
