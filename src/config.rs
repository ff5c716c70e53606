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

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProxError;

/// Pipeline-wide settings, read once at startup.
///
/// Mirrors the `checking` / `system` sections of the original Python
/// `AppSettings`, flattened to the keys the probing pipeline itself
/// consults. Every field has a default so an absent config file (or an
/// absent key within one) is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of descriptors per batch.
    pub batch_size: usize,
    /// Survivors below this throughput (Mbps) are dropped.
    pub min_speed: f64,
    /// Survivors above this latency (ms) are dropped.
    pub max_latency: u32,
    /// URL used for the normal-mode throughput phase.
    pub speedtest_url: String,
    /// URL used for the champion-mode throughput phase.
    pub champion_test_url: String,
    /// URLs tried (in order, first one wins) during the latency phase.
    pub connectivity_urls: Vec<String>,
    /// User-Agent header sent on every probe request.
    pub user_agent: String,
    /// Path to the external tunnel runtime binary.
    pub runtime_binary: String,

    /// Concurrent batches.
    pub batch_gate: usize,
    /// Concurrent phase-A requests, process-wide.
    pub ping_gate: usize,
    /// Concurrent phase-B requests, process-wide.
    pub speed_gate: usize,
    /// Extra ports reserved per batch beyond its descriptor count.
    pub port_slack: u16,
    /// Per-entry stagger before phase A starts, in seconds.
    pub ping_stagger_secs: f64,
    /// Hard ceiling on one batch's probing, in seconds.
    pub batch_hard_timeout_secs: u64,

    /// Directory for temporary runtime configs.
    pub data_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_speed: 1.0,
            max_latency: 5000,
            speedtest_url: "https://speed.cloudflare.com/__down?bytes=5000000".into(),
            champion_test_url: "https://speed.cloudflare.com/__down?bytes=20000000".into(),
            connectivity_urls: vec![
                "http://www.gstatic.com/generate_204".into(),
                "http://cp.cloudflare.com/generate_204".into(),
            ],
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36"
                .into(),
            runtime_binary: "sing-box".into(),
            batch_gate: 5,
            ping_gate: 150,
            speed_gate: 5,
            port_slack: 10,
            ping_stagger_secs: 0.02,
            batch_hard_timeout_secs: 180,
            data_dir: "data".into(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional TOML file layered over defaults.
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ProxError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            } else {
                tracing::warn!(path = %path.display(), "settings file not found, using defaults");
            }
        }
        let cfg = builder.build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate_urls()?;
        Ok(settings)
    }

    /// Rejects a settings file that points any probe URL at something
    /// that isn't a well-formed absolute URL, so a typo in a config file
    /// surfaces at startup instead of as a mysterious all-dead batch.
    fn validate_urls(&self) -> Result<(), ProxError> {
        url::Url::parse(&self.speedtest_url)?;
        url::Url::parse(&self.champion_test_url)?;
        for u in &self.connectivity_urls {
            url::Url::parse(u)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.ping_gate, 150);
        assert_eq!(s.speed_gate, 5);
        assert_eq!(s.batch_gate, 5);
        assert_eq!(s.port_slack, 10);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let s = Settings::load(Some(Path::new("/nonexistent/settings.toml"))).unwrap();
        assert_eq!(s.batch_size, Settings::default().batch_size);
    }
}
