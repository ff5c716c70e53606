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

//! Runtime Supervisor (C5): sole owner of external-runtime processes.
//!
//! Implements prevalidate, spawn, check for early death, wait for
//! readiness, and guarantee teardown on every exit path.
//! Never relies on the child closing stdout to detect death — status is
//! polled explicitly instead.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::batch_config::{build_batch_config, BatchConfig};
use crate::config::Settings;
use crate::descriptor::Descriptor;

const SETTLE_DELAY: Duration = Duration::from_millis(300);
const READINESS_PER_ATTEMPT: Duration = Duration::from_millis(300);
const READINESS_BACKOFF: Duration = Duration::from_millis(100);
const READINESS_OVERALL: Duration = Duration::from_secs(5);
const POST_READY_SETTLE: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(3);

/// A live, ready runtime instance plus the reconciled batch config.
/// Must have [`RuntimeHandle::teardown`] called exactly once, on every
/// exit path — including cancellation/timeout in the caller.
pub struct RuntimeHandle {
    child: Child,
    config_path: PathBuf,
    pub batch: BatchConfig,
}

impl RuntimeHandle {
    /// Sends a kill to the whole process group, waits up to 3s for reap,
    /// and unlinks the temp config. Always reached.
    pub async fn teardown(mut self) {
        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
        }
        match timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "runtime process reaped"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for runtime process"),
            Err(_) => warn!("runtime process did not exit within teardown deadline"),
        }
        if let Err(e) = tokio::fs::remove_file(&self.config_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.config_path.display(), error = %e, "failed to remove temp config");
            }
        }
    }
}

fn random_suffix() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings.data_dir)
    }

    async fn write_config(&self, prefix: &str, config: &Value) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(self.data_dir()).await?;
        let path = self
            .data_dir()
            .join(format!("{prefix}_{}.json", random_suffix()));
        tokio::fs::write(&path, serde_json::to_vec(config).unwrap_or_default()).await?;
        Ok(path)
    }

    /// Invokes `runtime check -c <path>`, returning whether it exited 0.
    async fn check_config(&self, config: &Value) -> bool {
        let Ok(path) = self.write_config("check", config).await else {
            return false;
        };
        let result = Command::new(&self.settings.runtime_binary)
            .arg("check")
            .arg("-c")
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .status()
            .await;
        let _ = tokio::fs::remove_file(&path).await;
        matches!(result, Ok(status) if status.success())
    }

    /// Prevalidation + single-descriptor fallback. Returns
    /// the config to actually run, built from whichever descriptors
    /// survive. Empty `descriptors` in → empty accepted out, no spawn.
    async fn prevalidated_config(&self, descriptors: &[Descriptor], base_port: u16) -> Option<BatchConfig> {
        let batch = build_batch_config(descriptors, base_port);
        if batch.accepted.is_empty() {
            return None;
        }
        if self.check_config(&batch.config).await {
            return Some(batch);
        }

        warn!("batch config rejected by runtime check, falling back to single-descriptor validation");
        let mut surviving = Vec::new();
        for entry in &batch.accepted {
            let single = std::slice::from_ref(&descriptors[entry.original_index]);
            let single_batch = build_batch_config(single, base_port);
            if !single_batch.accepted.is_empty() && self.check_config(&single_batch.config).await {
                surviving.push(descriptors[entry.original_index].clone());
            }
        }
        if surviving.is_empty() {
            return None;
        }
        Some(build_batch_config(&surviving, base_port))
    }

    /// Full spawn protocol: prevalidate, spawn in a new session, check for
    /// early death, and wait for the first inbound to become ready.
    /// Returns `None` on any spawn-fail or readiness-timeout — the
    /// caller treats that as an empty batch.
    pub async fn spawn_batch(&self, descriptors: &[Descriptor], base_port: u16) -> Option<RuntimeHandle> {
        let batch = self.prevalidated_config(descriptors, base_port).await?;

        let config_path = match self.write_config("run", &batch.config).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to write run config");
                return None;
            }
        };

        let mut cmd = Command::new(&self.settings.runtime_binary);
        cmd.arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to spawn runtime process");
                let _ = tokio::fs::remove_file(&config_path).await;
                return None;
            }
        };

        sleep(SETTLE_DELAY).await;
        if let Ok(Some(status)) = child.try_wait() {
            warn!(?status, "runtime exited immediately after spawn");
            let _ = tokio::fs::remove_file(&config_path).await;
            return None;
        }

        let first_port = batch.accepted[0].port;
        if !wait_for_port(first_port, READINESS_OVERALL).await {
            warn!(port = first_port, "runtime never bound its first inbound");
            let handle = RuntimeHandle {
                child,
                config_path,
                batch,
            };
            handle.teardown().await;
            return None;
        }

        sleep(POST_READY_SETTLE).await;

        Some(RuntimeHandle {
            child,
            config_path,
            batch,
        })
    }
}

/// Repeated TCP connect attempts with per-attempt deadlines and backoff,
/// up to an overall timeout.
async fn wait_for_port(port: u16, overall: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + overall;
    while tokio::time::Instant::now() < deadline {
        let attempt = timeout(READINESS_PER_ATTEMPT, TcpStream::connect(("127.0.0.1", port))).await;
        match attempt {
            Ok(Ok(_stream)) => return true,
            _ => sleep(READINESS_BACKOFF).await,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_eight_hex_chars() {
        let s = random_suffix();
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn wait_for_port_fails_fast_on_unbound_port() {
        // A port nothing is listening on must return false well before
        // the overall timeout elapses in a test-sized window.
        let ok = wait_for_port(1, Duration::from_millis(400)).await;
        assert!(!ok);
    }
}
