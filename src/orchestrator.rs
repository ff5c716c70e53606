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

//! Batch Orchestrator (C7): slices the input into batches, schedules them
//! under a batch-concurrency cap, and aggregates survivors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Settings;
use crate::descriptor::Descriptor;
use crate::geo::GeoCache;
use crate::port_allocator::PortAllocator;
use crate::probe::{run_phases, Gates, PhaseAStats, PhaseBStats};
use crate::supervisor::Supervisor;

/// Per-batch outcome, kept for observability even though only the
/// survivor list crosses the orchestrator boundary.
pub struct BatchResult {
    pub batch_num: usize,
    pub survivors: Vec<Descriptor>,
    pub phase_a: PhaseAStats,
    pub phase_b: PhaseBStats,
}

/// Aggregate result of a full `process_all` run.
#[derive(Default)]
pub struct ProcessSummary {
    pub survivors: Vec<Descriptor>,
    pub total_input: usize,
    pub batches_run: usize,
}

pub struct BatchOrchestrator {
    settings: Arc<Settings>,
    ports: Arc<PortAllocator>,
    geo: Arc<GeoCache>,
    gates: Arc<Gates>,
    batch_gate: Arc<Semaphore>,
}

impl BatchOrchestrator {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let gates = Arc::new(Gates::new(&settings));
        let batch_gate = Arc::new(Semaphore::new(settings.batch_gate));
        Self {
            ports: Arc::new(PortAllocator::new()),
            geo: Arc::new(GeoCache::new()),
            settings,
            gates,
            batch_gate,
        }
    }

    /// Runs one batch under the supervisor + probe driver, wrapped in the
    /// hard per-batch timeout. Any failure — spawn, readiness, or
    /// hard-timeout — yields an empty survivor list; it never
    /// propagates.
    async fn run_one_batch(&self, descriptors: Vec<Descriptor>, batch_num: usize, is_champion: bool) -> BatchResult {
        if descriptors.is_empty() {
            return BatchResult {
                batch_num,
                survivors: Vec::new(),
                phase_a: PhaseAStats::default(),
                phase_b: PhaseBStats::default(),
            };
        }

        let base_port = self.ports.next_base_port(descriptors.len(), self.settings.port_slack);
        let supervisor = Supervisor::new((*self.settings).clone());

        let Some(handle) = supervisor.spawn_batch(&descriptors, base_port).await else {
            warn!(batch_num, "batch failed to reach a ready runtime");
            return BatchResult {
                batch_num,
                survivors: Vec::new(),
                phase_a: PhaseAStats::default(),
                phase_b: PhaseBStats::default(),
            };
        };

        let log_label = if is_champion {
            "champion".to_string()
        } else {
            batch_num.to_string()
        };

        let entries = handle.batch.accepted.clone();
        let probe = tokio::time::timeout(
            Duration::from_secs(self.settings.batch_hard_timeout_secs),
            run_phases(&self.settings, &self.gates, &self.geo, &descriptors, &entries, is_champion, &log_label),
        )
        .await;

        handle.teardown().await;

        match probe {
            Ok(outcome) => BatchResult {
                batch_num,
                survivors: outcome.survivors,
                phase_a: outcome.phase_a,
                phase_b: outcome.phase_b,
            },
            Err(_) => {
                warn!(batch_num, "batch exceeded hard timeout, treated as empty");
                BatchResult {
                    batch_num,
                    survivors: Vec::new(),
                    phase_a: PhaseAStats::default(),
                    phase_b: PhaseBStats::default(),
                }
            }
        }
    }

    /// Slices `descriptors` into contiguous batches of `batch_size` and
    /// schedules them concurrently under the batch gate.
    pub async fn process_all(&self, descriptors: Vec<Descriptor>) -> ProcessSummary {
        self.geo.clear();

        if descriptors.is_empty() {
            return ProcessSummary::default();
        }

        let batch_size = self.settings.batch_size.max(1);
        let total_input = descriptors.len();
        let chunks: Vec<Vec<Descriptor>> = descriptors
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        let total_batches = chunks.len();

        let tasks = chunks.into_iter().enumerate().map(|(i, batch)| {
            let batch_gate = self.batch_gate.clone();
            let batch_num = i + 1;
            let batch_len = batch.len();
            async move {
                let _permit = batch_gate.acquire_owned().await.expect("batch semaphore never closed");
                info!(batch_num, total_batches, size = batch_len, "batch starting");
                let result = self.run_one_batch(batch, batch_num, false).await;
                info!(
                    batch_num,
                    survivors = result.survivors.len(),
                    input = batch_len,
                    "batch finished"
                );
                result
            }
        });

        let results = futures::future::join_all(tasks).await;

        let mut survivors = Vec::new();
        for result in results {
            survivors.extend(result.survivors);
        }

        ProcessSummary {
            survivors,
            total_input,
            batches_run: total_batches,
        }
    }

    /// Runs one descriptor alone, in champion mode, through the full
    /// supervisor + probe pipeline. Returns `None` if it didn't
    /// survive.
    pub async fn run_champion_probe(&self, descriptor: Descriptor) -> Option<Descriptor> {
        let result = self.run_one_batch(vec![descriptor], 0, true).await;
        result.survivors.into_iter().next()
    }

    /// Source URLs that contributed at least one parsed descriptor but
    /// zero survivors — a reporting convenience, not part of the critical
    /// path.
    pub fn dead_sources(all: &[Descriptor], survivors: &[Descriptor]) -> Vec<String> {
        let mut parsed_per_source: HashMap<String, usize> = HashMap::new();
        let mut alive_per_source: HashMap<String, usize> = HashMap::new();

        for d in all {
            if let Some(tag) = &d.source_tag {
                *parsed_per_source.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        for d in survivors {
            if let Some(tag) = &d.source_tag {
                *alive_per_source.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let mut dead: Vec<String> = parsed_per_source
            .into_iter()
            .filter(|(tag, count)| *count > 0 && alive_per_source.get(tag).copied().unwrap_or(0) == 0)
            .map(|(tag, _)| tag)
            .collect();
        dead.sort();
        dead
    }
}
