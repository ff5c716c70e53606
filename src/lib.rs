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

//! Concurrent verification pipeline for proxy-endpoint subscription feeds.
//!
//! This crate implements the probing pipeline only (C1–C8): compiling
//! descriptors into an external tunnel runtime's configuration,
//! supervising that runtime, driving latency and throughput phases
//! through live local SOCKS listeners, and returning annotated
//! survivors. Ingestion (wire-URI parsing) and export (subscription
//! rendering) are external collaborators and are not implemented here.

pub mod batch_config;
pub mod champion;
pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod geo;
pub mod orchestrator;
pub mod port_allocator;
pub mod probe;
pub mod supervisor;

use std::time::Instant;

pub use config::Settings;
pub use descriptor::Descriptor;
pub use error::ProxError;
pub use orchestrator::{BatchOrchestrator, ProcessSummary};

/// Summary of one full pipeline run: bulk verification followed by the
/// champion re-measurement stage (mirrors `main()` in the original
/// implementation, minus export/notification — those stay external).
pub struct RunReport {
    pub total_input: usize,
    pub survivors: Vec<Descriptor>,
    pub peak_bandwidth_mbps: f64,
    pub elapsed: std::time::Duration,
}

/// Runs the bulk batch pipeline then the champion stage over
/// `descriptors`, returning the annotated survivors and peak bandwidth.
pub async fn run_pipeline(settings: Settings, descriptors: Vec<Descriptor>) -> RunReport {
    let start = Instant::now();
    let orchestrator = BatchOrchestrator::new(settings);

    let ProcessSummary {
        mut survivors,
        total_input,
        ..
    } = orchestrator.process_all(descriptors).await;

    let peak_bandwidth_mbps = champion::run_champion_stage(&orchestrator, &mut survivors).await;
    survivors.sort_by(|a, b| {
        b.measurement
            .speed_mbps
            .partial_cmp(&a.measurement.speed_mbps)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    RunReport {
        total_input,
        survivors,
        peak_bandwidth_mbps,
        elapsed: start.elapsed(),
    }
}
