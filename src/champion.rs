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

//! Champion Stage (C8): re-measures the top-K survivors one at a time
//! with a larger transfer budget to establish peak bandwidth.
//!
//! Single-at-a-time is intentional: bandwidth measurement must not
//! compete with itself, so each champion probe is its own single-
//! descriptor batch run through the full supervisor + probe pipeline.

use crate::descriptor::Descriptor;
use crate::orchestrator::BatchOrchestrator;

const CHAMPION_CANDIDATES: usize = 5;

/// Re-probes the top `CHAMPION_CANDIDATES` survivors (by throughput
/// descending) one at a time in champion mode, updates their speed in
/// place by strict-identity match, and returns the peak bandwidth
/// observed across the attempts that produced a result.
pub async fn run_champion_stage(orchestrator: &BatchOrchestrator, survivors: &mut [Descriptor]) -> f64 {
    if survivors.is_empty() {
        return 0.0;
    }

    survivors.sort_by(|a, b| {
        b.measurement
            .speed_mbps
            .partial_cmp(&a.measurement.speed_mbps)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let candidates: Vec<Descriptor> = survivors.iter().take(CHAMPION_CANDIDATES).cloned().collect();

    let mut peak = 0.0_f64;
    for candidate in candidates {
        let result = orchestrator
            .run_champion_probe(candidate.clone())
            .await;
        let Some(champion) = result else { continue };

        if let Some(slot) = survivors
            .iter_mut()
            .find(|s| s.strict_identity() == champion.strict_identity())
        {
            slot.measurement.speed_mbps = champion.measurement.speed_mbps;
        }

        if champion.measurement.speed_mbps > peak {
            peak = champion.measurement.speed_mbps;
        }
    }

    peak
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::descriptor::{Credential, DescriptorConfig, Measurement, Protocol, Security, Transport};
    use std::collections::HashMap;

    fn survivor(speed: f64) -> Descriptor {
        let mut d = Descriptor::new(
            Protocol::Trojan,
            DescriptorConfig {
                server: format!("host-{speed}"),
                port: 443,
                credential: Some(Credential::Password("pw".into())),
                transport: Transport::Tcp,
                security: Security::None,
                path: None,
                host: None,
                service_name: None,
                sni: None,
                fingerprint: None,
                alpn: None,
                reality_public_key: None,
                reality_short_id: None,
                flow: None,
                obfs_type: None,
                obfs_password: None,
                alter_id: 0,
                metadata: HashMap::new(),
            },
            "trojan://...",
        );
        d.measurement = Measurement {
            speed_mbps: speed,
            country: "US".into(),
            ..Default::default()
        };
        d
    }

    #[tokio::test]
    async fn empty_survivors_yields_zero_peak() {
        let orchestrator = BatchOrchestrator::new(Settings::default());
        let mut survivors: Vec<Descriptor> = Vec::new();
        let peak = run_champion_stage(&orchestrator, &mut survivors).await;
        assert_eq!(peak, 0.0);
    }

    #[test]
    fn candidates_are_sorted_by_speed_descending() {
        let mut survivors = vec![survivor(10.0), survivor(50.0), survivor(20.0)];
        survivors.sort_by(|a, b| b.measurement.speed_mbps.partial_cmp(&a.measurement.speed_mbps).unwrap());
        let speeds: Vec<f64> = survivors.iter().map(|s| s.measurement.speed_mbps).collect();
        assert_eq!(speeds, vec![50.0, 20.0, 10.0]);
    }
}
