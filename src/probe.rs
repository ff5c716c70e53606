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

//! Probe Driver (C6): latency phase then throughput phase against each
//! inbound of a live batch, under the global ping/speed gates.
//!
//! Phase B never starts for any entry until Phase A has completed for
//! every entry in the batch — modeled as two explicit
//! sequential phase functions, not a single reactive stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::batch_config::AcceptedEntry;
use crate::config::Settings;
use crate::descriptor::{Descriptor, Measurement};
use crate::geo::GeoCache;

const CHUNK_TARGET_NORMAL: u64 = 1024 * 1024;
const CHUNK_TARGET_CHAMPION: u64 = 10 * 1024 * 1024;
const DROP_FLOOR_BYTES: u64 = 50_000;
const PING_TIMEOUT_TOTAL: Duration = Duration::from_secs(8);
const PING_TIMEOUT_CONNECT: Duration = Duration::from_secs(4);
const GEO_TIMEOUT: Duration = Duration::from_secs(3);

/// Process-wide concurrency gates. Constructed once, shared (via
/// `Arc`) across every batch for the lifetime of a run.
pub struct Gates {
    pub ping: Arc<Semaphore>,
    pub speed: Arc<Semaphore>,
}

impl Gates {
    pub fn new(settings: &Settings) -> Self {
        Self {
            ping: Arc::new(Semaphore::new(settings.ping_gate)),
            speed: Arc::new(Semaphore::new(settings.speed_gate)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAStatus {
    Ok,
    HighLatency,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseAStats {
    pub ok: u32,
    pub timeout: u32,
    pub high_latency: u32,
    pub error: u32,
}

impl PhaseAStats {
    fn record(&mut self, status: PhaseAStatus) {
        match status {
            PhaseAStatus::Ok => self.ok += 1,
            PhaseAStatus::HighLatency => self.high_latency += 1,
            PhaseAStatus::Timeout => self.timeout += 1,
            PhaseAStatus::Error => self.error += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseBStats {
    pub ok: u32,
    pub low_speed: u32,
    pub drop: u32,
    pub error: u32,
}

/// Combined result of driving both phases over one batch.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub survivors: Vec<Descriptor>,
    pub phase_a: PhaseAStats,
    pub phase_b: PhaseBStats,
}

fn build_client(
    port: u16,
    settings: &Settings,
    connect_timeout: Duration,
    total_timeout: Option<Duration>,
    follow_redirects: bool,
) -> Option<Client> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{port}")).ok()?;
    let mut builder = Client::builder()
        .proxy(proxy)
        .user_agent(settings.user_agent.clone())
        .connect_timeout(connect_timeout)
        .redirect(if follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        });
    if let Some(t) = total_timeout {
        builder = builder.timeout(t);
    }
    builder.build().ok()
}

/// One Phase-A entry: staggered start, ping-gate acquisition, a single
/// HTTP GET against the configured connectivity URL, classified.
async fn ping_one(gates: &Gates, settings: &Settings, port: u16, stagger: Duration) -> (PhaseAStatus, u32) {
    if !stagger.is_zero() {
        sleep(stagger).await;
    }
    let _permit = gates.ping.acquire().await.expect("ping semaphore never closed");

    let Some(client) = build_client(port, settings, PING_TIMEOUT_CONNECT, Some(PING_TIMEOUT_TOTAL), false) else {
        return (PhaseAStatus::Error, 0);
    };
    let url = settings
        .connectivity_urls
        .first()
        .cloned()
        .unwrap_or_else(|| "http://www.gstatic.com/generate_204".to_string());

    let start = Instant::now();
    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let ok_status = matches!(
                status,
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
            );
            if !ok_status {
                return (PhaseAStatus::Error, 0);
            }
            let latency_ms = start.elapsed().as_millis() as u32;
            if latency_ms > settings.max_latency {
                (PhaseAStatus::HighLatency, latency_ms)
            } else {
                (PhaseAStatus::Ok, latency_ms)
            }
        }
        Err(e) if e.is_timeout() => (PhaseAStatus::Timeout, 0),
        Err(_) => (PhaseAStatus::Error, 0),
    }
}

enum BodyOutcome {
    Completed,
    BadStatus,
}

/// Outcome of one Phase-B entry, kept distinct so the batch-level
/// histogram can report `ok`/`low_speed`/`drop`/`error` separately.
enum SpeedOutcome {
    Ok(Descriptor),
    LowSpeed,
    Drop,
    Error,
}

/// One Phase-B entry: speed-gate acquisition, a fresh SOCKS5 session, a
/// GET to the speedtest URL read in 64 KiB-ish chunks up to a byte
/// target or deadline, then geo lookup for survivors.
async fn speed_one(
    gates: &Gates,
    settings: &Settings,
    geo: &GeoCache,
    descriptor: &Descriptor,
    port: u16,
    latency_ms: u32,
    is_champion: bool,
) -> SpeedOutcome {
    let _permit = gates.speed.acquire().await.expect("speed semaphore never closed");

    let Some(client) = build_client(port, settings, PING_TIMEOUT_CONNECT, None, true) else {
        return SpeedOutcome::Error;
    };

    let url = if is_champion {
        &settings.champion_test_url
    } else {
        &settings.speedtest_url
    };
    let target_bytes = if is_champion { CHUNK_TARGET_CHAMPION } else { CHUNK_TARGET_NORMAL };
    let deadline = if is_champion { Duration::from_secs(12) } else { Duration::from_secs(8) };

    let counted = Arc::new(AtomicU64::new(0));
    let counted_task = counted.clone();
    let client_task = client.clone();
    let url_task = url.clone();

    let body = async move {
        let resp = client_task.get(&url_task).send().await.map_err(|_| ())?;
        if resp.status() != StatusCode::OK {
            return Ok(BodyOutcome::BadStatus);
        }
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let Ok(bytes) = chunk else { break };
            let total = counted_task.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
            if total >= target_bytes {
                break;
            }
        }
        Ok(BodyOutcome::Completed)
    };

    let start = Instant::now();
    let outcome = timeout(deadline, body).await;
    let total = counted.load(Ordering::Relaxed);

    match outcome {
        Ok(Ok(BodyOutcome::BadStatus)) => return SpeedOutcome::Error,
        Ok(Ok(BodyOutcome::Completed)) => {}
        Ok(Err(())) | Err(_) => {
            if total < DROP_FLOOR_BYTES {
                return SpeedOutcome::Drop;
            }
        }
    }

    let elapsed_secs = start.elapsed().as_secs_f64().max(0.1);
    let mbps = ((total as f64 * 8.0) / (elapsed_secs * 1_000_000.0)).min(3000.0);
    let mbps = (mbps * 10.0).round() / 10.0;

    if mbps < settings.min_speed {
        return SpeedOutcome::LowSpeed;
    }

    let country = lookup_country(geo, &client, &descriptor.config.server).await;
    SpeedOutcome::Ok(descriptor.with_measurement(Measurement {
        latency_ms,
        speed_mbps: mbps,
        country,
        alive: true,
    }))
}

async fn lookup_country(geo: &GeoCache, client: &Client, server_host: &str) -> String {
    if let Some(cached) = geo.get(server_host) {
        return cached;
    }
    let result: Option<String> = async {
        let resp = client
            .get("http://cp.cloudflare.com/cdn-cgi/trace")
            .timeout(GEO_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let text = resp.text().await.ok()?;
        text.lines()
            .find_map(|line| line.strip_prefix("loc="))
            .map(|loc| loc.to_ascii_uppercase())
    }
    .await;

    match result {
        Some(country) => {
            geo.set(server_host, country.clone());
            country
        }
        None => Measurement::unknown_country(),
    }
}

/// Drives both phases for one ready batch. `entries` maps inbound index
/// to the (descriptor, port) pair the Supervisor reconciled.
pub async fn run_phases(
    settings: &Settings,
    gates: &Gates,
    geo: &GeoCache,
    descriptors: &[Descriptor],
    entries: &[AcceptedEntry],
    is_champion: bool,
    log_label: &str,
) -> ProbeOutcome {
    let stagger_step = Duration::from_secs_f64(settings.ping_stagger_secs);

    let ping_futures = entries.iter().enumerate().map(|(i, entry)| {
        let stagger = stagger_step.saturating_mul(i as u32);
        let descriptor = &descriptors[entry.original_index];
        async move {
            let (status, latency) = ping_one(gates, settings, entry.port, stagger).await;
            (entry, descriptor, status, latency)
        }
    });
    let ping_results = futures::future::join_all(ping_futures).await;

    let mut phase_a = PhaseAStats::default();
    let mut advancing: Vec<(&AcceptedEntry, &Descriptor, u32)> = Vec::new();
    for (entry, descriptor, status, latency) in ping_results {
        phase_a.record(status);
        if status == PhaseAStatus::Ok {
            advancing.push((entry, descriptor, latency));
        }
    }
    info!(
        batch = log_label,
        ok = phase_a.ok,
        timeout = phase_a.timeout,
        high_latency = phase_a.high_latency,
        error = phase_a.error,
        "phase-A latency summary"
    );

    if advancing.is_empty() {
        return ProbeOutcome {
            survivors: Vec::new(),
            phase_a,
            phase_b: PhaseBStats::default(),
        };
    }

    let speed_futures = advancing.iter().map(|item| {
        let (entry, descriptor, latency) = *item;
        speed_one(gates, settings, geo, descriptor, entry.port, latency, is_champion)
    });
    let speed_results = futures::future::join_all(speed_futures).await;

    let mut phase_b = PhaseBStats::default();
    let mut survivors = Vec::new();
    for result in speed_results {
        match result {
            SpeedOutcome::Ok(descriptor) => {
                phase_b.ok += 1;
                survivors.push(descriptor);
            }
            SpeedOutcome::LowSpeed => phase_b.low_speed += 1,
            SpeedOutcome::Drop => phase_b.drop += 1,
            SpeedOutcome::Error => phase_b.error += 1,
        }
    }
    info!(
        batch = log_label,
        ok = phase_b.ok,
        low_speed = phase_b.low_speed,
        drop = phase_b.drop,
        error = phase_b.error,
        "phase-B throughput summary"
    );

    ProbeOutcome {
        survivors,
        phase_a,
        phase_b,
    }
}
