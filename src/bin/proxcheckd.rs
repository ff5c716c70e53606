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

//! Thin binary wiring the probing pipeline to a JSON descriptor file and
//! stdout. Stands in for the ingestion parser and subscription exporter,
//! neither of which this crate implements.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use proxcheck::descriptor::{Credential, Descriptor, DescriptorConfig, Protocol, Security, Transport};
use proxcheck::{run_pipeline, Settings};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proxcheckd", about = "Batch-verify proxy-endpoint descriptors")]
struct Args {
    /// Path to a JSON array of descriptors, in the shape ingestion would
    /// have produced (see `WireDescriptor`).
    #[arg(long)]
    input: PathBuf,

    /// Optional TOML settings file; absent keys fall back to defaults.
    #[arg(long)]
    settings: Option<PathBuf>,
}

/// On-disk shape of one descriptor. A stand-in for whatever the
/// ingestion parser would hand the core pipeline; not part of the
/// library's public contract.
#[derive(Debug, Serialize, Deserialize)]
struct WireDescriptor {
    protocol: String,
    server: String,
    port: u16,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default = "default_transport")]
    transport: String,
    #[serde(default = "default_security")]
    security: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    alpn: Option<String>,
    #[serde(default)]
    reality_public_key: Option<String>,
    #[serde(default)]
    reality_short_id: Option<String>,
    #[serde(default)]
    flow: Option<String>,
    #[serde(default)]
    obfs_type: Option<String>,
    #[serde(default)]
    obfs_password: Option<String>,
    #[serde(default)]
    alter_id: u32,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    raw_uri: String,
    #[serde(default)]
    source_tag: Option<String>,
}

fn default_transport() -> String {
    "tcp".into()
}

fn default_security() -> String {
    "none".into()
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s {
        "vless" => Some(Protocol::Vless),
        "vmess" => Some(Protocol::Vmess),
        "trojan" => Some(Protocol::Trojan),
        "shadowsocks" | "ss" => Some(Protocol::Shadowsocks),
        "hysteria2" => Some(Protocol::Hysteria2),
        _ => None,
    }
}

fn parse_transport(s: &str) -> Transport {
    match s {
        "ws" => Transport::Ws,
        "grpc" => Transport::Grpc,
        "httpupgrade" => Transport::HttpUpgrade,
        "xhttp" => Transport::XHttp,
        "http" => Transport::Http,
        "h2" => Transport::H2,
        "quic" => Transport::Quic,
        _ => Transport::Tcp,
    }
}

fn parse_security(s: &str) -> Security {
    match s {
        "tls" => Security::Tls,
        "reality" => Security::Reality,
        "auto" => Security::Auto,
        _ => Security::None,
    }
}

fn to_descriptor(w: WireDescriptor) -> Option<Descriptor> {
    let protocol = parse_protocol(&w.protocol)?;
    let credential = if let Some(uuid) = w.uuid {
        Some(Credential::Uuid(uuid))
    } else if let Some(method) = w.method {
        Some(Credential::MethodPassword {
            method,
            password: w.password.unwrap_or_default(),
        })
    } else {
        w.password.map(Credential::Password)
    };

    let config = DescriptorConfig {
        server: w.server,
        port: w.port,
        credential,
        transport: parse_transport(&w.transport),
        security: parse_security(&w.security),
        path: w.path,
        host: w.host,
        service_name: w.service_name,
        sni: w.sni,
        fingerprint: w.fingerprint,
        alpn: w.alpn,
        reality_public_key: w.reality_public_key,
        reality_short_id: w.reality_short_id,
        flow: w.flow,
        obfs_type: w.obfs_type,
        obfs_password: w.obfs_password,
        alter_id: w.alter_id,
        metadata: w.metadata,
    };

    let mut descriptor = Descriptor::new(protocol, config, w.raw_uri);
    descriptor.source_tag = w.source_tag;
    Some(descriptor)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.settings.as_deref())?;

    let raw = tokio::fs::read_to_string(&args.input).await?;
    let wire: Vec<WireDescriptor> = serde_json::from_str(&raw)?;
    let total = wire.len();
    let descriptors: Vec<Descriptor> = wire.into_iter().filter_map(to_descriptor).collect();
    tracing::info!(total, loaded = descriptors.len(), "descriptors loaded");

    let report = run_pipeline(settings, descriptors).await;

    tracing::info!(
        total_input = report.total_input,
        survivors = report.survivors.len(),
        peak_bandwidth_mbps = report.peak_bandwidth_mbps,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "pipeline complete"
    );

    let summary: Vec<_> = report
        .survivors
        .iter()
        .map(|d| {
            serde_json::json!({
                "protocol": d.protocol.to_string(),
                "server": d.config.server,
                "port": d.config.port,
                "latency_ms": d.measurement.latency_ms,
                "speed_mbps": d.measurement.speed_mbps,
                "country": d.measurement.country,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
