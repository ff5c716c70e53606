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

//! Canonical in-memory shape of a proxy endpoint (C1).
//!
//! A [`Descriptor`] is produced by ingestion (external to this crate),
//! passed by value into the probing pipeline, and annotated post-probe by
//! copy — see `with_measurement` below. Nothing here parses wire URIs;
//! that is the ingestion parser's job.

use std::collections::HashMap;
use std::fmt;

/// Upstream proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Hysteria2 => "hysteria2",
        };
        f.write_str(s)
    }
}

/// Transport layer carrying the protocol's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws,
    Grpc,
    HttpUpgrade,
    XHttp,
    Http,
    H2,
    Quic,
}

impl Transport {
    /// HTTP-family transports resolve SNI differently: the
    /// virtual-host fallback is skipped for them.
    pub fn is_http_family(self) -> bool {
        matches!(self, Transport::Http | Transport::H2)
    }
}

/// TLS posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Reality,
    /// Treated identically to `Tls`.
    Auto,
}

/// Authentication material, shaped per protocol family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Uuid(String),
    Password(String),
    MethodPassword { method: String, password: String },
}

impl Credential {
    /// The raw secret, used for strict-identity derivation. Never logged.
    pub fn secret(&self) -> &str {
        match self {
            Credential::Uuid(u) => u,
            Credential::Password(p) => p,
            Credential::MethodPassword { password, .. } => password,
        }
    }
}

/// Protocol-specific configuration bag, plus an open metadata map for
/// unrecognized passthrough URI parameters.
#[derive(Debug, Clone)]
pub struct DescriptorConfig {
    pub server: String,
    pub port: u16,
    pub credential: Option<Credential>,
    pub transport: Transport,
    pub security: Security,
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub alpn: Option<String>,
    pub reality_public_key: Option<String>,
    pub reality_short_id: Option<String>,
    pub flow: Option<String>,
    pub obfs_type: Option<String>,
    pub obfs_password: Option<String>,
    pub alter_id: u32,
    pub metadata: HashMap<String, String>,
}

impl DescriptorConfig {
    /// True if `metadata` carries an insecure/allow-insecure flag set to a
    /// truthy value.
    pub fn allow_insecure(&self) -> bool {
        self.metadata.iter().any(|(k, v)| {
            matches!(k.to_ascii_lowercase().as_str(), "allowinsecure" | "insecure")
                && matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        })
    }
}

/// Reachability/throughput annotations attached post-probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub latency_ms: u32,
    pub speed_mbps: f64,
    pub country: String,
    pub alive: bool,
}

impl Measurement {
    pub fn unknown_country() -> String {
        "UN".to_string()
    }
}

/// The canonical internal record for one proxy endpoint.
///
/// Immutable after parse except for `measurement`, which is only ever
/// replaced wholesale via [`Descriptor::with_measurement`] — never mutated
/// in place, per lifecycle rule.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub protocol: Protocol,
    pub config: DescriptorConfig,
    pub raw_uri: String,
    /// Which subscription feed this came from, if ingestion tagged it.
    /// Optional: the core never needs it, export/reporting may.
    pub source_tag: Option<String>,
    pub measurement: Measurement,
}

impl Descriptor {
    pub fn new(protocol: Protocol, config: DescriptorConfig, raw_uri: impl Into<String>) -> Self {
        Self {
            protocol,
            config,
            raw_uri: raw_uri.into(),
            source_tag: None,
            measurement: Measurement {
                country: Measurement::unknown_country(),
                ..Default::default()
            },
        }
    }

    /// `proto | credential | host:port | sni | path | service` — unique per
    /// logically-distinct endpoint including credential.
    pub fn strict_identity(&self) -> String {
        self.identity(true)
    }

    /// Same as [`Descriptor::strict_identity`] without the credential —
    /// used by ingestion to cap accounts-per-host. The core never computes
    /// this itself; it's exposed for callers that re-implement that cap.
    pub fn machine_identity(&self) -> String {
        self.identity(false)
    }

    fn identity(&self, with_credential: bool) -> String {
        let cred = if with_credential {
            self.config
                .credential
                .as_ref()
                .map(|c| c.secret())
                .unwrap_or("")
        } else {
            ""
        };
        let sni = self
            .config
            .sni
            .as_deref()
            .or(self.config.host.as_deref())
            .unwrap_or("");
        let path = self.config.path.as_deref().unwrap_or("");
        let service = self.config.service_name.as_deref().unwrap_or("");
        format!(
            "{}|{}|{}:{}|{}|{}|{}",
            self.protocol, cred, self.config.server, self.config.port, sni, path, service
        )
    }

    /// Returns a copy annotated with the given measurement. Descriptors
    /// are never mutated in place.
    pub fn with_measurement(&self, measurement: Measurement) -> Descriptor {
        let mut copy = self.clone();
        copy.measurement = measurement;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DescriptorConfig {
        DescriptorConfig {
            server: "1.2.3.4".into(),
            port: 443,
            credential: Some(Credential::Uuid("abc-123".into())),
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
        }
    }

    #[test]
    fn strict_identity_includes_credential_machine_identity_does_not() {
        let d = Descriptor::new(Protocol::Vless, base_config(), "vless://...");
        assert!(d.strict_identity().contains("abc-123"));
        assert!(!d.machine_identity().contains("abc-123"));
    }

    #[test]
    fn with_measurement_does_not_mutate_original() {
        let d = Descriptor::new(Protocol::Trojan, base_config(), "trojan://...");
        let m = Measurement {
            latency_ms: 100,
            speed_mbps: 12.5,
            country: "US".into(),
            alive: true,
        };
        let annotated = d.with_measurement(m.clone());
        assert_eq!(d.measurement.latency_ms, 0);
        assert_eq!(annotated.measurement, m);
    }

    #[test]
    fn allow_insecure_is_case_insensitive() {
        let mut cfg = base_config();
        cfg.metadata.insert("AllowInsecure".into(), "TRUE".into());
        assert!(cfg.allow_insecure());
    }
}
