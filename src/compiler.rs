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

//! Outbound Compiler (C2): `(Descriptor, tag) -> OutboundObject | None`.
//!
//! The only place the external runtime's JSON schema leaks into this
//! crate. Every other component stays protocol-agnostic. Never panics,
//! never returns `Result` — an invariant violation is simply `None`,
//! matching "compile-reject: silently dropped" policy.

use std::net::IpAddr;

use serde_json::{json, Value};

use crate::descriptor::{Credential, Descriptor, Protocol, Security, Transport};

/// TLS fingerprints the external runtime's uTLS layer accepts.
const FINGERPRINT_ALLOWLIST: &[&str] = &[
    "chrome", "firefox", "edge", "safari", "360", "qq", "ios", "android", "random", "randomized",
];

/// AEAD + 2022-blake3 shadowsocks ciphers.
const SHADOWSOCKS_CIPHERS: &[&str] = &[
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

fn is_ip_literal(s: &str) -> bool {
    s.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

fn strip_brackets(s: &str) -> &str {
    s.trim_start_matches('[').trim_end_matches(']')
}

/// SNI resolution precedence: explicit SNI → virtual host (only for
/// non-HTTP-family transports) → server address. IP literals are stripped.
fn resolve_sni(d: &Descriptor, transport: Transport) -> Option<String> {
    let cfg = &d.config;
    let candidate = cfg.sni.clone().or_else(|| {
        if !transport.is_http_family() {
            cfg.host.clone()
        } else {
            None
        }
    });
    let candidate = candidate.or_else(|| Some(cfg.server.clone()));

    candidate.and_then(|raw| {
        let stripped = strip_brackets(&raw);
        if stripped.is_empty() || is_ip_literal(stripped) {
            None
        } else {
            Some(stripped.to_string())
        }
    })
}

/// A Reality-eligible SNI must be domain-shaped: not an IP, at least 4
/// chars, and contain a dot.
fn is_domain_shaped(s: &str) -> bool {
    let s = strip_brackets(s);
    !is_ip_literal(s) && s.len() >= 4 && s.contains('.')
}

fn validate_reality_candidate(d: &Descriptor) -> bool {
    let sni = d
        .config
        .sni
        .as_deref()
        .or(d.config.host.as_deref())
        .unwrap_or("");
    !sni.is_empty() && is_domain_shaped(sni)
}

fn is_valid_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn decode_reality_public_key(pbk: &str) -> Option<Vec<u8>> {
    if pbk.len() < 40 || pbk.len() > 46 {
        return None;
    }
    let padded_len = (pbk.len() + 3) / 4 * 4;
    let mut padded = pbk.to_string();
    padded.push_str(&"=".repeat(padded_len - pbk.len()));
    base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE, padded.as_bytes()).ok()
}

fn transport_layer(cfg: &crate::descriptor::DescriptorConfig, transport: Transport) -> Option<Value> {
    match transport {
        Transport::Tcp => None,
        Transport::Ws => {
            let mut t = json!({"type": "ws", "path": cfg.path.clone().unwrap_or_else(|| "/".into())});
            if let Some(host) = &cfg.host {
                t["headers"] = json!({"Host": host});
            }
            Some(t)
        }
        Transport::Grpc => Some(json!({
            "type": "grpc",
            "service_name": cfg.service_name.clone().or_else(|| cfg.path.clone()).unwrap_or_default(),
        })),
        Transport::HttpUpgrade | Transport::XHttp => {
            let mut t = json!({"type": "httpupgrade", "path": cfg.path.clone().unwrap_or_else(|| "/".into())});
            if let Some(host) = &cfg.host {
                t["host"] = json!(host);
            }
            Some(t)
        }
        Transport::Http | Transport::H2 => {
            let mut t = json!({"type": "http", "path": cfg.path.clone().unwrap_or_else(|| "/".into())});
            if let Some(host) = &cfg.host {
                let hosts: Vec<&str> = host.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
                t["host"] = json!(hosts);
            }
            Some(t)
        }
        Transport::Quic => Some(json!({"type": "quic"})),
    }
}

/// Appends a TLS sub-object when `security` is `tls`, `reality`, or `auto`.
/// Returns `None` to signal compiler rejection.
fn tls_layer(d: &Descriptor) -> Option<Option<Value>> {
    let cfg = &d.config;
    if !matches!(cfg.security, Security::Tls | Security::Reality | Security::Auto) {
        return Some(None);
    }

    if matches!(cfg.security, Security::Reality) && !validate_reality_candidate(d) {
        return None;
    }

    let sni = resolve_sni(d, cfg.transport);
    if sni.is_none() && matches!(cfg.security, Security::Reality) {
        return None;
    }

    let mut tls = json!({"enabled": true});

    match &cfg.fingerprint {
        Some(fp) => {
            let clean = fp.to_ascii_lowercase();
            if FINGERPRINT_ALLOWLIST.contains(&clean.as_str()) {
                tls["utls"] = json!({"enabled": true, "fingerprint": clean});
            }
        }
        None if matches!(cfg.security, Security::Reality) => {
            tls["utls"] = json!({"enabled": true, "fingerprint": "chrome"});
        }
        None => {}
    }

    if !matches!(cfg.security, Security::Reality) && cfg.allow_insecure() {
        tls["insecure"] = json!(true);
    }

    if let Some(sni) = &sni {
        tls["server_name"] = json!(sni);
    }

    match &cfg.alpn {
        Some(alpn) => {
            let list: Vec<&str> = alpn.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            tls["alpn"] = json!(list);
        }
        None if matches!(cfg.security, Security::Reality) => {
            tls["alpn"] = json!(["h2", "http/1.1"]);
        }
        None => {}
    }

    if matches!(cfg.security, Security::Reality) {
        let pbk = cfg.reality_public_key.as_deref().unwrap_or("");
        let decoded = decode_reality_public_key(pbk)?;
        if decoded.len() != 32 {
            return None;
        }
        let mut reality = json!({"enabled": true, "public_key": pbk});
        if let Some(sid) = &cfg.reality_short_id {
            if !is_valid_hex(sid) || sid.len() > 16 || sid.len() % 2 != 0 {
                return None;
            }
            reality["short_id"] = json!(sid);
        }
        tls["reality"] = reality;
    }

    Some(Some(tls))
}

/// Compiles one descriptor into the external runtime's outbound-object
/// schema, or returns `None` on any invariant violation or missing
/// mandatory field.
pub fn compile_outbound(d: &Descriptor, tag: &str) -> Option<Value> {
    let cfg = &d.config;
    let mut base = json!({
        "tag": tag,
        "server": cfg.server,
        "server_port": cfg.port,
    });

    match d.protocol {
        Protocol::Vless => {
            let uuid = match &cfg.credential {
                Some(Credential::Uuid(u)) if uuid::Uuid::parse_str(u).is_ok() => u.clone(),
                _ => return None,
            };
            base["type"] = json!("vless");
            base["uuid"] = json!(uuid);
            base["packet_encoding"] = json!("xudp");
            if let Some(flow) = &cfg.flow {
                base["flow"] = json!(flow);
            }
        }
        Protocol::Vmess => {
            let uuid = match &cfg.credential {
                Some(Credential::Uuid(u)) if uuid::Uuid::parse_str(u).is_ok() => u.clone(),
                _ => return None,
            };
            base["type"] = json!("vmess");
            base["uuid"] = json!(uuid);
            base["security"] = json!("auto");
            base["alter_id"] = json!(cfg.alter_id);
            base["packet_encoding"] = json!("xudp");
        }
        Protocol::Trojan => {
            let password = match &cfg.credential {
                Some(c) if !c.secret().is_empty() => c.secret().to_string(),
                _ => return None,
            };
            base["type"] = json!("trojan");
            base["password"] = json!(password);
        }
        Protocol::Shadowsocks => {
            let (method, password) = match &cfg.credential {
                Some(Credential::MethodPassword { method, password })
                    if !password.is_empty() && SHADOWSOCKS_CIPHERS.contains(&method.to_ascii_lowercase().as_str()) =>
                {
                    (method.to_ascii_lowercase(), password.clone())
                }
                _ => return None,
            };
            base["type"] = json!("shadowsocks");
            base["method"] = json!(method);
            base["password"] = json!(password);
        }
        Protocol::Hysteria2 => {
            let password = match &cfg.credential {
                Some(c) if !c.secret().is_empty() => c.secret().to_string(),
                _ => return None,
            };
            base["type"] = json!("hysteria2");
            base["password"] = json!(password);
            if let (Some(obfs), Some(obfs_password)) = (&cfg.obfs_type, &cfg.obfs_password) {
                base["obfs"] = json!({"type": obfs, "password": obfs_password});
            }
            let sni = resolve_sni(d, Transport::Tcp);
            let mut tls = json!({"enabled": true});
            if cfg.allow_insecure() {
                tls["insecure"] = json!(true);
            }
            if let Some(sni) = sni {
                tls["server_name"] = json!(sni);
            }
            base["tls"] = tls;
            // hysteria2 has no independent transport/TLS layering path.
            return Some(base);
        }
    }

    if let Some(transport) = transport_layer(cfg, cfg.transport) {
        base["transport"] = transport;
    }

    match tls_layer(d)? {
        Some(tls) => base["tls"] = tls,
        None => {}
    }

    Some(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorConfig, Security, Transport};
    use std::collections::HashMap;

    fn cfg(security: Security, transport: Transport) -> DescriptorConfig {
        DescriptorConfig {
            server: "example.com".into(),
            port: 443,
            credential: Some(Credential::Uuid("550e8400-e29b-41d4-a716-446655440000".into())),
            transport,
            security,
            path: None,
            host: None,
            service_name: None,
            sni: Some("example.com".into()),
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
    fn vless_with_invalid_uuid_is_rejected() {
        let mut c = cfg(Security::None, Transport::Tcp);
        c.credential = Some(Credential::Uuid("not-a-uuid".into()));
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        assert!(compile_outbound(&d, "proxy-0").is_none());
    }

    #[test]
    fn vless_preserves_credential_and_tag() {
        let c = cfg(Security::Tls, Transport::Tcp);
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert_eq!(out["type"], "vless");
        assert_eq!(out["uuid"], "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(out["tag"], "proxy-0");
        assert!(out.get("tls").is_some());
    }

    #[test]
    fn tls_only_present_for_tls_security_modes() {
        let c = cfg(Security::None, Transport::Tcp);
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert!(out.get("tls").is_none());
    }

    #[test]
    fn shadowsocks_rejects_unknown_cipher() {
        let mut c = cfg(Security::None, Transport::Tcp);
        c.credential = Some(Credential::MethodPassword {
            method: "rc4-md5".into(),
            password: "hunter2".into(),
        });
        let d = Descriptor::new(Protocol::Shadowsocks, c, "ss://...");
        assert!(compile_outbound(&d, "proxy-0").is_none());
    }

    #[test]
    fn shadowsocks_accepts_allowlisted_cipher() {
        let mut c = cfg(Security::None, Transport::Tcp);
        c.credential = Some(Credential::MethodPassword {
            method: "AES-256-GCM".into(),
            password: "hunter2".into(),
        });
        let d = Descriptor::new(Protocol::Shadowsocks, c, "ss://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert_eq!(out["method"], "aes-256-gcm");
    }

    #[test]
    fn reality_requires_32_byte_public_key() {
        let mut c = cfg(Security::Reality, Transport::Tcp);
        c.reality_public_key = Some("short".into());
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        assert!(compile_outbound(&d, "proxy-0").is_none());
    }

    #[test]
    fn reality_accepts_valid_32_byte_key() {
        let key = [7u8; 32];
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, key);
        let mut c = cfg(Security::Reality, Transport::Tcp);
        c.reality_public_key = Some(encoded);
        c.reality_short_id = Some("ab12".into());
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert_eq!(out["tls"]["reality"]["short_id"], "ab12");
        assert_eq!(out["tls"]["alpn"], json!(["h2", "http/1.1"]));
    }

    #[test]
    fn reality_rejects_ip_only_sni() {
        let key = [7u8; 32];
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, key);
        let mut c = cfg(Security::Reality, Transport::Tcp);
        c.reality_public_key = Some(encoded);
        c.sni = None;
        c.host = None;
        c.server = "1.2.3.4".into();
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        assert!(compile_outbound(&d, "proxy-0").is_none());
    }

    #[test]
    fn fingerprint_outside_allowlist_is_dropped_not_rejected() {
        let mut c = cfg(Security::Tls, Transport::Tcp);
        c.fingerprint = Some("weird-browser".into());
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert!(out["tls"].get("utls").is_none());
    }

    #[test]
    fn auto_security_behaves_like_tls() {
        let c = cfg(Security::Auto, Transport::Tcp);
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let out = compile_outbound(&d, "proxy-0").unwrap();
        assert!(out.get("tls").is_some());
    }

    #[test]
    fn recompiling_is_deterministic() {
        let c = cfg(Security::Tls, Transport::Ws);
        let d = Descriptor::new(Protocol::Vless, c, "vless://...");
        let a = compile_outbound(&d, "proxy-0").unwrap();
        let b = compile_outbound(&d, "proxy-0").unwrap();
        assert_eq!(a, b);
    }
}
