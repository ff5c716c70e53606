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

//! Batch Config Builder (C3): assembles N descriptors into one runtime
//! configuration with N local SOCKS inbounds and routing rules.

use serde_json::{json, Value};

use crate::compiler::compile_outbound;
use crate::descriptor::Descriptor;

/// Maps an accepted inbound index back to its original position in the
/// input slice, so callers can reconcile fewer-inbounds-than-inputs.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedEntry {
    /// Index into the original input slice.
    pub original_index: usize,
    /// Local SOCKS port assigned to this entry's inbound.
    pub port: u16,
}

/// A compiled batch: the runtime configuration plus the index/port
/// reconciliation table for descriptors the Compiler accepted.
pub struct BatchConfig {
    pub config: Value,
    pub accepted: Vec<AcceptedEntry>,
}

/// Assembles `descriptors` into a single runtime configuration with one
/// SOCKS inbound per accepted descriptor at `127.0.0.1:base_port+i`.
/// Descriptors the Compiler rejects are skipped.
pub fn build_batch_config(descriptors: &[Descriptor], base_port: u16) -> BatchConfig {
    let mut inbounds = Vec::new();
    let mut outbounds = Vec::new();
    let mut rules = vec![json!({"protocol": "dns", "outbound": "direct"})];
    let mut accepted = Vec::new();

    for (i, descriptor) in descriptors.iter().enumerate() {
        let tag = format!("proxy-{i}");
        let Some(outbound) = compile_outbound(descriptor, &tag) else {
            continue;
        };

        let port = base_port + i as u16;
        let in_tag = format!("in-{i}");
        inbounds.push(json!({
            "type": "socks",
            "tag": in_tag,
            "listen": "127.0.0.1",
            "listen_port": port,
        }));
        rules.push(json!({"inbound": [in_tag], "outbound": tag}));
        outbounds.push(outbound);
        accepted.push(AcceptedEntry {
            original_index: i,
            port,
        });
    }

    outbounds.push(json!({"type": "direct", "tag": "direct"}));
    outbounds.push(json!({"type": "block", "tag": "block"}));

    let config = json!({
        "log": {"level": "fatal", "output": "discard"},
        "dns": {
            "servers": [{"tag": "remote", "address": "udp://8.8.8.8", "detour": "direct"}],
            "independent_cache": true,
        },
        "inbounds": inbounds,
        "outbounds": outbounds,
        "route": {
            "rules": rules,
            "final": "block",
            "auto_detect_interface": true,
        },
    });

    BatchConfig { config, accepted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Credential, DescriptorConfig, Protocol, Security, Transport};
    use std::collections::HashMap;

    fn valid_descriptor() -> Descriptor {
        Descriptor::new(
            Protocol::Trojan,
            DescriptorConfig {
                server: "example.com".into(),
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
        )
    }

    fn invalid_descriptor() -> Descriptor {
        let mut d = valid_descriptor();
        d.protocol = Protocol::Vless;
        d.config.credential = Some(Credential::Uuid("not-a-uuid".into()));
        d
    }

    #[test]
    fn rejected_descriptors_leave_fewer_inbounds_than_inputs() {
        let descriptors = vec![invalid_descriptor(), valid_descriptor(), invalid_descriptor()];
        let batch = build_batch_config(&descriptors, 10000);
        assert_eq!(batch.accepted.len(), 1);
        assert_eq!(batch.accepted[0].original_index, 1);
        assert_eq!(batch.accepted[0].port, 10001);
        assert_eq!(batch.config["inbounds"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn all_rejected_yields_no_inbounds() {
        let descriptors = vec![invalid_descriptor(), invalid_descriptor()];
        let batch = build_batch_config(&descriptors, 10000);
        assert!(batch.accepted.is_empty());
        assert!(batch.config["inbounds"].as_array().unwrap().is_empty());
    }

    #[test]
    fn ports_are_sequential_from_base() {
        let descriptors = vec![valid_descriptor(), valid_descriptor(), valid_descriptor()];
        let batch = build_batch_config(&descriptors, 20000);
        let ports: Vec<u16> = batch.accepted.iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![20000, 20001, 20002]);
    }

    #[test]
    fn always_includes_direct_and_block_outbounds() {
        let batch = build_batch_config(&[], 10000);
        let tags: Vec<&str> = batch.config["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["direct", "block"]);
    }
}
