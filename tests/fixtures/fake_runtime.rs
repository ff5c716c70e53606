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

//! Stand-in for the external tunnel runtime's `check`/`run` subcommands,
//! used by integration tests so the Supervisor can be exercised without
//! a real conforming binary.
//!
//! `fake_runtime check -c <path>`: exits 0 iff the file parses as JSON
//! and has a non-empty `inbounds` array, 1 otherwise.
//!
//! `fake_runtime run -c <path>`: binds every declared inbound's
//! `listen_port` on 127.0.0.1 and blocks until killed.

use std::fs;
use std::net::TcpListener;
use std::process::ExitCode;
use std::thread;

fn config_path(args: &[String]) -> Option<String> {
    let idx = args.iter().position(|a| a == "-c")?;
    args.get(idx + 1).cloned()
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let Some(mode) = args.get(1) else {
        return ExitCode::FAILURE;
    };
    let Some(path) = config_path(&args) else {
        return ExitCode::FAILURE;
    };
    let Ok(raw) = fs::read_to_string(&path) else {
        return ExitCode::FAILURE;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return ExitCode::FAILURE;
    };

    let inbounds = value
        .get("inbounds")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    match mode.as_str() {
        "check" => {
            if inbounds.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        "run" => {
            if inbounds.is_empty() {
                return ExitCode::FAILURE;
            }
            let mut listeners = Vec::new();
            for inbound in &inbounds {
                let Some(port) = inbound.get("listen_port").and_then(|p| p.as_u64()) else {
                    continue;
                };
                match TcpListener::bind(("127.0.0.1", port as u16)) {
                    Ok(listener) => listeners.push(listener),
                    Err(_) => return ExitCode::FAILURE,
                }
            }
            for listener in listeners {
                thread::spawn(move || {
                    for stream in listener.incoming() {
                        drop(stream);
                    }
                });
            }
            loop {
                thread::park();
            }
        }
        _ => ExitCode::FAILURE,
    }
}
