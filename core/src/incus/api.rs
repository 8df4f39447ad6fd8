//! Wire types for the instance-manager REST API.
//!
//! Only the fields the gateway actually reads are modeled; everything else
//! rides along in `serde_json::Value` fields where we may need to echo it
//! back (instance config/devices on PUT).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Standard response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A background operation.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Operation {
    /// Websocket secret for one of the operation's attached streams.
    pub fn websocket_secret(&self, fd: &str) -> Option<String> {
        self.metadata
            .get("fds")
            .and_then(|fds| fds.get(fd))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Exit code reported by a finished exec operation.
    pub fn exit_code(&self) -> Option<i32> {
        self.metadata
            .get("return")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
    }
}

/// Instance snapshot, as returned by `GET /1.0/instances/<name>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub instance_type: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub project: String,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    /// Normalized CPU architecture: `amd64`, `arm64`, or the raw value.
    pub fn arch(&self) -> &str {
        match self.architecture.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        }
    }
}

/// A network address on an instance interface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

/// One network interface of a running instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InstanceNetwork {
    #[serde(default)]
    pub addresses: Vec<InstanceAddress>,
}

/// Runtime state, as returned by `GET /1.0/instances/<name>/state`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub network: HashMap<String, InstanceNetwork>,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    /// Pick the instance's primary IPv4.
    ///
    /// Interfaces are sorted so `e*` names (eth0, enp5s0) come first and
    /// loopback last, making the selection stable across restarts.
    pub fn primary_ipv4(&self) -> Option<String> {
        let mut names: Vec<&String> = self.network.keys().collect();
        names.sort_by_key(|name| {
            let class = if name.starts_with('e') {
                0
            } else if *name == "lo" {
                2
            } else {
                1
            };
            (class, name.to_string())
        });
        for name in names {
            let iface = &self.network[name];
            for addr in &iface.addresses {
                if addr.family == "inet" && addr.scope != "local" {
                    return Some(addr.address.clone());
                }
            }
        }
        None
    }
}

/// Request body for `POST /1.0/instances/<name>/exec`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub interactive: bool,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    #[serde(rename = "record-output")]
    pub record_output: bool,
}

/// Source block for instance creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub alias: String,
}

/// Request body for `POST /1.0/instances`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub ephemeral: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub source: CreateSource,
}

/// Request body for `PUT /1.0/instances/<name>/state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangeRequest {
    pub action: String,
    pub timeout: i64,
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_websocket_secrets() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "id": "op-1",
            "metadata": {"fds": {"0": "s0", "control": "sc"}}
        }))
        .unwrap();
        assert_eq!(op.websocket_secret("0").as_deref(), Some("s0"));
        assert_eq!(op.websocket_secret("control").as_deref(), Some("sc"));
        assert_eq!(op.websocket_secret("1"), None);
    }

    #[test]
    fn operation_exit_code() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "id": "op-1",
            "metadata": {"return": 130}
        }))
        .unwrap();
        assert_eq!(op.exit_code(), Some(130));
    }

    #[test]
    fn arch_normalization() {
        let mut instance: Instance = serde_json::from_value(serde_json::json!({
            "name": "web", "architecture": "x86_64"
        }))
        .unwrap();
        assert_eq!(instance.arch(), "amd64");
        instance.architecture = "aarch64".into();
        assert_eq!(instance.arch(), "arm64");
    }

    #[test]
    fn primary_ipv4_prefers_ethernet_and_skips_loopback() {
        let state: InstanceState = serde_json::from_value(serde_json::json!({
            "status": "Running",
            "network": {
                "lo": {"addresses": [{"family": "inet", "address": "127.0.0.1", "scope": "local"}]},
                "docker0": {"addresses": [{"family": "inet", "address": "172.17.0.1", "scope": "global"}]},
                "eth0": {"addresses": [
                    {"family": "inet6", "address": "fd42::1", "scope": "global"},
                    {"family": "inet", "address": "10.130.4.7", "scope": "global"}
                ]}
            }
        }))
        .unwrap();
        assert_eq!(state.primary_ipv4().as_deref(), Some("10.130.4.7"));
    }

    #[test]
    fn primary_ipv4_none_without_inet() {
        let state: InstanceState = serde_json::from_value(serde_json::json!({
            "status": "Running",
            "network": {"lo": {"addresses": [{"family": "inet", "address": "127.0.0.1", "scope": "local"}]}}
        }))
        .unwrap();
        assert_eq!(state.primary_ipv4(), None);
    }

    #[test]
    fn exec_request_wire_names() {
        let req = ExecRequest {
            command: vec!["/bin/sh".into()],
            environment: HashMap::new(),
            interactive: true,
            width: 80,
            height: 24,
            user: Some(0),
            group: Some(0),
            cwd: None,
            wait_for_websocket: true,
            record_output: false,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["wait-for-websocket"], true);
        assert_eq!(value["record-output"], false);
        assert!(value.get("cwd").is_none());
    }
}
