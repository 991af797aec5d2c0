//! CNI exec-contract invocation of the `host-local` IPAM plugin, used by
//! PodManager's ADD/DEL paths (§6).
//!
//! Grounded on `original_source/pkg/ovs/pod_linux.go`'s IPAM invocation
//! (`ipam.ExecAdd`/`ipam.ExecDel` over the containernetworking CNI plugin
//! exec contract — config on stdin, result JSON on stdout, `CNI_COMMAND`/
//! `CNI_CONTAINERID`/`CNI_NETNS`/`CNI_IFNAME`/`CNI_PATH` as env vars), shelled
//! out the same way `ovs.rs` invokes `ovs-vsctl`.

use std::io::Write;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const IPAM_PLUGIN_PATH: &str = "/opt/cni/bin/host-local";

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("failed to spawn IPAM plugin at {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("IPAM plugin exited with {status}: {stderr}")]
    NonZeroExit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to parse IPAM result: {0}")]
    BadResult(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpamResult {
    #[serde(rename = "ip4")]
    pub ip4: Ip4Config,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ip4Config {
    pub ip: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

pub struct IpamRequest<'a> {
    pub command: &'a str,
    pub container_id: &'a str,
    pub netns: &'a str,
    pub if_name: &'a str,
    pub local_subnet: &'a str,
    pub gateway: &'a str,
    pub cluster_network: &'a str,
}

/// Builds the static `host-local` config described in §6 and invokes the
/// plugin binary per the CNI exec contract, returning the parsed result for
/// `ADD`/`CHECK` (empty body for `DEL`).
pub fn invoke(req: &IpamRequest) -> Result<Option<IpamResult>, IpamError> {
    let config = json!({
        "cniVersion": "0.4.0",
        "name": "k8s-ovs",
        "type": "k8s-ovs",
        "ipam": {
            "type": "host-local",
            "subnet": req.local_subnet,
            "routes": [
                {"dst": "0.0.0.0/0", "gw": req.gateway},
                {"dst": req.cluster_network},
            ],
        },
    });

    let mut child = Command::new(IPAM_PLUGIN_PATH)
        .env("CNI_COMMAND", req.command)
        .env("CNI_CONTAINERID", req.container_id)
        .env("CNI_NETNS", req.netns)
        .env("CNI_IFNAME", req.if_name)
        .env("CNI_PATH", "/opt/cni/bin")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| IpamError::Spawn(IPAM_PLUGIN_PATH.to_string(), e))?;

    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(config.to_string().as_bytes())
        .map_err(|e| IpamError::Spawn(IPAM_PLUGIN_PATH.to_string(), e))?;

    let output = child
        .wait_with_output()
        .map_err(|e| IpamError::Spawn(IPAM_PLUGIN_PATH.to_string(), e))?;

    if !output.status.success() {
        return Err(IpamError::NonZeroExit {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    if req.command == "DEL" || output.stdout.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::from_slice(&output.stdout)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_result_shape() {
        let raw = r#"{"ip4":{"ip":"10.1.0.5/24","gateway":"10.1.0.1"}}"#;
        let result: IpamResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.ip4.ip, "10.1.0.5/24");
        assert_eq!(result.ip4.gateway.as_deref(), Some("10.1.0.1"));
    }

    #[test]
    fn gateway_is_optional() {
        let raw = r#"{"ip4":{"ip":"10.1.0.5/24"}}"#;
        let result: IpamResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.ip4.gateway, None);
    }
}
