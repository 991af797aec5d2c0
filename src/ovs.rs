//! OVS CLI transaction layer (component O).
//!
//! Grounded on `original_source/ksdn/controller.go`'s `otx`/`itx` transaction
//! batching (batches `ovs-vsctl`/`ovs-ofctl` sub-commands and runs them as one
//! process invocation so a batch either fully lands or nothing does); no OVS
//! client crate exists in the surveyed ecosystem (DESIGN.md), so this shells
//! out via `std::process::Command`, the same idiom the teacher's
//! `upgrade.rs`/`status.rs` use for external processes.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OvsError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{cmd} exited with {status}: {stderr}")]
    NonZeroExit {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A batch of `ovs-vsctl` sub-commands, committed as a single `--` chained
/// invocation so partial application never happens.
#[derive(Default)]
pub struct VsctlTxn {
    bridge: String,
    ops: Vec<Vec<String>>,
}

impl VsctlTxn {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            ops: Vec::new(),
        }
    }

    pub fn ensure_bridge(&mut self, fail_mode: &str, protocols: &str) -> &mut Self {
        self.ops.push(vec![
            "--may-exist".into(),
            "add-br".into(),
            self.bridge.clone(),
        ]);
        self.ops.push(vec![
            "set".into(),
            "bridge".into(),
            self.bridge.clone(),
            format!("fail_mode={fail_mode}"),
            format!("protocols={protocols}"),
        ]);
        self
    }

    pub fn add_port(&mut self, name: &str, kind: &str, options: &[(&str, &str)]) -> &mut Self {
        self.ops.push(vec![
            "--may-exist".into(),
            "add-port".into(),
            self.bridge.clone(),
            name.into(),
        ]);
        if !kind.is_empty() {
            self.ops
                .push(vec!["set".into(), "interface".into(), name.into(), format!("type={kind}")]);
        }
        for (k, v) in options {
            self.ops.push(vec![
                "set".into(),
                "interface".into(),
                name.into(),
                format!("options:{k}={v}"),
            ]);
        }
        self
    }

    pub fn del_port(&mut self, name: &str) -> &mut Self {
        self.ops
            .push(vec!["--if-exists".into(), "del-port".into(), self.bridge.clone(), name.into()]);
        self
    }

    pub fn commit(&mut self) -> Result<String, OvsError> {
        if self.ops.is_empty() {
            return Ok(String::new());
        }
        let mut args = Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                args.push("--".to_string());
            }
            args.extend(op.iter().cloned());
        }
        self.ops.clear();
        run("ovs-vsctl", &args)
    }
}

/// A batch of `ovs-ofctl` flow mutations for one bridge, committed together.
#[derive(Default)]
pub struct FlowTxn {
    bridge: String,
    adds: Vec<String>,
    dels: Vec<String>,
}

impl FlowTxn {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            adds: Vec::new(),
            dels: Vec::new(),
        }
    }

    pub fn add_flow(&mut self, flow: impl Into<String>) -> &mut Self {
        self.adds.push(flow.into());
        self
    }

    pub fn del_flows(&mut self, flow_match: impl Into<String>) -> &mut Self {
        self.dels.push(flow_match.into());
        self
    }

    /// Runs the accumulated deletions, then the accumulated additions, as
    /// two `ovs-ofctl` invocations (OpenFlow has no combined add/del verb);
    /// deletions first so a re-add of a changed rule never transiently
    /// matches both the old and new flow.
    pub fn commit(&mut self) -> Result<(), OvsError> {
        for m in self.dels.drain(..) {
            run("ovs-ofctl", &["-O".into(), "OpenFlow13".into(), "del-flows".into(), self.bridge.clone(), m])?;
        }
        if !self.adds.is_empty() {
            let flows = self.adds.join("\n");
            run_with_stdin(
                "ovs-ofctl",
                &["-O".into(), "OpenFlow13".into(), "add-flows".into(), self.bridge.clone(), "-".into()],
                &flows,
            )?;
            self.adds.clear();
        }
        Ok(())
    }
}

fn run(cmd: &str, args: &[String]) -> Result<String, OvsError> {
    debug!("{cmd} {}", args.join(" "));
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| OvsError::Spawn(cmd.to_string(), e))?;
    if !output.status.success() {
        return Err(OvsError::NonZeroExit {
            cmd: format!("{cmd} {}", args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_with_stdin(cmd: &str, args: &[String], stdin: &str) -> Result<String, OvsError> {
    use std::io::Write;
    use std::process::Stdio;

    debug!("{cmd} {} <<flows>>", args.join(" "));
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OvsError::Spawn(cmd.to_string(), e))?;

    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(stdin.as_bytes())
        .map_err(|e| OvsError::Spawn(cmd.to_string(), e))?;

    let output = child
        .wait_with_output()
        .map_err(|e| OvsError::Spawn(cmd.to_string(), e))?;
    if !output.status.success() {
        return Err(OvsError::NonZeroExit {
            cmd: format!("{cmd} {}", args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Two-hex-byte `note:` action encoding read/written by the table=253
/// sentinel (§6): byte 0 is the plugin kind, byte 1 the pipeline version.
pub fn sentinel_note(multi_tenant: bool, version: u8) -> String {
    format!("{:02x}.{:02x}", multi_tenant as u8, version)
}

pub fn parse_sentinel_note(note: &str) -> Option<(bool, u8)> {
    let (kind, version) = note.split_once('.')?;
    let kind = u8::from_str_radix(kind, 16).ok()?;
    let version = u8::from_str_radix(version, 16).ok()?;
    Some((kind != 0, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_round_trips() {
        let note = sentinel_note(true, 2);
        assert_eq!(note, "01.02");
        assert_eq!(parse_sentinel_note(&note), Some((true, 2)));
    }

    #[test]
    fn single_tenant_sentinel() {
        assert_eq!(sentinel_note(false, 1), "00.01");
        assert_eq!(parse_sentinel_note("00.01"), Some((false, 1)));
    }

    #[test]
    fn malformed_note_does_not_parse() {
        assert_eq!(parse_sentinel_note("garbage"), None);
    }

    #[test]
    fn empty_flow_txn_commit_is_a_noop() {
        let mut t = VsctlTxn::new("br0");
        assert_eq!(t.commit().unwrap(), "");
    }
}
