//! Read-only view of host iSCSI and SCSI state.
//!
//! Nothing here is cached: the kernel renumbers SCSI hosts and iSCSI
//! sessions across reconnects, so every call walks sysfs again.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{NodeConfig, PublishContextKeys};
use crate::error::{NodeError, Result};
use crate::types::PublishInfo;

/// Delimiter key in the open-iscsi initiator name file.
pub const INITIATOR_NAME_KEY: &str = "InitiatorName=";

/// Host inspection capability used by the rescan engine and NodeGetInfo.
pub trait HostInspector: Send + Sync {
    /// Initiator IQN read from the initiator name file at `path`.
    fn parse_initiator_identity(&self, path: &Path) -> Result<String>;

    /// SCSI host numbers holding a live iSCSI session with `target`.
    fn session_hosts_for_target(&self, target: &str) -> Result<BTreeSet<u32>>;
}

/// [`HostInspector`] backed by the real sysfs tree (or a copy of its
/// layout rooted elsewhere).
#[derive(Debug, Clone)]
pub struct SysfsInspector {
    iscsi_host_dir: PathBuf,
}

impl SysfsInspector {
    pub fn new(iscsi_host_dir: impl Into<PathBuf>) -> Self {
        Self {
            iscsi_host_dir: iscsi_host_dir.into(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.iscsi_host_dir.clone())
    }

    /// Target names advertised by every session under one host directory.
    ///
    /// Layout: `<host>/device/session*/iscsi_session/session*/targetname`.
    fn session_target_names(host_dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for session in glob_dir(&host_dir.join("device"), "session*")? {
            let inner_sessions = match glob_dir(&session.join("iscsi_session"), "session*") {
                Ok(inner) => inner,
                Err(e) => {
                    warn!(session = %session.display(), error = %e, "Skipping unreadable session");
                    continue;
                }
            };
            for inner in inner_sessions {
                let target_name_path = inner.join("targetname");
                match fs::read_to_string(&target_name_path) {
                    Ok(name) => names.push(name.trim().to_string()),
                    Err(e) => debug!(
                        path = %target_name_path.display(),
                        error = %e,
                        "Could not read targetname"
                    ),
                }
            }
        }
        Ok(names)
    }
}

impl HostInspector for SysfsInspector {
    fn parse_initiator_identity(&self, path: &Path) -> Result<String> {
        parse_initiator_identity(path)
    }

    fn session_hosts_for_target(&self, target: &str) -> Result<BTreeSet<u32>> {
        let entries = fs::read_dir(&self.iscsi_host_dir).map_err(|e| {
            warn!(
                path = %self.iscsi_host_dir.display(),
                error = %e,
                "Cannot read iSCSI host directory"
            );
            NodeError::io(self.iscsi_host_dir.display().to_string(), e)
        })?;

        let mut hosts = BTreeSet::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable iSCSI host entry");
                    continue;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(host_number) = parse_host_number(&name) else {
                debug!(entry = %name, "Skipping non-host entry");
                continue;
            };

            let target_names = match Self::session_target_names(&entry.path()) {
                Ok(names) => names,
                Err(e) => {
                    warn!(host = %name, error = %e, "Skipping host with unreadable sessions");
                    continue;
                }
            };
            if target_names.is_empty() {
                debug!(host = %name, "No session target name found for host");
                continue;
            }

            if target_names.iter().any(|t| t == target) {
                debug!(host_number, target = %target, "Found iSCSI session host");
                hosts.insert(host_number);
            }
        }

        Ok(hosts)
    }
}

/// `host34` -> `Some(34)`.
fn parse_host_number(name: &str) -> Option<u32> {
    name.strip_prefix("host")?.parse().ok()
}

/// Read the initiator IQN from an open-iscsi `initiatorname.iscsi` file.
///
/// The file must contain the `InitiatorName=` key exactly once.
pub fn parse_initiator_identity(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).map_err(|e| NodeError::io(path.display().to_string(), e))?;

    let parts: Vec<&str> = contents.split(INITIATOR_NAME_KEY).collect();
    if parts.len() != 2 {
        return Err(NodeError::Format {
            path: path.display().to_string(),
            reason: format!(
                "expected exactly one '{}' entry, found {}",
                INITIATOR_NAME_KEY,
                parts.len() - 1
            ),
        });
    }

    Ok(parts[1].trim().to_string())
}

/// Pull transport, LUN and target out of the publish context using the
/// key names from the driver config.
pub fn extract_publish_info(
    publish_context: &HashMap<String, String>,
    keys: &PublishContextKeys,
) -> Result<PublishInfo> {
    let lookup = |key: &str| {
        publish_context
            .get(key)
            .cloned()
            .ok_or_else(|| NodeError::PublishContext(format!("missing key '{}'", key)))
    };

    let raw_lun = lookup(&keys.publish_context_lun_parameter)?;
    let lun = raw_lun.parse::<u32>().map_err(|e| {
        NodeError::PublishContext(format!(
            "LUN '{}' is not a valid non-negative integer: {}",
            raw_lun, e
        ))
    })?;

    Ok(PublishInfo {
        transport: lookup(&keys.publish_context_connectivity_parameter)?,
        lun,
        target: lookup(&keys.publish_context_array_iqn)?,
    })
}

/// Match entries of `dir` against a shell-style `pattern` (`*` and `?`).
///
/// Results are sorted by name. A missing directory yields no matches.
pub fn glob_dir(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = wildcard_regex(pattern)?;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NodeError::io(dir.display().to_string(), e)),
    };

    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| matcher.is_match(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    Ok(matches)
}

fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| NodeError::Format {
        path: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys() -> PublishContextKeys {
        PublishContextKeys {
            publish_context_lun_parameter: "PUBLISH_CONTEXT_LUN".into(),
            publish_context_connectivity_parameter: "PUBLISH_CONTEXT_CONNECTIVITY".into(),
            publish_context_array_iqn: "PUBLISH_CONTEXT_ARRAY_IQN".into(),
        }
    }

    fn context(lun: &str) -> HashMap<String, String> {
        HashMap::from([
            ("PUBLISH_CONTEXT_LUN".to_string(), lun.to_string()),
            ("PUBLISH_CONTEXT_CONNECTIVITY".to_string(), "iscsi".to_string()),
            (
                "PUBLISH_CONTEXT_ARRAY_IQN".to_string(),
                "iqn.1986-03.com.ibm:array".to_string(),
            ),
        ])
    }

    fn add_session(root: &Path, host: &str, session: &str, target: &str) {
        let dir = root
            .join(host)
            .join("device")
            .join(session)
            .join("iscsi_session")
            .join(session);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("targetname"), format!("{}\n", target)).unwrap();
    }

    fn sysfs_tree() -> TempDir {
        let root = TempDir::new().unwrap();
        add_session(root.path(), "host3", "session1", "iqn.A");
        add_session(root.path(), "host7", "session2", "iqn.B");
        // Malformed and foreign entries must be skipped.
        fs::create_dir_all(root.path().join("hostX/device")).unwrap();
        fs::create_dir_all(root.path().join("host9/device/session5")).unwrap();
        fs::create_dir_all(root.path().join("power")).unwrap();
        fs::write(root.path().join("uevent"), "").unwrap();
        root
    }

    #[test]
    fn test_session_hosts_for_target() {
        let root = sysfs_tree();
        let inspector = SysfsInspector::new(root.path());

        let hosts = inspector.session_hosts_for_target("iqn.A").unwrap();
        assert_eq!(hosts, BTreeSet::from([3]));

        let hosts = inspector.session_hosts_for_target("iqn.B").unwrap();
        assert_eq!(hosts, BTreeSet::from([7]));
    }

    #[test]
    fn test_session_hosts_no_match_is_empty() {
        let root = sysfs_tree();
        let inspector = SysfsInspector::new(root.path());
        let hosts = inspector.session_hosts_for_target("iqn.C").unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_session_hosts_any_session_matches() {
        let root = sysfs_tree();
        add_session(root.path(), "host5", "session8", "iqn.B");
        add_session(root.path(), "host5", "session9", "iqn.A");
        let inspector = SysfsInspector::new(root.path());
        let hosts = inspector.session_hosts_for_target("iqn.A").unwrap();
        assert_eq!(hosts, BTreeSet::from([3, 5]));
    }

    #[test]
    fn test_session_hosts_unreadable_session_skipped() {
        let root = sysfs_tree();
        // session3 has a file where the iscsi_session directory belongs
        let broken = root.path().join("host5/device/session3");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("iscsi_session"), "").unwrap();
        add_session(root.path(), "host5", "session4", "iqn.A");

        let inspector = SysfsInspector::new(root.path());
        let hosts = inspector.session_hosts_for_target("iqn.A").unwrap();
        assert_eq!(hosts, BTreeSet::from([3, 5]));
    }

    #[test]
    fn test_session_hosts_unreadable_root_is_error() {
        let root = TempDir::new().unwrap();
        let inspector = SysfsInspector::new(root.path().join("missing"));
        let err = inspector.session_hosts_for_target("iqn.A").unwrap_err();
        assert!(matches!(err, NodeError::Io { .. }));
    }

    #[test]
    fn test_parse_host_number() {
        assert_eq!(parse_host_number("host34"), Some(34));
        assert_eq!(parse_host_number("host"), None);
        assert_eq!(parse_host_number("hostX"), None);
        assert_eq!(parse_host_number("session3"), None);
    }

    #[test]
    fn test_parse_initiator_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("initiatorname.iscsi");
        fs::write(&path, "InitiatorName=iqn.1994-05.foo:node1\n").unwrap();
        assert_eq!(
            parse_initiator_identity(&path).unwrap(),
            "iqn.1994-05.foo:node1"
        );
    }

    #[test]
    fn test_parse_initiator_identity_bad_shape() {
        let dir = TempDir::new().unwrap();

        let none = dir.path().join("none");
        fs::write(&none, "## no initiator here\n").unwrap();
        assert!(matches!(
            parse_initiator_identity(&none),
            Err(NodeError::Format { .. })
        ));

        let twice = dir.path().join("twice");
        fs::write(&twice, "InitiatorName=iqn.a\nInitiatorName=iqn.b\n").unwrap();
        assert!(matches!(
            parse_initiator_identity(&twice),
            Err(NodeError::Format { .. })
        ));

        assert!(matches!(
            parse_initiator_identity(&dir.path().join("missing")),
            Err(NodeError::Io { .. })
        ));
    }

    #[test]
    fn test_extract_publish_info() {
        let info = extract_publish_info(&context("12"), &keys()).unwrap();
        assert_eq!(info.lun, 12);
        assert_eq!(info.transport, "iscsi");
        assert_eq!(info.target, "iqn.1986-03.com.ibm:array");
    }

    #[test]
    fn test_extract_publish_info_bad_lun() {
        for lun in ["abc", "-1", "", "1.5"] {
            let err = extract_publish_info(&context(lun), &keys()).unwrap_err();
            assert!(matches!(err, NodeError::PublishContext(_)), "lun {:?}", lun);
        }
    }

    #[test]
    fn test_extract_publish_info_missing_key() {
        let mut ctx = context("0");
        ctx.remove("PUBLISH_CONTEXT_ARRAY_IQN");
        let err = extract_publish_info(&ctx, &keys()).unwrap_err();
        assert!(err.to_string().contains("PUBLISH_CONTEXT_ARRAY_IQN"));
    }

    #[test]
    fn test_glob_dir() {
        let dir = TempDir::new().unwrap();
        for name in ["dm-0", "dm-10", "dm-2", "sda", "loop0"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let names: Vec<String> = glob_dir(dir.path(), "dm-*")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["dm-0", "dm-10", "dm-2"]);

        assert_eq!(glob_dir(dir.path(), "sd?").unwrap().len(), 1);
        assert!(glob_dir(&dir.path().join("missing"), "*").unwrap().is_empty());
    }

    #[test]
    fn test_glob_dir_escapes_literals() {
        let dir = TempDir::new().unwrap();
        let name = "ip-10.0.0.1:3260-iscsi-iqn.1986-03.com.ibm:2145.a+b-lun-1";
        fs::write(dir.path().join(name), "").unwrap();
        fs::write(dir.path().join("ip-10.0.0.1:3260-iscsi-iqnX1986-lun-1"), "").unwrap();

        let matches = glob_dir(dir.path(), "ip*-iscsi-iqn.1986-03.com.ibm:2145.a+b-lun-1").unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].ends_with(name));
    }
}
