//! Type-safe wrappers for values the node plugin exchanges with the
//! controller and the host.
//!
//! Transport identifiers arrive as free-form strings in the publish
//! context; [`Transport`] implements `FromStr` so they are parsed once at
//! the point where a rescanner is selected.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::csi;

// ============================================================================
// Transport
// ============================================================================

/// Connectivity transport between the node and the storage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// iSCSI over TCP
    Iscsi,
}

impl Transport {
    /// Token used in `/dev/disk/by-path` link names for this transport.
    pub const fn by_path_token(self) -> &'static str {
        match self {
            Transport::Iscsi => "iscsi",
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl FromStr for Transport {
    type Err = TransportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iscsi" => Ok(Transport::Iscsi),
            _ => Err(TransportParseError(s.to_string())),
        }
    }
}

/// Error returned when the publish context names a transport the node
/// has no rescanner for.
#[derive(Debug, Clone)]
pub struct TransportParseError(pub(crate) String);

impl Display for TransportParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unsupported connectivity type '{}': expected 'iscsi'",
            self.0
        )
    }
}

impl std::error::Error for TransportParseError {}

// ============================================================================
// PublishInfo
// ============================================================================

/// Attachment details the controller hands to the node in the publish
/// context. The transport and target are kept as raw strings; only the
/// LUN is interpreted at extraction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishInfo {
    pub transport: String,
    pub lun: u32,
    pub target: String,
}

// ============================================================================
// PollPolicy
// ============================================================================

/// Default number of glob attempts while waiting for a device node.
pub const DEFAULT_DEVICE_POLL_ATTEMPTS: u32 = 5;
/// Default fixed sleep between glob attempts.
pub const DEFAULT_DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed-interval poll used while the kernel materializes a device after a
/// rescan. No backoff: a fixed number of attempts separated by a fixed
/// sleep, optionally cut short by a caller deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub deadline: Option<Instant>,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            deadline: None,
        }
    }

    /// Same policy, bounded by `deadline` when one is given.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_POLL_ATTEMPTS, DEFAULT_DEVICE_POLL_INTERVAL)
    }
}

// ============================================================================
// Node identity and static capabilities
// ============================================================================

/// Separator between hostname and initiator IQN in the reported node id.
pub const NODE_ID_DELIMITER: &str = ";";

/// Compose the node id reported to the control plane.
pub fn node_id(hostname: &str, initiator_iqn: &str) -> String {
    format!("{}{}{}", hostname, NODE_ID_DELIMITER, initiator_iqn)
}

/// Access modes this node can stage and publish.
pub const SUPPORTED_ACCESS_MODES: &[csi::volume_capability::access_mode::Mode] =
    &[csi::volume_capability::access_mode::Mode::SingleNodeWriter];

/// Node RPC capabilities advertised through NodeGetCapabilities.
pub const NODE_CAPABILITIES: &[csi::node_service_capability::rpc::Type] =
    &[csi::node_service_capability::rpc::Type::StageUnstageVolume];

/// Whether the capability's access mode is one this node supports.
pub fn is_supported_access_mode(capability: &csi::VolumeCapability) -> bool {
    let Some(access_mode) = capability.access_mode.as_ref() else {
        return false;
    };
    SUPPORTED_ACCESS_MODES
        .iter()
        .any(|m| *m as i32 == access_mode.mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::volume_capability::access_mode::Mode;

    fn capability(mode: Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: None,
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!("iscsi".parse::<Transport>().unwrap(), Transport::Iscsi);
        assert_eq!("ISCSI".parse::<Transport>().unwrap(), Transport::Iscsi);
        assert!("fc".parse::<Transport>().is_err());
        assert!("".parse::<Transport>().is_err());
    }

    #[test]
    fn test_transport_display_and_token() {
        assert_eq!(Transport::Iscsi.to_string(), "iscsi");
        assert_eq!(Transport::Iscsi.by_path_token(), "iscsi");
    }

    #[test]
    fn test_transport_parse_error_message() {
        let err = "nvme".parse::<Transport>().unwrap_err();
        assert!(err.to_string().contains("nvme"));
    }

    #[test]
    fn test_node_id_composition() {
        assert_eq!(
            node_id("worker-1", "iqn.1994-05.com.redhat:abc"),
            "worker-1;iqn.1994-05.com.redhat:abc"
        );
    }

    #[test]
    fn test_supported_access_modes() {
        assert!(is_supported_access_mode(&capability(Mode::SingleNodeWriter)));
        assert!(!is_supported_access_mode(&capability(Mode::MultiNodeMultiWriter)));
        assert!(!is_supported_access_mode(&capability(Mode::SingleNodeReaderOnly)));

        let no_mode = csi::VolumeCapability {
            access_type: None,
            access_mode: None,
        };
        assert!(!is_supported_access_mode(&no_mode));
    }

    #[test]
    fn test_poll_policy_deadline() {
        let policy = PollPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert!(!policy.deadline_passed());

        let expired = policy.with_deadline(Some(Instant::now()));
        assert!(expired.deadline_passed());

        let later = policy.with_deadline(Some(Instant::now() + Duration::from_secs(60)));
        assert!(!later.deadline_passed());
    }
}
