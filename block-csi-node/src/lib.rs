//! Block CSI Node Plugin Library
//!
//! Node half of a Kubernetes CSI driver for SAN block storage reached over
//! iSCSI. Given a publish context from the controller it rescans the SCSI
//! bus, waits for the LUN's device node (preferring its multipath map),
//! and formats and mounts it at the staging path.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - Host inspection through sysfs and the initiator name file
//! - Per-transport bus rescanning and device resolution
//! - Mount operations through the host's mount tooling

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod rescan;
pub mod sysfs;
pub mod types;
pub mod volume_lock;

pub use config::DriverConfig;
pub use error::{NodeError, Result};
pub use identity::IdentityService;
pub use node::NodeService;
