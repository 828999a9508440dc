//! Bus Rescan Engine
//!
//! Makes a freshly exported LUN visible on the host and resolves it to a
//! single block device path. Each connectivity transport provides a
//! [`DeviceRescanner`]; the [`TransportRegistry`] picks one by the
//! transport name found in the publish context.
//!
//! ```ignore
//! let rescanner = registry.select(&info.transport)?;
//! rescanner.rescan_lun(info.lun, &info.target).await?;
//! let device = rescanner
//!     .resolve_device_path(info.lun, &info.target, policy)
//!     .await?;
//! ```

mod iscsi;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::sysfs::{HostInspector, glob_dir};
use crate::types::{PollPolicy, Transport, TransportParseError};

pub use iscsi::IscsiRescanner;

/// Prefix of device-mapper (multipath map) block devices.
pub const MULTIPATH_DEVICE_PREFIX: &str = "dm-";

#[tonic::async_trait]
pub trait DeviceRescanner: Send + Sync {
    fn transport(&self) -> Transport;

    /// Ask every SCSI host with a session to `target` to scan for `lun`.
    async fn rescan_lun(&self, lun: u32, target: &str) -> Result<()>;

    /// Wait for the LUN's device node and return its multipath-aware path.
    async fn resolve_device_path(&self, lun: u32, target: &str, policy: PollPolicy)
    -> Result<String>;
}

type RescannerFactory = Box<dyn Fn() -> Arc<dyn DeviceRescanner> + Send + Sync>;

/// Rescanner constructors keyed by transport.
#[derive(Default)]
pub struct TransportRegistry {
    factories: HashMap<Transport, RescannerFactory>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every transport this node implements, wired to the
    /// host paths in `config`.
    pub fn with_host_defaults(inspector: Arc<dyn HostInspector>, config: &NodeConfig) -> Self {
        let mut registry = Self::new();
        let config = config.clone();
        registry.register(Transport::Iscsi, move || {
            Arc::new(IscsiRescanner::new(inspector.clone(), &config))
        });
        registry
    }

    /// Register (or replace) the constructor for `transport`.
    pub fn register<F>(&mut self, transport: Transport, factory: F)
    where
        F: Fn() -> Arc<dyn DeviceRescanner> + Send + Sync + 'static,
    {
        self.factories.insert(transport, Box::new(factory));
    }

    /// Build the rescanner for a transport name taken from a publish
    /// context. Unknown or unregistered transports are an error.
    pub fn select(&self, transport: &str) -> Result<Arc<dyn DeviceRescanner>> {
        debug!(transport = %transport, "Selecting rescanner");
        let parsed: Transport = transport.parse()?;
        let factory = self
            .factories
            .get(&parsed)
            .ok_or_else(|| NodeError::UnsupportedTransport(TransportParseError(transport.into())))?;
        Ok(factory())
    }
}

/// Run `probe` up to `policy.max_attempts` times, sleeping
/// `policy.interval` between attempts, until it yields at least one path.
///
/// Probe errors count as "nothing found yet". The deadline, if any, is
/// checked before every attempt.
pub async fn poll_for_matches<F>(
    description: &str,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<Vec<PathBuf>>
where
    F: FnMut() -> Result<Vec<PathBuf>>,
{
    for attempt in 1..=policy.max_attempts {
        if policy.deadline_passed() {
            return Err(NodeError::DeadlineExceeded(format!(
                "waiting for {}",
                description
            )));
        }

        match probe() {
            Ok(matches) if !matches.is_empty() => {
                debug!(attempt, matches = ?matches, "Device path found");
                return Ok(matches);
            }
            Ok(_) => debug!(attempt, pattern = %description, "No device path yet"),
            Err(e) => debug!(attempt, error = %e, "Device path probe failed"),
        }

        if attempt < policy.max_attempts {
            // Never sleep past the deadline
            let pause = match policy.deadline {
                Some(deadline) => policy
                    .interval
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => policy.interval,
            };
            sleep(pause).await;
        }
    }

    Err(NodeError::PathNotFound(description.to_string()))
}

/// Map a raw by-path symlink to the multipath device that owns it.
///
/// Returns the link itself when it already points at a `dm-*` device,
/// the `/dev/dm-N` path whose `slaves` include the link's device, or
/// `None` when the device is not part of any multipath map.
pub fn resolve_multipath(
    raw_path: &Path,
    sys_block_dir: &Path,
    dev_dir: &Path,
) -> Result<Option<PathBuf>> {
    let link_target = std::fs::read_link(raw_path)
        .map_err(|e| NodeError::io(raw_path.display().to_string(), e))?;
    let Some(device_name) = link_target.file_name().map(|n| n.to_string_lossy().to_string())
    else {
        return Ok(None);
    };

    if device_name.starts_with(MULTIPATH_DEVICE_PREFIX) {
        debug!(device = %device_name, "Already a multipath device");
        return Ok(Some(raw_path.to_path_buf()));
    }

    for dm_path in glob_dir(sys_block_dir, "dm-*")? {
        let slaves = match glob_dir(&dm_path.join("slaves"), "*") {
            Ok(slaves) => slaves,
            Err(e) => {
                warn!(path = %dm_path.display(), error = %e, "Cannot list multipath slaves");
                continue;
            }
        };
        let owns_device = slaves
            .iter()
            .any(|s| s.file_name().is_some_and(|n| n.to_string_lossy() == device_name));
        if owns_device
            && let Some(dm_name) = dm_path.file_name()
        {
            let mapped = dev_dir.join(dm_name);
            info!(
                device = %device_name,
                multipath = %mapped.display(),
                "Found multipath device for path"
            );
            return Ok(Some(mapped));
        }
    }

    debug!(
        path = %raw_path.display(),
        device = %device_name,
        "No multipath device owns path"
    );
    Ok(None)
}

/// First raw path that resolves to a multipath device, in glob order.
/// Falls back to the first raw path when none does (single-path hosts).
pub fn pick_device(raw_paths: &[PathBuf], sys_block_dir: &Path, dev_dir: &Path) -> Option<PathBuf> {
    for raw in raw_paths {
        match resolve_multipath(raw, sys_block_dir, dev_dir) {
            Ok(Some(mapped)) => return Some(mapped),
            Ok(None) => {}
            Err(e) => warn!(path = %raw.display(), error = %e, "Multipath resolution failed"),
        }
    }

    let fallback = raw_paths.first().cloned();
    if let Some(path) = &fallback {
        info!(path = %path.display(), "No multipath device found, using raw path");
    }
    fallback
}
