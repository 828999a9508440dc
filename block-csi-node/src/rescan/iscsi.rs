//! iSCSI rescanner
//!
//! Rescans go through `/sys/class/scsi_host/host<N>/scan`, one write per
//! SCSI host that has a session with the array. Devices are then found
//! through the stable `/dev/disk/by-path/ip-<portal>-iscsi-<iqn>-lun-<lun>`
//! links udev creates.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::{DeviceRescanner, pick_device, poll_for_matches};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::metrics;
use crate::sysfs::{HostInspector, glob_dir};
use crate::types::{PollPolicy, Transport};

pub struct IscsiRescanner {
    inspector: Arc<dyn HostInspector>,
    scsi_host_dir: PathBuf,
    by_path_dir: PathBuf,
    sys_block_dir: PathBuf,
    dev_dir: PathBuf,
}

impl IscsiRescanner {
    pub fn new(inspector: Arc<dyn HostInspector>, config: &NodeConfig) -> Self {
        Self {
            inspector,
            scsi_host_dir: config.scsi_host_dir.clone(),
            by_path_dir: config.by_path_dir.clone(),
            sys_block_dir: config.sys_block_dir.clone(),
            dev_dir: config.dev_dir.clone(),
        }
    }

    fn scan_file(&self, host_number: u32) -> PathBuf {
        self.scsi_host_dir
            .join(format!("host{}", host_number))
            .join("scan")
    }

    /// Wildcard for the by-path links of one LUN, any portal.
    fn by_path_pattern(lun: u32, target: &str) -> String {
        format!(
            "ip*-{}-{}-lun-{}",
            Transport::Iscsi.by_path_token(),
            target,
            lun
        )
    }

    /// Write `"0 0 <lun>"` (channel, id, lun) to a host's scan file.
    fn trigger_scan(&self, host_number: u32, lun: u32) -> Result<()> {
        let path = self.scan_file(host_number);
        let path_str = path.display().to_string();

        let mut file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            error!(path = %path_str, error = %e, "Could not open scan file");
            NodeError::io(path_str.clone(), e)
        })?;

        let scan_cmd = format!("0 0 {}", lun);
        let written = file.write(scan_cmd.as_bytes()).map_err(|e| {
            error!(path = %path_str, error = %e, "Could not write to scan file");
            NodeError::io(path_str.clone(), e)
        })?;
        if written == 0 {
            error!(path = %path_str, "Nothing was written to scan file");
            return Err(NodeError::NothingWritten(path_str));
        }

        metrics::record_rescan_write(Transport::Iscsi.by_path_token());
        debug!(path = %path_str, scan_cmd = %scan_cmd, "Invoked single-LUN rescan");
        Ok(())
    }
}

#[tonic::async_trait]
impl DeviceRescanner for IscsiRescanner {
    fn transport(&self) -> Transport {
        Transport::Iscsi
    }

    async fn rescan_lun(&self, lun: u32, target: &str) -> Result<()> {
        info!(lun, target = %target, "Rescanning LUN");
        let hosts = self.inspector.session_hosts_for_target(target)?;
        if hosts.is_empty() {
            info!(target = %target, "No iSCSI session hosts for target, skipping rescan");
            return Ok(());
        }

        for host_number in hosts {
            self.trigger_scan(host_number, lun)?;
        }

        debug!(lun, target = %target, "Finished LUN rescan");
        Ok(())
    }

    async fn resolve_device_path(
        &self,
        lun: u32,
        target: &str,
        policy: PollPolicy,
    ) -> Result<String> {
        let pattern = Self::by_path_pattern(lun, target);
        let description = self.by_path_dir.join(&pattern).display().to_string();
        debug!(pattern = %description, "Waiting for device path");

        let raw_paths = poll_for_matches(&description, &policy, || {
            metrics::record_device_poll(Transport::Iscsi.by_path_token());
            glob_dir(&self.by_path_dir, &pattern)
        })
        .await?;

        let device = pick_device(&raw_paths, &self.sys_block_dir, &self.dev_dir)
            .ok_or_else(|| NodeError::PathNotFound(description.clone()))?;

        let device = device.display().to_string();
        info!(lun, target = %target, device = %device, "Discovered device");
        Ok(device)
    }
}
