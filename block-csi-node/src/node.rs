//! CSI Node Service Implementation
//!
//! Stages remote SCSI LUNs as mounted filesystems and bind mounts them
//! into workloads. Staging rescans the SCSI hosts that hold a session
//! with the array, waits for the LUN's device node, and formats and
//! mounts it unless the mount table shows it is already in place.
//!
//! Host state (sysfs, the SCSI bus, the mount table) is never cached:
//! every call re-reads it through the [`HostInspector`], the rescanners
//! and the [`Mounter`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::csi;
use crate::error::{self, NodeError};
use crate::metrics::{self, OperationTimer};
use crate::mount::{LinuxMounter, MountPoint, Mounter, validate_fs_type};
use crate::rescan::TransportRegistry;
use crate::sysfs::{HostInspector, SysfsInspector, extract_publish_info};
use crate::types::{NODE_CAPABILITIES, is_supported_access_mode, node_id};
use crate::volume_lock::VolumeLocks;

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (rescan, resolve the device, format if needed, mount to staging path)
/// - Volume unstaging (unmount from staging path)
/// - Volume publishing (bind mount from staging to target path)
/// - Volume unpublishing (unmount from target path)
/// - Node identity and capability reporting
pub struct NodeService {
    hostname: String,
    config: Arc<DriverConfig>,
    inspector: Arc<dyn HostInspector>,
    registry: Arc<TransportRegistry>,
    mounter: Arc<dyn Mounter>,
    locks: VolumeLocks,
}

impl NodeService {
    /// Create a NodeService wired to the real host.
    pub fn new(hostname: String, config: Arc<DriverConfig>) -> Self {
        let inspector: Arc<dyn HostInspector> = Arc::new(SysfsInspector::from_config(&config.node));
        let registry = TransportRegistry::with_host_defaults(inspector.clone(), &config.node);
        Self::with_components(
            hostname,
            config,
            inspector,
            Arc::new(registry),
            Arc::new(LinuxMounter::default()),
        )
    }

    /// Create a NodeService from explicit host collaborators.
    pub fn with_components(
        hostname: String,
        config: Arc<DriverConfig>,
        inspector: Arc<dyn HostInspector>,
        registry: Arc<TransportRegistry>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            hostname,
            config,
            inspector,
            registry,
            mounter,
            locks: VolumeLocks::new(),
        }
    }

    /// Validate that a path is safe to hand to mount tooling.
    fn validate_path(path: &str) -> error::Result<()> {
        if path.is_empty() {
            return Err(NodeError::InvalidRequest("Path cannot be empty".into()));
        }

        if !path.starts_with('/') {
            return Err(NodeError::InvalidRequest(format!(
                "Path must be absolute: {}",
                path
            )));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
            return Err(NodeError::InvalidRequest(format!(
                "Path contains dangerous character: '{}'",
                c
            )));
        }

        if path.split('/').any(|component| component == "..") {
            return Err(NodeError::InvalidRequest(
                "Path cannot contain '..' (path traversal)".into(),
            ));
        }

        Ok(())
    }

    /// Check the volume capability and return the filesystem type to use.
    fn validate_capability(capability: Option<&csi::VolumeCapability>) -> error::Result<&'static str> {
        let capability = capability
            .ok_or_else(|| NodeError::InvalidRequest("Volume capability not provided".into()))?;

        if !is_supported_access_mode(capability) {
            return Err(NodeError::InvalidRequest(
                "Volume capability AccessMode not supported".into(),
            ));
        }

        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => {
                validate_fs_type(&mount.fs_type)
            }
            Some(csi::volume_capability::AccessType::Block(_)) => Err(NodeError::InvalidRequest(
                "Volume Access Type Block is not supported yet".into(),
            )),
            None => Err(NodeError::InvalidRequest(
                "Volume access type not provided".into(),
            )),
        }
    }

    fn require(value: &str, what: &str) -> error::Result<()> {
        if value.is_empty() {
            return Err(NodeError::InvalidRequest(format!("{} not provided", what)));
        }
        Ok(())
    }

    /// Deadline for a call: the earlier of the caller's `grpc-timeout`
    /// and the configured stage timeout.
    fn request_deadline(&self, metadata: &MetadataMap) -> Option<Instant> {
        let now = Instant::now();
        // An unrepresentable deadline is treated as no deadline
        let from_caller = grpc_timeout(metadata).and_then(|t| now.checked_add(t));
        let from_config = self
            .config
            .node
            .stage_timeout()
            .and_then(|t| now.checked_add(t));
        match (from_caller, from_config) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Mount table entries whose source is `device`.
    fn mounts_of_device(&self, device: &str) -> error::Result<Vec<MountPoint>> {
        Ok(self
            .mounter
            .list()?
            .into_iter()
            .filter(|m| same_device(&m.device, device))
            .collect())
    }

    fn is_path_mounted(&self, path: &str) -> error::Result<bool> {
        Ok(self
            .mounter
            .list()?
            .iter()
            .any(|m| self.mounter.is_mount_point_match(m, path)))
    }

    async fn stage_volume(
        &self,
        req: &csi::NodeStageVolumeRequest,
        deadline: Option<Instant>,
    ) -> error::Result<()> {
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        Self::require(volume_id, "Volume ID")?;
        Self::require(staging_target_path, "Staging target")?;
        Self::validate_path(staging_target_path)?;
        let fs_type = Self::validate_capability(req.volume_capability.as_ref())?;

        let _guard = self.locks.try_acquire(volume_id)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeStageVolume request"
        );

        let publish = extract_publish_info(&req.publish_context, &self.config.controller)?;
        debug!(
            transport = %publish.transport,
            lun = publish.lun,
            target = %publish.target,
            "Publish context"
        );

        let rescanner = self.registry.select(&publish.transport)?;
        rescanner.rescan_lun(publish.lun, &publish.target).await?;

        let policy = self.config.node.poll_policy().with_deadline(deadline);
        let device = rescanner
            .resolve_device_path(publish.lun, &publish.target, policy)
            .await?;

        let device_mounts = self.mounts_of_device(&device)?;
        if !device_mounts.is_empty() {
            if device_mounts
                .iter()
                .any(|m| self.mounter.is_mount_point_match(m, staging_target_path))
            {
                info!(
                    volume_id = %volume_id,
                    device = %device,
                    staging_target_path = %staging_target_path,
                    "Volume already staged"
                );
                return Ok(());
            }
            metrics::record_conflict("mounted_elsewhere");
            return Err(NodeError::MountedElsewhere {
                device,
                mountpoint: device_mounts[0].path.clone(),
            });
        }

        let occupant = self
            .mounter
            .list()?
            .into_iter()
            .find(|m| self.mounter.is_mount_point_match(m, staging_target_path));
        if let Some(occupant) = occupant {
            metrics::record_conflict("staging_occupied");
            return Err(NodeError::MountedElsewhere {
                device: occupant.device,
                mountpoint: staging_target_path.clone(),
            });
        }
        if !self.mounter.is_likely_not_mount_point(staging_target_path)? {
            // Mountpoint by device number but absent from the mount table
            metrics::record_conflict("staging_occupied");
            return Err(NodeError::MountedElsewhere {
                device: "unlisted device".into(),
                mountpoint: staging_target_path.clone(),
            });
        }

        let mount_flags = match &req.volume_capability {
            Some(csi::VolumeCapability {
                access_type: Some(csi::volume_capability::AccessType::Mount(mount)),
                ..
            }) => mount.mount_flags.clone(),
            _ => Vec::new(),
        };

        self.mounter
            .format_and_mount(&device, staging_target_path, fs_type, &mount_flags)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            device = %device,
            "Volume staged successfully"
        );
        Ok(())
    }

    async fn unstage_volume(&self, req: &csi::NodeUnstageVolumeRequest) -> error::Result<()> {
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        Self::require(volume_id, "Volume ID")?;
        Self::require(staging_target_path, "Staging target")?;
        Self::validate_path(staging_target_path)?;

        let _guard = self.locks.try_acquire(volume_id)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeUnstageVolume request"
        );

        if !self.is_path_mounted(staging_target_path)? {
            info!(staging_target_path = %staging_target_path, "Volume not staged, nothing to do");
            return Ok(());
        }

        self.mounter.unmount(staging_target_path)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "Volume unstaged successfully"
        );
        Ok(())
    }

    async fn publish_volume(&self, req: &csi::NodePublishVolumeRequest) -> error::Result<()> {
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;
        let target_path = &req.target_path;

        Self::require(volume_id, "Volume ID")?;
        Self::require(staging_target_path, "Staging target")?;
        Self::validate_path(staging_target_path)?;
        Self::require(target_path, "Target path")?;
        Self::validate_path(target_path)?;
        Self::validate_capability(req.volume_capability.as_ref())?;

        let _guard = self.locks.try_acquire(volume_id)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            target_path = %target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        if !self.is_path_mounted(staging_target_path)? {
            return Err(NodeError::NotStaged(staging_target_path.clone()));
        }

        if self.is_path_mounted(target_path)? {
            info!(target_path = %target_path, "Volume already published");
            return Ok(());
        }

        self.mounter
            .bind_mount(staging_target_path, target_path, req.readonly)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume published successfully"
        );
        Ok(())
    }

    async fn unpublish_volume(&self, req: &csi::NodeUnpublishVolumeRequest) -> error::Result<()> {
        let volume_id = &req.volume_id;
        let target_path = &req.target_path;

        Self::require(volume_id, "Volume ID")?;
        Self::require(target_path, "Target path")?;
        Self::validate_path(target_path)?;

        let _guard = self.locks.try_acquire(volume_id)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "NodeUnpublishVolume request"
        );

        self.mounter.unmount(target_path)?;

        if Path::new(target_path).exists() {
            if let Err(e) = std::fs::remove_dir(target_path) {
                warn!(error = %e, target_path = %target_path, "Could not remove target directory");
            }
        }

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume unpublished successfully"
        );
        Ok(())
    }

    fn node_info(&self) -> error::Result<String> {
        let iqn = self
            .inspector
            .parse_initiator_identity(&self.config.node.initiator_name_file)?;
        Ok(node_id(&self.hostname, &iqn))
    }
}

/// Compare two device paths, resolving symlinks such as
/// `/dev/mapper/mpatha -> ../dm-2` when both exist.
fn same_device(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Longest digit run the gRPC wire format allows in `grpc-timeout`.
const GRPC_TIMEOUT_MAX_DIGITS: usize = 8;

/// Parse the `grpc-timeout` request header (`<digits><unit>`).
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let raw = metadata.get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 || !raw.is_ascii() {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if digits.len() > GRPC_TIMEOUT_MAX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    match unit {
        "H" => value.checked_mul(3600).map(Duration::from_secs),
        "M" => value.checked_mul(60).map(Duration::from_secs),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

/// Record the outcome of an operation and convert it for the wire.
fn finish<T>(
    timer: OperationTimer,
    volume_id: &str,
    result: error::Result<T>,
) -> Result<Response<T>, Status> {
    match result {
        Ok(response) => {
            timer.success();
            Ok(Response::new(response))
        }
        Err(e) => {
            error!(volume_id = %volume_id, error = %e, "Node operation failed");
            timer.failure(e.kind());
            Err(e.into())
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let deadline = self.request_deadline(request.metadata());
        let req = request.into_inner();
        let result = self
            .stage_volume(&req, deadline)
            .await
            .map(|()| csi::NodeStageVolumeResponse {});
        finish(timer, &req.volume_id, result)
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let req = request.into_inner();
        let result = self
            .unstage_volume(&req)
            .await
            .map(|()| csi::NodeUnstageVolumeResponse {});
        finish(timer, &req.volume_id, result)
    }

    /// Publish a volume to a target path (bind mount from staging).
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();
        let result = self
            .publish_volume(&req)
            .await
            .map(|()| csi::NodePublishVolumeResponse {});
        finish(timer, &req.volume_id, result)
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();
        let result = self
            .unpublish_volume(&req)
            .await
            .map(|()| csi::NodeUnpublishVolumeResponse {});
        finish(timer, &req.volume_id, result)
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(NodeError::Unimplemented("NodeGetVolumeStats").into())
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(NodeError::Unimplemented("NodeExpandVolume").into())
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = NODE_CAPABILITIES
            .iter()
            .map(|cap| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: *cap as i32,
                    },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Report `<hostname>;<initiator iqn>` as the node id.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let node_id = self.node_info().map_err(|e| {
            error!(error = %e, "Failed to read initiator identity");
            Status::from(e)
        })?;
        info!(node_id = %node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/kubelet/plugins/staging").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
        assert!(NodeService::validate_path("/a/b..c/d").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        assert!(NodeService::validate_path("").is_err());
        assert!(NodeService::validate_path("var/lib").is_err());
        assert!(NodeService::validate_path("/var/../etc").is_err());
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var|cat").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
    }

    fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: "xfs".into(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_validate_capability() {
        use csi::volume_capability::access_mode::Mode;

        let cap = mount_capability(Mode::SingleNodeWriter);
        assert_eq!(NodeService::validate_capability(Some(&cap)).unwrap(), "xfs");

        let cap = mount_capability(Mode::MultiNodeMultiWriter);
        assert!(NodeService::validate_capability(Some(&cap)).is_err());

        let mut block = mount_capability(Mode::SingleNodeWriter);
        block.access_type = Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        ));
        let err = NodeService::validate_capability(Some(&block)).unwrap_err();
        assert!(err.to_string().contains("Block"));

        assert!(NodeService::validate_capability(None).is_err());
    }

    #[test]
    fn test_grpc_timeout_parsing() {
        let mut metadata = MetadataMap::new();
        assert_eq!(grpc_timeout(&metadata), None);

        metadata.insert("grpc-timeout", MetadataValue::from_static("30S"));
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_secs(30)));

        metadata.insert("grpc-timeout", MetadataValue::from_static("1500m"));
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_millis(1500)));

        metadata.insert("grpc-timeout", MetadataValue::from_static("2M"));
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_secs(120)));

        metadata.insert("grpc-timeout", MetadataValue::from_static("10x"));
        assert_eq!(grpc_timeout(&metadata), None);

        metadata.insert("grpc-timeout", MetadataValue::from_static("S"));
        assert_eq!(grpc_timeout(&metadata), None);

        metadata.insert("grpc-timeout", MetadataValue::from_static("99999999H"));
        assert_eq!(
            grpc_timeout(&metadata),
            Some(Duration::from_secs(99_999_999 * 3600))
        );

        // More than eight digits is malformed
        metadata.insert("grpc-timeout", MetadataValue::from_static("9999999999999999H"));
        assert_eq!(grpc_timeout(&metadata), None);

        metadata.insert(
            "grpc-timeout",
            MetadataValue::from_static("18446744073709551615S"),
        );
        assert_eq!(grpc_timeout(&metadata), None);

        metadata.insert("grpc-timeout", MetadataValue::from_static("+5S"));
        assert_eq!(grpc_timeout(&metadata), None);
    }

    #[test]
    fn test_request_deadline_never_overflows() {
        let yaml = "identity:\n  name: n\n  version: v\ncontroller:\n  publish_context_lun_parameter: L\n  publish_context_connectivity_parameter: C\n  publish_context_array_iqn: I\nnode:\n  stage_timeout_secs: 18446744073709551615\n";
        let config = Arc::new(DriverConfig::from_yaml(yaml).unwrap());
        let service = NodeService::new("node1".into(), config);

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "grpc-timeout",
            MetadataValue::from_static("18446744073709551615S"),
        );
        assert_eq!(service.request_deadline(&metadata), None);

        metadata.insert("grpc-timeout", MetadataValue::from_static("5S"));
        let deadline = service.request_deadline(&metadata).unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(5));
    }

    #[test]
    fn test_same_device() {
        assert!(same_device("/dev/dm-2", "/dev/dm-2"));
        assert!(!same_device("/nonexistent/dm-2", "/nonexistent/dm-3"));

        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("dm-4");
        std::fs::write(&real, "").unwrap();
        let link = dir.path().join("mpatha");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert!(same_device(
            link.to_str().unwrap(),
            real.to_str().unwrap()
        ));
    }
}
