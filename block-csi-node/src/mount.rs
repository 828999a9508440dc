//! Mount adapter for CSI Node operations
//!
//! Uses Linux tools and kernel interfaces:
//! - blkid to detect an existing filesystem
//! - mkfs.ext4/mkfs.xfs for formatting
//! - mount/umount, including `mount --bind` for publishing
//! - /proc/mounts for the live mount table

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::error::{NodeError, Result};

/// Default filesystem type when the capability leaves it empty
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Format and mount capability the node service depends on.
pub trait Mounter: Send + Sync {
    /// Create a filesystem on `device` if it has none, then mount it.
    fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// `false` only when `path` is certainly a mountpoint. A path that
    /// does not exist is not a mountpoint.
    fn is_likely_not_mount_point(&self, path: &str) -> Result<bool>;

    /// Current mount table.
    fn list(&self) -> Result<Vec<MountPoint>>;

    /// Whether `mount_point` is mounted at `target`.
    fn is_mount_point_match(&self, mount_point: &MountPoint, target: &str) -> bool {
        normalize(&mount_point.path) == normalize(target)
    }

    /// Bind mount `source` at `target`, read-only when requested.
    fn bind_mount(&self, source: &str, target: &str, readonly: bool) -> Result<()>;

    /// Unmount `target`; a path that is not mounted is not an error.
    fn unmount(&self, target: &str) -> Result<()>;
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// [`Mounter`] that shells out to the host's mount tooling.
#[derive(Debug, Clone)]
pub struct LinuxMounter {
    mounts_file: PathBuf,
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl LinuxMounter {
    pub fn new(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }

    fn run(program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            error!(error = %e, program, "Failed to execute command");
            NodeError::CommandFailed(format!("failed to execute {}: {}", program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, program, "Command failed");
            return Err(NodeError::CommandFailed(format!(
                "{} failed: {}",
                program,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Check if a device needs formatting (has no valid filesystem).
    fn needs_formatting(device: &str) -> Result<bool> {
        let output = Command::new("blkid")
            .args(["-p", device])
            .output()
            .map_err(|e| {
                error!(error = %e, "Failed to execute blkid");
                NodeError::CommandFailed(format!("failed to check device filesystem: {}", e))
            })?;

        // blkid returns non-zero if no filesystem found
        if !output.status.success() {
            return Ok(true);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("TYPE="))
    }

    fn format_device(device: &str, fs_type: &str) -> Result<()> {
        info!(device = %device, fs_type = %fs_type, "Formatting device");
        match fs_type {
            "ext4" => Self::run("mkfs.ext4", &["-F", device]),
            "xfs" => Self::run("mkfs.xfs", &["-f", device]),
            other => Err(NodeError::InvalidRequest(format!(
                "Unsupported filesystem type: {}",
                other
            ))),
        }
    }

    fn ensure_dir(path: &str) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| {
            error!(error = %e, path, "Failed to create mount target directory");
            NodeError::io(path, e)
        })
    }
}

impl Mounter for LinuxMounter {
    fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let fs_type = validate_fs_type(fs_type)?;
        Self::ensure_dir(target)?;

        if Self::needs_formatting(device)? {
            Self::format_device(device, fs_type)?;
        } else {
            debug!(device = %device, "Device already has a filesystem");
        }

        info!(device = %device, target = %target, fs_type = %fs_type, "Mounting device");
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([device, target]);
        Self::run("mount", &args)
    }

    fn is_likely_not_mount_point(&self, path: &str) -> Result<bool> {
        let path = Path::new(path);
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(NodeError::io(path.display().to_string(), e)),
        };
        let Some(parent) = path.parent() else {
            return Ok(false);
        };
        let parent_meta =
            fs::metadata(parent).map_err(|e| NodeError::io(parent.display().to_string(), e))?;

        // A different device than the parent directory means a mount boundary
        Ok(meta.dev() == parent_meta.dev())
    }

    fn list(&self) -> Result<Vec<MountPoint>> {
        let contents = fs::read_to_string(&self.mounts_file)
            .map_err(|e| NodeError::io(self.mounts_file.display().to_string(), e))?;
        Ok(parse_mounts(&contents))
    }

    fn bind_mount(&self, source: &str, target: &str, readonly: bool) -> Result<()> {
        info!(source = %source, target = %target, readonly, "Creating bind mount");
        Self::ensure_dir(target)?;
        Self::run("mount", &["--bind", source, target])?;

        if readonly {
            Self::run("mount", &["-o", "remount,bind,ro", target])?;
        }
        Ok(())
    }

    fn unmount(&self, target: &str) -> Result<()> {
        info!(target = %target, "Unmounting");

        let mounted = self
            .list()?
            .iter()
            .any(|m| self.is_mount_point_match(m, target));
        if !mounted {
            debug!(target = %target, "Path is not mounted, skipping unmount");
            return Ok(());
        }

        match Self::run("umount", &[target]) {
            Err(NodeError::CommandFailed(msg))
                if msg.contains("not mounted") || msg.contains("no mount point") =>
            {
                warn!(target = %target, "Path was not mounted");
                Ok(())
            }
            other => other,
        }
    }
}

/// Validate and normalize a requested filesystem type.
pub fn validate_fs_type(fs_type: &str) -> Result<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok(DEFAULT_FS_TYPE),
        "xfs" => Ok("xfs"),
        _ => Err(NodeError::InvalidRequest(format!(
            "Unsupported filesystem type: {}. Supported: ext4, xfs",
            fs_type
        ))),
    }
}

/// Parse `/proc/mounts` content.
pub fn parse_mounts(contents: &str) -> Vec<MountPoint> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountPoint {
                device: unescape_octal(device),
                path: unescape_octal(path),
                fs_type: fs_type.to_string(),
                options: options
                    .split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|_| bytes[i] == b'\\')
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(value) => {
                out.push(value);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
