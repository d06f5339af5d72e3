//! Read-only access to host state outside the device listing report.
//!
//! All reads are best-effort: a missing or unreadable file degrades to an
//! empty value and is never an error.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::mounts::MountTable;

/// Host facts consulted by the topology parser and the orchestrator.
pub trait Host {
    /// Vendor/model string of a physical disk, empty if unavailable.
    fn read_model(&self, device: &str) -> String;

    /// Backing file of a loop device, empty if unavailable.
    fn read_backing_file(&self, loop_device: &str) -> String;

    /// Snapshot of the live mount table.
    fn mount_table(&self) -> MountTable;

    /// Returns true if `path` exists and is a block special file.
    fn is_block_device(&self, path: &Path) -> bool;
}

/// [`Host`] backed by sysfs and the kernel mount table.
#[derive(Debug, Clone)]
pub struct SystemHost {
    sys_root: PathBuf,
    mounts_path: PathBuf,
}

impl SystemHost {
    pub fn new(sys_root: impl Into<PathBuf>, mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            mounts_path: mounts_path.into(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new("/sys", crate::mounts::MOUNTS_PATH)
    }
}

impl Host for SystemHost {
    fn read_model(&self, device: &str) -> String {
        let path = self
            .sys_root
            .join("class/block")
            .join(device)
            .join("device/model");
        read_trimmed(&path)
    }

    fn read_backing_file(&self, loop_device: &str) -> String {
        let path = self
            .sys_root
            .join("block")
            .join(loop_device)
            .join("loop/backing_file");
        read_trimmed(&path)
    }

    fn mount_table(&self) -> MountTable {
        MountTable::read(&self.mounts_path)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
}

fn read_trimmed(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content.trim().to_string(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "metadata unavailable");
            String::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::{Path, PathBuf};

    use super::Host;
    use crate::mounts::MountTable;

    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeHost {
        pub(crate) models: BTreeMap<String, String>,
        pub(crate) backing_files: BTreeMap<String, String>,
        pub(crate) mounts: String,
        pub(crate) block_devices: BTreeSet<PathBuf>,
    }

    impl Host for FakeHost {
        fn read_model(&self, device: &str) -> String {
            self.models.get(device).cloned().unwrap_or_default()
        }

        fn read_backing_file(&self, loop_device: &str) -> String {
            self.backing_files
                .get(loop_device)
                .cloned()
                .unwrap_or_default()
        }

        fn mount_table(&self) -> MountTable {
            MountTable::parse(&self.mounts)
        }

        fn is_block_device(&self, path: &Path) -> bool {
            self.block_devices.contains(path)
        }
    }
}
