//! Encrypted container data model.
//!
//! A [`Container`] is rebuilt from scratch on every topology scan; the only
//! identity that survives between scans is its `uuid`. Constructors enforce
//! the invariants: a closed container has no filesystems, and only a
//! container with exactly one filesystem holding exactly one mount has a
//! canonical mount point.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Kernel block device type, as reported in the lsblk `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
    Loop,
    Crypt,
    Other,
}

impl DeviceKind {
    pub fn from_lsblk(device_type: &str) -> Self {
        match device_type {
            "disk" => Self::Disk,
            "part" => Self::Partition,
            "loop" => Self::Loop,
            "crypt" => Self::Crypt,
            _ => Self::Other,
        }
    }
}

/// The enclosing top-level device (a disk or loop device).
///
/// Held by value: the scan owns the hierarchy, so a container only keeps a
/// snapshot of what encloses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentDevice {
    pub name: String,
    pub kind: DeviceKind,
    /// Vendor/model for disks, empty for loop devices.
    pub model: String,
}

/// A filesystem inside an unlocked mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filesystem {
    /// Kernel name; for a mapping this is the `/dev/mapper` name.
    pub name: String,
    pub fstype: String,
    pub label: String,
    pub mounts: Vec<PathBuf>,
}

/// Presentation state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Unlocked and mounted at a canonical mount point.
    Mounted,
    /// Unlocked, but without a single canonical mount point.
    Opened,
    /// Encryption layer closed.
    Locked,
}

/// Descriptive fields shared by every constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub uuid: String,
    pub device_name: String,
    pub label: String,
    pub size: String,
    pub backing_file: Option<PathBuf>,
    pub parent: Option<ParentDevice>,
}

/// A discovered or remembered encrypted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Container {
    /// Stable identifier (LUKS UUID); the primary key.
    pub uuid: String,
    /// Kernel block name; empty for an absent file-backed container.
    pub device_name: String,
    pub kind: DeviceKind,
    pub label: String,
    pub size: String,
    /// Set only for file-backed (loop) containers.
    pub backing_file: Option<PathBuf>,
    pub parent: Option<ParentDevice>,
    opened: bool,
    mount_point: Option<PathBuf>,
    filesystems: Vec<Filesystem>,
}

impl Container {
    /// A container whose encryption layer is closed.
    pub fn closed(info: ContainerInfo, kind: DeviceKind) -> Self {
        Self::build(info, kind, false, Vec::new())
    }

    /// An unlocked container with the filesystems found inside its mapping.
    pub fn opened(info: ContainerInfo, kind: DeviceKind, filesystems: Vec<Filesystem>) -> Self {
        Self::build(info, kind, true, filesystems)
    }

    /// A remembered file-backed container that is absent from the topology.
    pub fn placeholder(uuid: impl Into<String>, backing_file: impl Into<PathBuf>) -> Self {
        Self::closed(
            ContainerInfo {
                uuid: uuid.into(),
                backing_file: Some(backing_file.into()),
                ..Default::default()
            },
            DeviceKind::Crypt,
        )
    }

    fn build(
        info: ContainerInfo,
        kind: DeviceKind,
        opened: bool,
        filesystems: Vec<Filesystem>,
    ) -> Self {
        let filesystems = if opened { filesystems } else { Vec::new() };
        let mount_point = primary_mount(&filesystems);
        Self {
            uuid: info.uuid,
            device_name: info.device_name,
            kind,
            label: info.label,
            size: info.size,
            backing_file: info.backing_file,
            parent: info.parent,
            opened,
            mount_point,
            filesystems,
        }
    }

    /// Returns true if the encryption layer is unlocked.
    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Canonical mount point, if any.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    /// Filesystems inside the unlocked mapping; empty when closed.
    pub fn filesystems(&self) -> &[Filesystem] {
        &self.filesystems
    }

    /// Every live mount of every filesystem.
    pub fn mounts(&self) -> impl Iterator<Item = &Path> {
        self.filesystems
            .iter()
            .flat_map(|fs| fs.mounts.iter().map(PathBuf::as_path))
    }

    /// Returns true if this container lives in a file.
    pub fn is_file_backed(&self) -> bool {
        self.backing_file.is_some()
    }

    /// Returns true if this is a remembered container not currently present.
    pub fn is_placeholder(&self) -> bool {
        self.device_name.is_empty()
    }

    pub fn state(&self) -> ContainerState {
        match (self.opened, self.mount_point.is_some()) {
            (true, true) => ContainerState::Mounted,
            (true, false) => ContainerState::Opened,
            (false, _) => ContainerState::Locked,
        }
    }

    /// Name for menus: the backing file (home shortened to `~`) or device name.
    pub fn display_name(&self) -> String {
        match &self.backing_file {
            Some(file) => {
                let file = file.to_string_lossy();
                match file.strip_prefix("/home/") {
                    Some(rest) => format!("~{}", rest),
                    None => file.to_string(),
                }
            }
            None => self.device_name.clone(),
        }
    }
}

/// Single mount of a single filesystem; anything else is ambiguous.
fn primary_mount(filesystems: &[Filesystem]) -> Option<PathBuf> {
    match filesystems {
        [only] if only.mounts.len() == 1 => Some(only.mounts[0].clone()),
        _ => None,
    }
}

/// Overall state of a container set, one per tray icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraySummary {
    NoContainers,
    AllLocked,
    SomeLocked,
    NoneLocked,
}

impl TraySummary {
    pub fn of<'a>(containers: impl IntoIterator<Item = &'a Container>) -> Self {
        let (mut locked, mut total) = (0usize, 0usize);
        for container in containers {
            total += 1;
            if !container.is_opened() {
                locked += 1;
            }
        }
        match (total, locked) {
            (0, _) => Self::NoContainers,
            (t, l) if t == l => Self::AllLocked,
            (_, 0) => Self::NoneLocked,
            _ => Self::SomeLocked,
        }
    }
}
