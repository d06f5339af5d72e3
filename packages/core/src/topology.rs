//! Encrypted container discovery using lsblk.
//!
//! Turns the `lsblk --json` tree (disks and loop devices, their partitions,
//! the unlocked mappings beneath those, and the filesystems inside the
//! mappings) into a flat map of UUID to [`Container`].
//!
//! Only the immediate children of top-level devices are container
//! candidates. Loop devices are file containers: the LUKS UUID and the
//! backing file belong to the loop device itself and are copied onto its
//! mapping child.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::container::{Container, ContainerInfo, DeviceKind, Filesystem, ParentDevice};
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, argv};
use crate::host::Host;

/// Columns requested from lsblk.
pub const LSBLK_COLUMNS: &str = "NAME,MAJ:MIN,TYPE,FSTYPE,LABEL,PARTLABEL,FSUSE%,SIZE,UUID,MOUNTPOINTS";

/// Containers keyed by UUID, in a stable order.
pub type Inventory = BTreeMap<String, Container>;

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type", default)]
    device_type: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    partlabel: Option<String>,
    #[serde(default)]
    size: Option<SizeField>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,
    /// Older lsblk releases only report a single mount point.
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

/// `SIZE` is a display string by default and a byte count with `--bytes`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeField {
    Text(String),
    Bytes(u64),
}

impl LsblkDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::from_lsblk(self.device_type.as_deref().unwrap_or_default())
    }

    fn fstype(&self) -> &str {
        self.fstype.as_deref().unwrap_or_default()
    }

    fn is_luks(&self) -> bool {
        self.fstype().to_ascii_lowercase().contains("luks")
    }

    fn label(&self) -> String {
        self.label
            .as_deref()
            .filter(|l| !l.is_empty())
            .or(self.partlabel.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    fn size_display(&self) -> String {
        match &self.size {
            Some(SizeField::Text(text)) => text.clone(),
            Some(SizeField::Bytes(bytes)) => bytes.to_string(),
            None => String::new(),
        }
    }

    fn uuid(&self) -> &str {
        self.uuid.as_deref().unwrap_or_default()
    }

    /// Live mounts, without the null placeholders lsblk emits for
    /// unmounted devices.
    fn mounts(&self) -> Vec<PathBuf> {
        match &self.mountpoints {
            Some(points) => points.iter().flatten().map(PathBuf::from).collect(),
            None => self.mountpoint.iter().map(PathBuf::from).collect(),
        }
    }

    fn children(&self) -> &[LsblkDevice] {
        self.children.as_deref().unwrap_or_default()
    }

    fn to_filesystem(&self) -> Filesystem {
        Filesystem {
            name: self.name.clone(),
            fstype: self.fstype().to_string(),
            label: self.label(),
            mounts: self.mounts(),
        }
    }
}

/// Runs lsblk and parses its report.
pub fn list_containers(runner: &dyn CommandRunner, host: &dyn Host) -> Result<Inventory> {
    let command = argv(["lsblk", "-J", "-o", LSBLK_COLUMNS]);
    let output = runner.run(&command, None)?;
    if !output.success() {
        return Err(Error::CommandExit {
            command: "lsblk".to_string(),
            code: output.code,
            stderr: output.stderr,
        });
    }
    parse_report(&output.stdout, host)
}

/// Parses an lsblk JSON report into containers.
///
/// A report without a `blockdevices` array is fatal; unreadable sysfs
/// metadata only leaves the affected fields empty.
pub fn parse_report(json: &str, host: &dyn Host) -> Result<Inventory> {
    let report: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut raw_index = Inventory::new();
    let mut crypt_index = Inventory::new();

    for device in &report.blockdevices {
        let parent_kind = device.kind();
        let is_loop = parent_kind == DeviceKind::Loop;
        let parent = ParentDevice {
            name: device.name.clone(),
            kind: parent_kind,
            model: host.read_model(&device.name),
        };
        // The mapping under a loop device reports the inner fstype, not LUKS.
        let bypass_filter = is_loop && parent.model.is_empty();
        let backing_file = if is_loop {
            Some(host.read_backing_file(&device.name))
                .filter(|f| !f.is_empty())
                .map(PathBuf::from)
        } else {
            None
        };

        for child in device.children() {
            if !bypass_filter && !child.is_luks() {
                continue;
            }

            let uuid = if is_loop { device.uuid() } else { child.uuid() };
            if uuid.is_empty() {
                debug!(device = %child.name, "skipping candidate without UUID");
                continue;
            }

            let info = ContainerInfo {
                uuid: uuid.to_string(),
                device_name: child.name.clone(),
                label: child.label(),
                size: child.size_display(),
                backing_file: backing_file.clone(),
                parent: Some(parent.clone()),
            };
            let kind = child.kind();
            let filesystems: Vec<Filesystem> =
                child.children().iter().map(LsblkDevice::to_filesystem).collect();

            let container = if !filesystems.is_empty() {
                Container::opened(info, kind, filesystems)
            } else if kind == DeviceKind::Crypt && !child.mounts().is_empty() {
                // Filesystem directly on the mapping.
                Container::opened(info, kind, vec![child.to_filesystem()])
            } else {
                Container::closed(info, kind)
            };

            debug!(
                uuid = %container.uuid,
                device = %container.device_name,
                opened = container.is_opened(),
                "found container"
            );
            if kind == DeviceKind::Crypt {
                crypt_index.insert(container.uuid.clone(), container);
            } else {
                raw_index.insert(container.uuid.clone(), container);
            }
        }
    }

    raw_index.extend(crypt_index);
    Ok(raw_index)
}
