//! Live mount table (`/proc/mounts`) parsing.

use std::collections::BTreeSet;
use std::path::Path;

/// Default mount table path.
pub const MOUNTS_PATH: &str = "/proc/mounts";

/// Sources and targets currently present in the mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    sources: BTreeSet<String>,
    targets: BTreeSet<String>,
}

impl MountTable {
    /// Parses mount table content, one entry per line: source, target, ...
    pub fn parse(content: &str) -> Self {
        let mut table = Self::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
                continue;
            };
            table.sources.insert(unescape_mount_field(source));
            table.targets.insert(unescape_mount_field(target));
        }
        table
    }

    /// Reads and parses the mount table at `path`; unreadable means empty.
    pub fn read(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read mount table");
                Self::default()
            }
        }
    }

    /// Returns true if `thing` is mounted somewhere or is a mount target.
    pub fn is_mounted(&self, thing: &str) -> bool {
        self.sources.contains(thing) || self.targets.contains(thing)
    }

    /// Returns true if `path` is a mount target.
    pub fn is_target(&self, path: &str) -> bool {
        self.targets.contains(path)
    }
}

/// Unescapes octal sequences (`\040` for space) used by the kernel.
fn unescape_mount_field(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3
                && digits.chars().all(|d| d.is_ascii_digit())
                && let Ok(byte) = u8::from_str_radix(&digits, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = "\
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/mapper/vault.img-luks /mnt/vault ext4 rw 0 0
/mnt/vault /mnt/vault fuse rw,user_id=0 0 0
/dev/mapper/luks-1 /media/My\\040Drive ext4 rw 0 0
garbage
";

    #[test]
    fn test_parse_sources_and_targets() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.is_mounted("/dev/mapper/vault.img-luks"));
        assert!(table.is_mounted("/mnt/vault"));
        assert!(table.is_target("/mnt/vault"));
        assert!(!table.is_target("/dev/mapper/vault.img-luks"));
        assert!(!table.is_mounted("garbage"));
    }

    #[test]
    fn test_parse_escaped_spaces() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.is_target("/media/My Drive"));
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let table = MountTable::read(Path::new("/nonexistent/mounts"));
        assert_eq!(table, MountTable::default());
    }

    #[test]
    fn test_read_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "/dev/sda1 /mnt/occupied ext4 rw 0 0").unwrap();
        let table = MountTable::read(file.path());
        assert!(table.is_target("/mnt/occupied"));
    }
}
