//! Checks on user-entered action parameters.
//!
//! Every problem is reported as one `ERR: ...` line, and all lines are
//! collected so the user sees every mistake in one attempt. Validation never
//! runs a command.

use std::path::{Path, PathBuf};

use crate::mounts::MountTable;
use crate::vitals::Secret;

/// Raw fields of a mount request, as typed by the user.
#[derive(Debug, Clone, Default)]
pub struct MountForm {
    pub password: Secret,
    pub mount_point: String,
    pub delay_minutes: String,
    pub repeat_minutes: String,
}

/// Raw fields of an "add crypt file" request.
#[derive(Debug, Clone, Default)]
pub struct AddFileForm {
    pub mount: MountForm,
    pub backing_file: String,
    pub size_mib: String,
}

/// Validated mount parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    pub password: Secret,
    pub mount_point: PathBuf,
    pub delay_minutes: u32,
    pub repeat_minutes: u32,
}

/// Validated parameters for creating a new file container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFilePlan {
    pub mount: MountPlan,
    pub backing_file: PathBuf,
    pub size_mib: u64,
}

/// Validates a mount request against the live mount table.
pub fn check_mount(form: &MountForm, table: &MountTable) -> Result<MountPlan, Vec<String>> {
    let mut errors = Vec::new();
    let plan = collect_mount(form, table, &mut errors);
    match plan {
        Some(plan) if errors.is_empty() => Ok(plan),
        _ => Err(errors),
    }
}

/// Validates an add-file request; the backing file may not exist yet.
pub fn check_add_file(form: &AddFileForm, table: &MountTable) -> Result<AddFilePlan, Vec<String>> {
    let mut errors = Vec::new();
    let mount = collect_mount(&form.mount, table, &mut errors);
    let size_mib = parse_count::<u64>("size", &form.size_mib, &mut errors);
    let backing_file = check_backing_file(&form.backing_file, &mut errors);

    match (mount, size_mib, backing_file) {
        (Some(mount), Some(size_mib), Some(backing_file)) if errors.is_empty() => Ok(AddFilePlan {
            mount,
            backing_file,
            size_mib,
        }),
        _ => Err(errors),
    }
}

fn collect_mount(form: &MountForm, table: &MountTable, errors: &mut Vec<String>) -> Option<MountPlan> {
    if form.password.is_empty() {
        errors.push("ERR: cannot leave password empty".to_string());
    }
    let mount_point = check_mount_point(form.mount_point.trim(), table, errors);
    let delay = parse_count::<u32>("delay", &form.delay_minutes, errors);
    let repeat = parse_count::<u32>("repeat", &form.repeat_minutes, errors);

    Some(MountPlan {
        password: form.password.clone(),
        mount_point: mount_point?,
        delay_minutes: delay?,
        repeat_minutes: repeat?,
    })
}

fn check_mount_point(text: &str, table: &MountTable, errors: &mut Vec<String>) -> Option<PathBuf> {
    let path = Path::new(text);
    if !path.is_absolute() || !is_empty_dir(path) {
        errors.push(format!(
            "ERR: mount point ({}) is not absolute path to empty folder",
            text
        ));
        return None;
    }
    if table.is_target(text) {
        errors.push(format!("ERR: mount point ({}) occupied", text));
        return None;
    }
    Some(path.to_path_buf())
}

fn is_empty_dir(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

fn check_backing_file(text: &str, errors: &mut Vec<String>) -> Option<PathBuf> {
    let text = text.trim();
    let path = match std::path::absolute(text) {
        Ok(path) if !text.is_empty() => path,
        _ => {
            errors.push(format!("ERR: Crypt File ({}) is not a valid path", text));
            return None;
        }
    };
    match path.parent() {
        Some(dir) if dir.is_dir() => Some(path),
        _ => {
            errors.push(format!(
                "ERR: Crypt File {} must be in an existing directory",
                path.display()
            ));
            None
        }
    }
}

fn parse_count<T: std::str::FromStr>(key: &str, text: &str, errors: &mut Vec<String>) -> Option<T> {
    let text = text.trim();
    match text.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(format!(
                "ERR: value ({}) for {} must be a non-negative integer",
                text, key
            ));
            None
        }
    }
}
