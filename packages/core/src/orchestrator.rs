//! Mount and unmount sequences.
//!
//! Each action validates its input first; any validation problem stops the
//! action before a single command runs. Mount steps then run strictly in
//! order and the first failure halts the sequence, leaving completed steps
//! in place. Unmount keeps going across filesystems and only skips the close
//! of a filesystem whose unmount failed.
//!
//! All problems end up as lines in [`ActionReport::errors`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::container::Container;
use crate::context::Context;
use crate::error::Result;
use crate::executor::{RetryPolicy, argv, rerun_if_busy};
use crate::reconcile::reconcile;
use crate::validate::{AddFileForm, MountForm, MountPlan, check_add_file, check_mount};

/// Progress of one action; a failed action stops in the state whose step
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Locked,
    Formatting,
    Unlocking,
    Mounting,
    Rebinding,
    Mounted,
    Unmounting,
    Closing,
    Closed,
}

/// Outcome of one user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub uuid: String,
    pub state: ActionState,
    pub errors: Vec<String>,
}

impl ActionReport {
    fn new(uuid: impl Into<String>, state: ActionState) -> Self {
        Self {
            uuid: uuid.into(),
            state,
            errors: Vec::new(),
        }
    }

    fn rejected(uuid: impl Into<String>, state: ActionState, errors: Vec<String>) -> Self {
        Self {
            errors,
            ..Self::new(uuid, state)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Runs one step; records the failure line and returns false on error.
    fn step(
        &mut self,
        ctx: &Context,
        state: ActionState,
        command: Vec<String>,
        input: Option<&str>,
        policy: RetryPolicy,
    ) -> bool {
        self.state = state;
        match rerun_if_busy(ctx.runner.as_ref(), &command, input, policy) {
            Ok(()) => true,
            Err(failure) => {
                warn!(uuid = %self.uuid, %failure, "step failed");
                self.errors.push(failure.to_string());
                false
            }
        }
    }
}

/// Mapping name for a block device container: the single filesystem's name
/// when there is exactly one, else `<uuid>-luks`.
pub fn device_mapping_name(container: &Container) -> String {
    match container.filesystems() {
        [only] => only.name.clone(),
        _ => format!("{}-luks", container.uuid),
    }
}

/// Mapping name for a file container: `<file name>-luks`.
pub fn file_mapping_name(backing_file: &Path) -> String {
    let base = backing_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}-luks", base)
}

/// UUID-shaped id derived from a path, for file containers whose real
/// LUKS UUID is not visible.
pub fn file_uuid(path: &Path) -> String {
    let digest = hex::encode(Sha256::digest(path.to_string_lossy().as_bytes()));
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

/// Mounts a known container, choosing the file or block sequence.
pub fn mount(ctx: &mut Context, uuid: &str, form: &MountForm) -> Result<ActionReport> {
    let container = ctx.container(uuid)?.clone();
    let report = if container.is_file_backed() {
        mount_file(ctx, &container, form)
    } else {
        mount_device(ctx, &container, form)
    };
    Ok(report)
}

/// Unmounts and closes a known container.
pub fn unmount(ctx: &mut Context, uuid: &str) -> Result<ActionReport> {
    let container = ctx.container(uuid)?.clone();
    let report = if container.is_file_backed() {
        unmount_file(ctx, &container)
    } else {
        unmount_device(ctx, &container)
    };
    Ok(report)
}

/// Unlock (unless open), mount, rebind for a partition or disk container.
pub fn mount_device(ctx: &mut Context, container: &Container, form: &MountForm) -> ActionReport {
    if let Some(report) = refuse_if_mounted(container) {
        return report;
    }
    let plan = match check_mount(form, &ctx.host.mount_table()) {
        Ok(plan) => plan,
        Err(errors) => return ActionReport::rejected(&container.uuid, ActionState::Locked, errors),
    };
    let mut report = ActionReport::new(&container.uuid, ActionState::Locked);
    let mapping = device_mapping_name(container);

    if !container.is_opened() {
        let device = format!("/dev/{}", container.device_name);
        let command = argv(["cryptsetup", "luksOpen", device.as_str(), mapping.as_str()]);
        if !report.step(
            ctx,
            ActionState::Unlocking,
            command,
            Some(plan.password.expose()),
            RetryPolicy::ONCE,
        ) {
            return report;
        }
    }

    if mount_and_rebind(ctx, &mut report, &mapping, &plan.mount_point) {
        remember(ctx, &mut report, &plan);
        rescan(ctx);
    }
    report
}

/// Mount sequence for a known file container.
pub fn mount_file(ctx: &mut Context, container: &Container, form: &MountForm) -> ActionReport {
    if let Some(report) = refuse_if_mounted(container) {
        return report;
    }
    let plan = match check_mount(form, &ctx.host.mount_table()) {
        Ok(plan) => plan,
        Err(errors) => return ActionReport::rejected(&container.uuid, ActionState::Locked, errors),
    };
    let mut report = ActionReport::new(&container.uuid, ActionState::Locked);
    let Some(backing_file) = &container.backing_file else {
        report
            .errors
            .push(format!("ERR: container w UUID={} has no backing file", container.uuid));
        return report;
    };
    let opened = container
        .is_opened()
        .then_some(container.device_name.as_str());

    if open_and_mount_file(ctx, &mut report, backing_file, opened, None, &plan) {
        remember(ctx, &mut report, &plan);
        rescan(ctx);
    }
    report
}

/// Creates, formats and mounts a new file container.
///
/// On success the container is remembered under the UUID the rescan finds
/// for the backing file, or under [`file_uuid`] if it does not show up.
pub fn add_file(ctx: &mut Context, form: &AddFileForm) -> ActionReport {
    let plan = match check_add_file(form, &ctx.host.mount_table()) {
        Ok(plan) => plan,
        Err(errors) => return ActionReport::rejected("", ActionState::Locked, errors),
    };
    let mut report = ActionReport::new("", ActionState::Locked);

    if !open_and_mount_file(
        ctx,
        &mut report,
        &plan.backing_file,
        None,
        Some(plan.size_mib),
        &plan.mount,
    ) {
        return report;
    }

    rescan(ctx);
    report.uuid = ctx
        .inventory()
        .values()
        .find(|c| c.backing_file.as_deref() == Some(plan.backing_file.as_path()))
        .map(|c| c.uuid.clone())
        .unwrap_or_else(|| file_uuid(&plan.backing_file));
    ctx.vitals
        .note_backing_file(&report.uuid, &plan.backing_file);
    remember(ctx, &mut report, &plan.mount);
    if let Err(e) = ctx.vitals.save() {
        report.errors.push(format!("ERR: {}", e));
    }
    report
}

/// Unmounts every filesystem of a block device container and closes each
/// mapping whose unmounts all succeeded.
pub fn unmount_device(ctx: &mut Context, container: &Container) -> ActionReport {
    let table = ctx.host.mount_table();
    let policy = ctx.config.retry_policy();
    let mut report = ActionReport::new(&container.uuid, ActionState::Mounted);

    for filesystem in container.filesystems() {
        let before = report.errors.len();
        for mount in &filesystem.mounts {
            if table.is_mounted(&mount.to_string_lossy()) {
                let command = argv(["umount".to_string(), mount.display().to_string()]);
                report.step(ctx, ActionState::Unmounting, command, None, policy);
            }
        }
        if report.errors.len() > before {
            continue;
        }

        let mapped = PathBuf::from("/dev/mapper").join(&filesystem.name);
        if !ctx.host.is_block_device(&mapped) {
            continue;
        }
        let mapped = mapped.display().to_string();
        if table.is_mounted(&mapped) {
            let command = argv(["umount", mapped.as_str()]);
            if !report.step(ctx, ActionState::Unmounting, command, None, policy) {
                continue;
            }
        }
        let command = argv(["cryptsetup", "luksClose", filesystem.name.as_str()]);
        report.step(ctx, ActionState::Closing, command, None, RetryPolicy::ONCE);
    }

    finish_unmount(ctx, report)
}

/// Unmounts a file container and closes its mapping if every unmount
/// succeeded.
pub fn unmount_file(ctx: &mut Context, container: &Container) -> ActionReport {
    let table = ctx.host.mount_table();
    let policy = ctx.config.retry_policy();
    let mut report = ActionReport::new(&container.uuid, ActionState::Mounted);

    for mount in container.mounts() {
        if table.is_mounted(&mount.to_string_lossy()) {
            let command = argv(["umount".to_string(), mount.display().to_string()]);
            report.step(ctx, ActionState::Unmounting, command, None, policy);
        }
    }

    if report.is_ok() && container.is_opened() {
        let command = argv(["cryptsetup", "close", container.device_name.as_str()]);
        report.step(ctx, ActionState::Closing, command, None, RetryPolicy::ONCE);
    }

    finish_unmount(ctx, report)
}

/// A container with any live mount is never mounted a second time.
fn refuse_if_mounted(container: &Container) -> Option<ActionReport> {
    let mounts: Vec<String> = container
        .mounts()
        .map(|p| p.display().to_string())
        .collect();
    if mounts.is_empty() {
        return None;
    }
    Some(ActionReport::rejected(
        &container.uuid,
        ActionState::Mounted,
        vec![format!(
            "ERR: container w UUID={} already mounted at {}",
            container.uuid,
            mounts.join(", ")
        )],
    ))
}

fn finish_unmount(ctx: &mut Context, mut report: ActionReport) -> ActionReport {
    if report.is_ok() {
        report.state = ActionState::Closed;
        info!(uuid = %report.uuid, "container closed");
    }
    rescan(ctx);
    report
}

/// Optional create and format, then unlock, mkfs for new files, mount,
/// rebind.
fn open_and_mount_file(
    ctx: &Context,
    report: &mut ActionReport,
    backing_file: &Path,
    opened_mapping: Option<&str>,
    size_mib: Option<u64>,
    plan: &MountPlan,
) -> bool {
    let file = backing_file.display().to_string();
    let password = plan.password.expose();
    let mut needs_filesystem = false;

    if !backing_file.exists() {
        let Some(size_mib) = size_mib else {
            report.errors.push(format!(
                "ERR: File {} does not exist and size is not specified to create it.",
                file
            ));
            return false;
        };
        let size = format!("{}M", size_mib);
        let truncate = argv(["truncate", "-s", size.as_str(), file.as_str()]);
        if !report.step(ctx, ActionState::Formatting, truncate, None, RetryPolicy::ONCE) {
            return false;
        }
        let format = argv(["cryptsetup", "luksFormat", "-q", file.as_str()]);
        if !report.step(
            ctx,
            ActionState::Formatting,
            format,
            Some(password),
            RetryPolicy::ONCE,
        ) {
            return false;
        }
        needs_filesystem = true;
    }

    let mapping = match opened_mapping {
        Some(name) => name.to_string(),
        None => {
            let mapping = file_mapping_name(backing_file);
            let command = argv(["cryptsetup", "luksOpen", file.as_str(), mapping.as_str()]);
            if !report.step(
                ctx,
                ActionState::Unlocking,
                command,
                Some(password),
                RetryPolicy::ONCE,
            ) {
                return false;
            }
            mapping
        }
    };

    if needs_filesystem {
        let command = argv([
            ctx.config.mkfs_program.clone(),
            format!("/dev/mapper/{}", mapping),
        ]);
        if !report.step(ctx, ActionState::Formatting, command, None, RetryPolicy::ONCE) {
            return false;
        }
    }

    mount_and_rebind(ctx, report, &mapping, &plan.mount_point)
}

fn mount_and_rebind(ctx: &Context, report: &mut ActionReport, mapping: &str, target: &Path) -> bool {
    let target = target.display().to_string();
    let mount = argv([
        "mount".to_string(),
        format!("/dev/mapper/{}", mapping),
        target.clone(),
    ]);
    if !report.step(ctx, ActionState::Mounting, mount, None, RetryPolicy::ONCE) {
        return false;
    }

    let (uid, gid) = (ctx.uid.to_string(), ctx.gid.to_string());
    let rebind = argv([
        "bindfs",
        "-u",
        uid.as_str(),
        "-g",
        gid.as_str(),
        target.as_str(),
        target.as_str(),
    ]);
    if !report.step(ctx, ActionState::Rebinding, rebind, None, RetryPolicy::ONCE) {
        return false;
    }

    report.state = ActionState::Mounted;
    info!(uuid = %report.uuid, %target, "container mounted");
    true
}

/// Stores the values that just worked if any of them changed.
fn remember(ctx: &mut Context, report: &mut ActionReport, plan: &MountPlan) {
    let mount_point = plan.mount_point.to_string_lossy();
    let mut vital = ctx.vitals.get_vital(&report.uuid);
    let changed = vital.password != plan.password
        || vital.preferred_mount_point != mount_point
        || vital.delay_minutes != plan.delay_minutes
        || vital.repeat_minutes != plan.repeat_minutes;
    if !changed {
        return;
    }

    vital.password = plan.password.clone();
    vital.preferred_mount_point = mount_point.into_owned();
    vital.delay_minutes = plan.delay_minutes;
    vital.repeat_minutes = plan.repeat_minutes;
    if let Err(e) = ctx.vitals.put_vital(vital) {
        report.errors.push(format!("ERR: {}", e));
    }
}

fn rescan(ctx: &mut Context) {
    if let Err(e) = reconcile(ctx) {
        warn!(error = %e, "rescan after action failed");
    }
}
