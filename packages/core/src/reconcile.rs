//! Merges live topology with remembered containers.

use tracing::{debug, error};

use crate::container::Container;
use crate::context::Context;
use crate::error::Result;
use crate::topology::{self, Inventory};

/// One reconciliation pass.
///
/// Scans the topology, records every container in the vitals store, saves
/// it, then adds a locked placeholder for each remembered file container
/// that is not currently attached. The result replaces the context's
/// inventory; on a scan error the previous inventory is kept.
pub fn reconcile(ctx: &mut Context) -> Result<&Inventory> {
    let mut inventory = topology::list_containers(ctx.runner.as_ref(), ctx.host.as_ref())?;

    for container in inventory.values() {
        let mount_point = container
            .mount_point()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        ctx.vitals.ensure_container(&container.uuid, &mount_point);
        if let Some(file) = &container.backing_file {
            ctx.vitals.note_backing_file(&container.uuid, file);
        }
    }
    if let Err(e) = ctx.vitals.save() {
        // stays dirty; the next pass retries
        error!(error = %e, "failed to save vitals");
    }

    for vital in ctx.vitals.vitals() {
        if let Some(file) = &vital.backing_file
            && !inventory.contains_key(&vital.uuid)
        {
            debug!(uuid = %vital.uuid, file = %file.display(), "offering detached file container");
            inventory.insert(vital.uuid.clone(), Container::placeholder(&vital.uuid, file));
        }
    }

    ctx.set_inventory(inventory);
    Ok(ctx.inventory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::CommandOutput;
    use crate::executor::testing::FakeRunner;
    use crate::host::testing::FakeHost;
    use crate::vitals::{Vital, VitalsStore};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::tempdir;

    const LSBLK: &str = r#"{"blockdevices": [
        {"name": "sda", "type": "disk", "children": [
            {"name": "sda2", "type": "part", "fstype": "crypto_LUKS", "uuid": "bbbb",
             "mountpoints": [null], "children": [
                {"name": "luks-bbbb", "type": "crypt", "fstype": "ext4",
                 "mountpoints": ["/mnt/backup"]}
             ]}
        ]},
        {"name": "loop0", "type": "loop", "fstype": "crypto_LUKS", "uuid": "aaaa",
         "mountpoints": [null], "children": [
            {"name": "vault.img-luks", "type": "crypt", "fstype": "ext4", "mountpoints": [null]}
         ]}
    ]}"#;

    fn context(dir: &Path, runner: Arc<FakeRunner>) -> Context {
        let mut host = FakeHost::default();
        host.models.insert("sda".to_string(), "WD".to_string());
        host.backing_files
            .insert("loop0".to_string(), "/data/vault.img".to_string());
        let vitals = VitalsStore::new(dir.join("vitals.json"), dir.join("secrets.json"));
        Context::new(Config::default(), Box::new(runner), Box::new(host), vitals)
    }

    fn lsblk_ok(runner: &FakeRunner) {
        runner.script(
            "lsblk",
            vec![CommandOutput {
                code: 0,
                stdout: LSBLK.to_string(),
                stderr: String::new(),
            }],
        );
    }

    #[test]
    fn test_reconcile_records_containers() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        lsblk_ok(&runner);
        let mut ctx = context(dir.path(), runner.clone());

        let inventory = reconcile(&mut ctx).unwrap();
        assert_eq!(inventory.len(), 2);

        assert_eq!(ctx.vitals.get_vital("bbbb").preferred_mount_point, "/mnt/backup");
        assert_eq!(
            ctx.vitals.get_vital("aaaa").backing_file,
            Some(PathBuf::from("/data/vault.img"))
        );
        assert!(!ctx.vitals.is_dirty());
        assert!(dir.path().join("vitals.json").exists());
    }

    #[test]
    fn test_detached_file_container_becomes_placeholder() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        lsblk_ok(&runner);
        let mut ctx = context(dir.path(), runner.clone());
        let mut ghost = Vital::new("cccc");
        ghost.backing_file = Some(PathBuf::from("/home/joe/old.img"));
        ctx.vitals.put_vital(ghost).unwrap();
        ctx.vitals.ensure_container("dddd", "/mnt/gone");

        let inventory = reconcile(&mut ctx).unwrap();

        assert_eq!(inventory.len(), 3);
        let placeholder = &inventory["cccc"];
        assert!(placeholder.is_placeholder());
        assert!(!placeholder.is_opened());
        assert_eq!(placeholder.display_name(), "~joe/old.img");
        assert!(!inventory.contains_key("dddd"));
    }

    #[test]
    fn test_scan_failure_keeps_previous_inventory() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        lsblk_ok(&runner);
        let mut ctx = context(dir.path(), runner.clone());
        reconcile(&mut ctx).unwrap();

        // unscripted lsblk prints nothing, which is not a report
        assert!(reconcile(&mut ctx).is_err());
        assert_eq!(ctx.inventory().len(), 2);
    }
}
