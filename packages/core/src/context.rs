//! Explicit state shared by reconciliation and the orchestrator.

use crate::config::{Config, invoking_ids};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, SystemRunner};
use crate::host::{Host, SystemHost};
use crate::topology::Inventory;
use crate::vitals::VitalsStore;

/// Everything an action needs: configuration, the two system seams, the
/// vitals store and the most recent inventory.
pub struct Context {
    pub config: Config,
    pub runner: Box<dyn CommandRunner + Send>,
    pub host: Box<dyn Host + Send>,
    pub vitals: VitalsStore,
    /// Owner of rebound mount points.
    pub uid: u32,
    pub gid: u32,
    inventory: Inventory,
}

impl Context {
    pub fn new(
        config: Config,
        runner: Box<dyn CommandRunner + Send>,
        host: Box<dyn Host + Send>,
        vitals: VitalsStore,
    ) -> Self {
        let (uid, gid) = invoking_ids();
        Self {
            config,
            runner,
            host,
            vitals,
            uid,
            gid,
            inventory: Inventory::new(),
        }
    }

    /// Builds a context backed by the real system and restores the vitals.
    pub fn from_config(config: Config) -> Result<Self> {
        let runner = SystemRunner::with_escalation(config.escalation);
        let host = SystemHost::new(&config.sys_root, &config.mounts_path);
        let vitals = VitalsStore::load(config.vitals_path()?, config.secrets_path()?);
        Ok(Self::new(config, Box::new(runner), Box::new(host), vitals))
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Containers from the last reconciliation, placeholders included.
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn container(&self, uuid: &str) -> Result<&Container> {
        self.inventory.get(uuid).ok_or_else(|| Error::ContainerNotFound {
            uuid: uuid.to_string(),
        })
    }

    pub(crate) fn set_inventory(&mut self, inventory: Inventory) {
        self.inventory = inventory;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("vitals", &self.vitals)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("containers", &self.inventory.len())
            .finish_non_exhaustive()
    }
}
