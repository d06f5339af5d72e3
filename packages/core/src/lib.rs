//! luks-tray-core: Core library for managing LUKS containers from a tray.
//!
//! This library discovers LUKS containers (partitions, whole disks and
//! loop-mounted container files), unlocks and mounts them, unmounts and
//! closes them, and remembers per-container preferences between runs.
//!
//! # Modules
//!
//! - [`topology`]: Container discovery using `lsblk`
//! - [`container`]: Container data model
//! - [`executor`]: Command execution with busy retry
//! - [`host`]: sysfs and mount table access
//! - [`mounts`]: `/proc/mounts` parsing
//! - [`vitals`]: Persisted per-container preferences
//! - [`validate`]: Checks on user-entered action parameters
//! - [`orchestrator`]: Mount and unmount sequences
//! - [`reconcile`]: Merging live topology with remembered containers
//! - [`service`]: Background worker
//! - [`config`]: Configuration file
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use luks_tray_core::{Config, Context, reconcile, orchestrator};
//! use luks_tray_core::validate::MountForm;
//! use luks_tray_core::vitals::Secret;
//!
//! let config = Config::load(&luks_tray_core::config::default_path().unwrap()).unwrap();
//! let mut ctx = Context::from_config(config).unwrap();
//!
//! // Scan and merge with remembered containers
//! let inventory = reconcile::reconcile(&mut ctx).unwrap();
//! let locked: Vec<String> = inventory
//!     .values()
//!     .filter(|c| !c.is_opened())
//!     .map(|c| c.uuid.clone())
//!     .collect();
//!
//! // Mount the first locked container (requires root)
//! if let Some(uuid) = locked.first() {
//!     let form = MountForm {
//!         password: Secret::new("correct horse"),
//!         mount_point: "/mnt/vault".to_string(),
//!         delay_minutes: "60".to_string(),
//!         repeat_minutes: "5".to_string(),
//!     };
//!     let report = orchestrator::mount(&mut ctx, uuid, &form).unwrap();
//!     for line in &report.errors {
//!         eprintln!("{}", line);
//!     }
//! }
//! ```

pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod mounts;
pub mod orchestrator;
pub mod reconcile;
pub mod service;
pub mod topology;
pub mod validate;
pub mod vitals;

// Re-export commonly used types
pub use config::Config;
pub use container::{Container, ContainerState, TraySummary};
pub use context::Context;
pub use error::{Error, Result};
pub use orchestrator::{ActionReport, ActionState};
pub use service::{Event, Service};
pub use topology::Inventory;
pub use vitals::{Secret, Vital, VitalsStore};
