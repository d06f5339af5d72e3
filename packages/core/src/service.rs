//! Background worker that owns the [`Context`].
//!
//! The caller submits [`Request`]s and reads [`Event`]s; all commands, the
//! busy retries included, run on the worker thread. Between requests the
//! worker reconciles every `poll_interval`.
//!
//! At most one action per container is queued or running. A second submit
//! for the same container fails with [`Error::ActionInFlight`] until the
//! first one reports back.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use snafu::ResultExt;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::orchestrator::{self, ActionReport};
use crate::reconcile::reconcile;
use crate::topology::Inventory;
use crate::validate::{AddFileForm, MountForm};

#[derive(Debug)]
pub enum Request {
    Mount { uuid: String, form: MountForm },
    AddFile { form: AddFileForm },
    Unmount { uuid: String },
    /// Reconcile now and always publish the inventory.
    Refresh,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Inventory after a pass that changed it, or after a refresh.
    Inventory(Inventory),
    ActionDone(ActionReport),
    Failed { key: String, message: String },
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Handle to the worker thread.
pub struct Service {
    requests: Sender<Request>,
    events: Receiver<Event>,
    in_flight: InFlight,
    handle: Option<JoinHandle<()>>,
}

impl Service {
    /// Moves `ctx` onto a new worker thread; the first pass runs right away.
    pub fn spawn(ctx: Context) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let in_flight = InFlight::default();

        let worker_in_flight = in_flight.clone();
        let handle = thread::Builder::new()
            .name("luks-tray-worker".to_string())
            .spawn(move || Worker::new(ctx, event_tx, worker_in_flight).run(request_rx))
            .whatever_context("failed to spawn worker thread")?;

        Ok(Self {
            requests: request_tx,
            events: event_rx,
            in_flight,
            handle: Some(handle),
        })
    }

    pub fn mount(&self, uuid: &str, form: MountForm) -> Result<()> {
        self.submit(
            uuid,
            Request::Mount {
                uuid: uuid.to_string(),
                form,
            },
        )
    }

    /// Queues creation of a new file container, keyed by its backing file.
    pub fn add_file(&self, form: AddFileForm) -> Result<()> {
        let key = form.backing_file.trim().to_string();
        self.submit(&key, Request::AddFile { form })
    }

    pub fn unmount(&self, uuid: &str) -> Result<()> {
        self.submit(
            uuid,
            Request::Unmount {
                uuid: uuid.to_string(),
            },
        )
    }

    pub fn refresh(&self) -> Result<()> {
        self.requests
            .send(Request::Refresh)
            .map_err(|_| Error::WorkerGone)
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Returns true if an action for `key` is queued or running.
    pub fn is_busy(&self, key: &str) -> bool {
        lock(&self.in_flight).contains(key)
    }

    /// Stops the worker after the current request and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn submit(&self, key: &str, request: Request) -> Result<()> {
        if !lock(&self.in_flight).insert(key.to_string()) {
            return Err(Error::ActionInFlight {
                uuid: key.to_string(),
            });
        }
        if self.requests.send(request).is_err() {
            lock(&self.in_flight).remove(key);
            return Err(Error::WorkerGone);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(Request::Shutdown);
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    // the set stays consistent even if a holder panicked
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    ctx: Context,
    events: Sender<Event>,
    in_flight: InFlight,
    last: Option<Inventory>,
}

impl Worker {
    fn new(ctx: Context, events: Sender<Event>, in_flight: InFlight) -> Self {
        Self {
            ctx,
            events,
            in_flight,
            last: None,
        }
    }

    fn run(mut self, requests: Receiver<Request>) {
        let interval = self.ctx.config.poll_interval();
        info!(interval_secs = interval.as_secs(), "worker started");
        self.poll(true);
        let mut next_poll = Instant::now() + interval;

        loop {
            let timeout = next_poll.saturating_duration_since(Instant::now());
            match requests.recv_timeout(timeout) {
                Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Request::Refresh) => {
                    self.poll(true);
                    next_poll = Instant::now() + interval;
                }
                Ok(Request::Mount { uuid, form }) => {
                    let result = orchestrator::mount(&mut self.ctx, &uuid, &form);
                    self.finish(&uuid, result);
                }
                Ok(Request::AddFile { form }) => {
                    let key = form.backing_file.trim().to_string();
                    let report = orchestrator::add_file(&mut self.ctx, &form);
                    self.finish(&key, Ok(report));
                }
                Ok(Request::Unmount { uuid }) => {
                    let result = orchestrator::unmount(&mut self.ctx, &uuid);
                    self.finish(&uuid, result);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.poll(false);
                    next_poll = Instant::now() + interval;
                }
            }
        }
        info!("worker stopped");
    }

    /// Reconciles and publishes the inventory if it changed or `force` is set.
    fn poll(&mut self, force: bool) {
        match reconcile(&mut self.ctx) {
            Ok(inventory) => {
                if force || self.last.as_ref() != Some(inventory) {
                    let inventory = inventory.clone();
                    self.last = Some(inventory.clone());
                    self.send(Event::Inventory(inventory));
                }
            }
            Err(e) => {
                error!(error = %e, "reconciliation failed");
                self.send(Event::Failed {
                    key: String::new(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn finish(&mut self, key: &str, result: Result<ActionReport>) {
        lock(&self.in_flight).remove(key);
        match result {
            Ok(report) => self.send(Event::ActionDone(report)),
            Err(e) => self.send(Event::Failed {
                key: key.to_string(),
                message: format!("ERR: {}", e),
            }),
        }
        // actions rescan on their own; publish what they found
        let inventory = self.ctx.inventory().clone();
        if self.last.as_ref() != Some(&inventory) {
            self.last = Some(inventory.clone());
            self.send(Event::Inventory(inventory));
        }
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::testing::FakeRunner;
    use crate::executor::{CommandOutput, CommandRunner};
    use crate::host::testing::FakeHost;
    use crate::vitals::{Secret, VitalsStore};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(5);

    const LSBLK: &str = r#"{"blockdevices": [
        {"name": "sda", "type": "disk", "children": [
            {"name": "sda2", "type": "part", "fstype": "crypto_LUKS", "uuid": "bbbb",
             "mountpoints": [null]}
        ]}
    ]}"#;

    /// Holds `cryptsetup` commands until the test opens the gate.
    struct GatedRunner {
        inner: FakeRunner,
        gate: Mutex<Receiver<()>>,
    }

    impl CommandRunner for GatedRunner {
        fn run(&self, argv: &[String], input: Option<&str>) -> Result<CommandOutput> {
            if argv.first().map(String::as_str) == Some("cryptsetup") {
                let _ = self.gate.lock().unwrap().recv_timeout(WAIT);
            }
            if argv.first().map(String::as_str) == Some("lsblk") {
                return Ok(CommandOutput {
                    code: 0,
                    stdout: LSBLK.to_string(),
                    stderr: String::new(),
                });
            }
            self.inner.run(argv, input)
        }
    }

    fn context(dir: &Path, runner: Box<dyn CommandRunner + Send>) -> Context {
        let vitals = VitalsStore::new(dir.join("vitals.json"), dir.join("secrets.json"));
        Context::new(
            Config::default(),
            runner,
            Box::new(FakeHost::default()),
            vitals,
        )
        .with_ids(1000, 1000)
    }

    fn form(mount_point: &Path) -> MountForm {
        MountForm {
            password: Secret::new("pw"),
            mount_point: mount_point.display().to_string(),
            delay_minutes: "60".to_string(),
            repeat_minutes: "5".to_string(),
        }
    }

    fn next_report(service: &Service) -> ActionReport {
        loop {
            match service.events().recv_timeout(WAIT).unwrap() {
                Event::ActionDone(report) => return report,
                Event::Failed { message, .. } => panic!("unexpected failure: {}", message),
                Event::Inventory(_) => continue,
            }
        }
    }

    #[test]
    fn test_publishes_inventory_on_start_and_refresh() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        for _ in 0..4 {
            runner.script(
                "lsblk",
                vec![CommandOutput {
                    code: 0,
                    stdout: LSBLK.to_string(),
                    stderr: String::new(),
                }],
            );
        }
        let service = Service::spawn(context(dir.path(), Box::new(runner.clone()))).unwrap();

        match service.events().recv_timeout(WAIT).unwrap() {
            Event::Inventory(inventory) => assert!(inventory.contains_key("bbbb")),
            other => panic!("unexpected event {:?}", other),
        }

        service.refresh().unwrap();
        match service.events().recv_timeout(WAIT).unwrap() {
            Event::Inventory(inventory) => assert_eq!(inventory.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
        service.shutdown();
    }

    #[test]
    fn test_second_action_for_same_container_is_refused() {
        let dir = tempdir().unwrap();
        let target = tempdir().unwrap();
        let (open_gate, gate) = mpsc::channel();
        let runner = GatedRunner {
            inner: FakeRunner::default(),
            gate: Mutex::new(gate),
        };
        let service = Service::spawn(context(dir.path(), Box::new(runner))).unwrap();

        service.mount("bbbb", form(target.path())).unwrap();
        assert!(service.is_busy("bbbb"));
        let err = service.unmount("bbbb").unwrap_err();
        assert!(matches!(err, Error::ActionInFlight { .. }));

        open_gate.send(()).unwrap();
        let report = next_report(&service);
        assert_eq!(report.uuid, "bbbb");
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(!service.is_busy("bbbb"));

        service.unmount("bbbb").unwrap();
        let report = next_report(&service);
        assert_eq!(report.uuid, "bbbb");
    }

    #[test]
    fn test_unknown_container_reports_failure() {
        let dir = tempdir().unwrap();
        let target = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let service = Service::spawn(context(dir.path(), Box::new(runner))).unwrap();

        service.mount("zzzz", form(target.path())).unwrap();
        let message = loop {
            match service.events().recv_timeout(WAIT).unwrap() {
                Event::Failed { key, message } if key == "zzzz" => break message,
                _ => continue,
            }
        };
        assert_eq!(message, "ERR: container w UUID=zzzz not found");
    }
}
