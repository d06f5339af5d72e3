use std::io::{IsTerminal, Read};
use std::process::ExitCode;

use luks_tray_core::validate::{AddFileForm, MountForm};
use luks_tray_core::{
    ActionReport, Config, Container, ContainerState, Context, Event, Inventory, Result, Secret,
    Service, TraySummary, orchestrator, reconcile,
};
use snafu::ResultExt;

pub(crate) struct AddFileArgs {
    pub(crate) file: String,
    pub(crate) size: String,
    pub(crate) mount_point: String,
    pub(crate) delay: String,
    pub(crate) repeat: String,
}

pub(crate) fn scan(config: Config, json: bool) -> Result<ExitCode> {
    let mut ctx = Context::from_config(config)?;
    let inventory = reconcile::reconcile(&mut ctx)?;

    if json {
        let containers: Vec<&Container> = inventory.values().collect();
        let out = serde_json::to_string_pretty(&containers)
            .whatever_context("failed to encode inventory")?;
        println!("{}", out);
    } else {
        print_inventory(inventory);
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn watch(config: Config) -> Result<ExitCode> {
    let service = Service::spawn(Context::from_config(config)?)?;
    for event in service.events() {
        match event {
            Event::Inventory(inventory) => {
                tracing::debug!(containers = ?inventory.keys().collect::<Vec<_>>(), "inventory changed");
                print_inventory(&inventory)
            }
            Event::ActionDone(report) => print_report(&report),
            Event::Failed { message, .. } => eprintln!("{}", message),
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn mount(
    config: Config,
    uuid: &str,
    mount_point: Option<String>,
    delay: Option<String>,
    repeat: Option<String>,
) -> Result<ExitCode> {
    let mut ctx = Context::from_config(config)?;
    reconcile::reconcile(&mut ctx)?;

    let vital = ctx.vitals.get_vital(uuid);
    let password = read_password()?;
    let form = MountForm {
        password: if password.is_empty() {
            vital.password.clone()
        } else {
            password
        },
        mount_point: mount_point.unwrap_or_else(|| vital.preferred_mount_point.clone()),
        delay_minutes: delay.unwrap_or_else(|| vital.delay_minutes.to_string()),
        repeat_minutes: repeat.unwrap_or_else(|| vital.repeat_minutes.to_string()),
    };

    let report = orchestrator::mount(&mut ctx, uuid, &form)?;
    print_report(&report);
    Ok(exit_code(&report))
}

pub(crate) fn add_file(config: Config, args: AddFileArgs) -> Result<ExitCode> {
    let mut ctx = Context::from_config(config)?;
    reconcile::reconcile(&mut ctx)?;

    let form = AddFileForm {
        mount: MountForm {
            password: read_password()?,
            mount_point: args.mount_point,
            delay_minutes: args.delay,
            repeat_minutes: args.repeat,
        },
        backing_file: args.file,
        size_mib: args.size,
    };

    let report = orchestrator::add_file(&mut ctx, &form);
    print_report(&report);
    Ok(exit_code(&report))
}

pub(crate) fn unmount(config: Config, uuid: &str) -> Result<ExitCode> {
    let mut ctx = Context::from_config(config)?;
    reconcile::reconcile(&mut ctx)?;

    let report = orchestrator::unmount(&mut ctx, uuid)?;
    print_report(&report);
    Ok(exit_code(&report))
}

pub(crate) fn vitals(config: Config) -> Result<ExitCode> {
    let ctx = Context::from_config(config)?;
    println!("# {}", ctx.vitals.path().display());
    for vital in ctx.vitals.vitals() {
        println!(
            "{}  delay={}m repeat={}m password={} at={} {}",
            vital.uuid,
            vital.delay_minutes,
            vital.repeat_minutes,
            if vital.password.is_empty() { "unset" } else { "set" },
            display_or_dash(&vital.preferred_mount_point),
            vital
                .backing_file
                .as_ref()
                .map(|f| f.display().to_string())
                .unwrap_or_default(),
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// One line from stdin, without the newline. A terminal gets a prompt.
fn read_password() -> Result<Secret> {
    let mut stdin = std::io::stdin();
    let mut input = String::new();
    if stdin.is_terminal() {
        eprint!("Password: ");
        stdin
            .read_line(&mut input)
            .whatever_context("failed to read password")?;
    } else {
        stdin
            .read_to_string(&mut input)
            .whatever_context("failed to read password")?;
    }
    let line = input.lines().next().unwrap_or_default();
    Ok(Secret::new(line))
}

fn print_inventory(inventory: &Inventory) {
    let summary = match TraySummary::of(inventory.values()) {
        TraySummary::NoContainers => "no containers",
        TraySummary::AllLocked => "all locked",
        TraySummary::SomeLocked => "some locked",
        TraySummary::NoneLocked => "none locked",
    };
    println!("# {}", summary);

    for container in inventory.values() {
        let glyph = match container.state() {
            ContainerState::Mounted => "🔓",
            ContainerState::Opened => "⚠",
            ContainerState::Locked => "🔒",
        };
        let mount_point = container
            .mount_point()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!(
            "{} {:<32} {:<24} {}",
            glyph,
            container.display_name(),
            display_or_dash(&mount_point),
            container.uuid
        );
    }
}

fn print_report(report: &ActionReport) {
    if report.errors.is_empty() {
        println!("{}: {:?}", report.uuid, report.state);
        return;
    }
    eprintln!("{}: stopped while {:?}", report.uuid, report.state);
    for line in &report.errors {
        eprintln!("  {}", line);
    }
}

fn exit_code(report: &ActionReport) -> ExitCode {
    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}
