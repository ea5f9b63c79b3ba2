//! Subcommand implementations

use crate::cli::{Cli, Command};
use crate::console::ConsoleHost;
use anyhow::{anyhow, Context};
use plugrt_host::{CompilerRegistry, LifecycleManager, RecordId};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

/// Run the parsed command, writing user-facing output to `out`
pub fn run(cli: &Cli, host: Arc<ConsoleHost>, out: &mut dyn Write) -> anyhow::Result<ExitCode> {
    let mut manager = open(cli, host.clone())?;

    let code = match &cli.command {
        Command::List { json } => {
            list(&manager, *json, out)?;
            ExitCode::SUCCESS
        }
        Command::Load { names, show } => {
            for name in names {
                let id = find(&manager, name)?;
                manager
                    .load(id)
                    .with_context(|| format!("Failed to load {}", name))?;
                if *show {
                    manager.set_visible(name, true)?;
                }
                writeln!(out, "loaded {}", name)?;
                print_registrations(&host, out)?;
            }
            ExitCode::SUCCESS
        }
        Command::Startup => {
            let report = manager.load_startup_plugins();
            for id in &report.succeeded {
                if let Some(record) = manager.record(*id) {
                    writeln!(out, "loaded {}", record.name)?;
                }
            }
            print_registrations(&host, out)?;
            for (_, name, err) in &report.failures {
                writeln!(out, "failed {}: {}", name, err)?;
            }
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Uninstall { name } => {
            let id = find(&manager, name)?;
            manager
                .uninstall(id)
                .with_context(|| format!("Failed to uninstall {}", name))?;
            writeln!(out, "uninstalled {}", name)?;
            ExitCode::SUCCESS
        }
    };

    let disposed = manager.dispose_all();
    for (_, name, err) in &disposed.failures {
        tracing::warn!(plugin = %name, error = %err, "Plugin did not unload cleanly");
    }

    Ok(code)
}

/// Build the manager and scan its root
fn open(cli: &Cli, host: Arc<ConsoleHost>) -> anyhow::Result<LifecycleManager> {
    let config = cli.runtime_config()?;
    let mut manager = LifecycleManager::new(config, CompilerRegistry::with_defaults(), host)?;

    for path in &cli.libraries {
        let name = manager
            .host_libraries_mut()
            .add_file(path)
            .with_context(|| format!("Failed to add library {}", path.display()))?;
        tracing::debug!(library = %name, "Host library added");
    }

    let scan = manager.scan();
    tracing::info!(
        root = %manager.plugin_root().display(),
        found = scan.added.len(),
        skipped = scan.failures.len(),
        "Plugin root scanned"
    );
    Ok(manager)
}

fn find(manager: &LifecycleManager, name: &str) -> anyhow::Result<RecordId> {
    manager
        .find(name)
        .ok_or_else(|| anyhow!("No plugin named '{}' under {}", name, manager.plugin_root().display()))
}

fn list(manager: &LifecycleManager, json: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    if json {
        let records: Vec<serde_json::Value> = manager
            .records()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "description": r.description,
                    "version": r.version,
                    "state": r.state().to_string(),
                    "auto_load": r.auto_load,
                    "references": r.references,
                    "path": r.full_path().map(|p| p.display().to_string()),
                })
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }

    if manager.catalog().is_empty() {
        writeln!(out, "No plugins found under {}", manager.plugin_root().display())?;
        return Ok(());
    }

    for record in manager.records() {
        let startup = if record.auto_load { "startup" } else { "" };
        let path = record
            .full_path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        writeln!(
            out,
            "{:<24} {:<10} {:<8} {}",
            record.name,
            record.state(),
            startup,
            path
        )?;
    }
    Ok(())
}

fn print_registrations(host: &ConsoleHost, out: &mut dyn Write) -> std::io::Result<()> {
    for (plugin, registration) in host.take() {
        writeln!(
            out,
            "  {} registered {} '{}'",
            plugin, registration.kind, registration.name
        )?;
    }
    Ok(())
}
