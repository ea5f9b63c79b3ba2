//! plugrt: command-line front end for the plugin runtime
//!
//! ```text
//! plugrt list
//! plugrt --root ./plugins load Legend --show
//! plugrt startup
//! plugrt uninstall Legend
//! ```
//!
//! Logs go to stderr and follow `RUST_LOG` (default `info`).

mod cli;
mod commands;
mod console;

use clap::Parser;
use cli::Cli;
use console::ConsoleHost;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_subscriber(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(cli.verbose);

    let host = Arc::new(ConsoleHost::current());
    let stdout = std::io::stdout();
    match commands::run(&cli, host, &mut stdout.lock()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
