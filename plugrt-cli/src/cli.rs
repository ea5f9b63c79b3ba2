//! Command-line arguments

use clap::{ArgAction, Parser, Subcommand};
use plugrt_host::{ConfigError, RuntimeConfig};
use std::path::PathBuf;

/// Application name used for the default plugin root
pub const APP_NAME: &str = "plugrt";

#[derive(Debug, Parser)]
#[command(name = "plugrt", version, about = "Discover, build and load plugrt plugins")]
pub struct Cli {
    /// Plugin root directory (overrides the configuration file)
    #[arg(long, global = true, env = "PLUGRT_ROOT")]
    pub root: Option<PathBuf>,

    /// JSON runtime configuration file
    #[arg(long, global = true, env = "PLUGRT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Wasm module offered to every plugin as a library (repeatable)
    #[arg(long = "library", global = true, value_name = "FILE")]
    pub libraries: Vec<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List catalogued plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Load plugins by name
    Load {
        #[arg(required = true)]
        names: Vec<String>,

        /// Show each plugin after loading it
        #[arg(long)]
        show: bool,
    },

    /// Load every plugin flagged for startup
    Startup,

    /// Unload a plugin and delete its file
    Uninstall { name: String },
}

impl Cli {
    /// Runtime configuration from `--config`, `--root` or the platform default
    pub fn runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::for_app(APP_NAME),
        };
        if let Some(root) = &self.root {
            config.plugin_root = root.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_load() {
        let cli = Cli::try_parse_from([
            "plugrt", "load", "Legend", "Slope", "--show", "--root", "/srv/plugins", "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.root, Some(PathBuf::from("/srv/plugins")));
        match cli.command {
            Command::Load { names, show } => {
                assert_eq!(names, vec!["Legend", "Slope"]);
                assert!(show);
            }
            other => panic!("Expected Load, got {:?}", other),
        }
    }

    #[test]
    fn test_load_requires_a_name() {
        assert!(Cli::try_parse_from(["plugrt", "load"]).is_err());
    }

    #[test]
    fn test_root_overrides_config_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let config_path = temp.path().join("runtime.json");
        std::fs::write(
            &config_path,
            r#"{ "plugin_root": "/from/file", "fuel_limit": 5 }"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "plugrt",
            "--config",
            config_path.to_str().unwrap(),
            "--root",
            "/from/flag",
            "startup",
        ])
        .unwrap();
        let config = cli.runtime_config().unwrap();

        assert_eq!(config.plugin_root, PathBuf::from("/from/flag"));
        assert_eq!(config.fuel_limit, 5);
    }
}
