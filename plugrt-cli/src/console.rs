//! Host implementation for running plugins from a terminal

use plugrt_host::{Host, Registration};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Records registrations so the command can print them
#[derive(Debug)]
pub struct ConsoleHost {
    application_path: PathBuf,
    registrations: Mutex<Vec<(String, Registration)>>,
}

impl ConsoleHost {
    pub fn new(application_path: impl Into<PathBuf>) -> Self {
        Self {
            application_path: application_path.into(),
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Host rooted at the directory of the running executable
    pub fn current() -> Self {
        let application_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(application_path)
    }

    /// Registrations received since the last call
    pub fn take(&self) -> Vec<(String, Registration)> {
        let mut registrations = match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *registrations)
    }
}

impl Host for ConsoleHost {
    fn application_path(&self) -> &Path {
        &self.application_path
    }

    fn register(&self, plugin: &str, registration: Registration) -> anyhow::Result<()> {
        tracing::debug!(
            plugin,
            kind = %registration.kind,
            name = %registration.name,
            "Registration received"
        );
        let mut registrations = match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registrations.push((plugin.to_string(), registration));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_drains() {
        let host = ConsoleHost::new("/opt/atlas");
        host.register("Legend", Registration::new("menu", "Legend"))
            .unwrap();

        assert_eq!(host.take().len(), 1);
        assert!(host.take().is_empty());
        assert_eq!(host.application_path(), Path::new("/opt/atlas"));
    }
}
