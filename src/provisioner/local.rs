//! Legacy single-host provisioner
//!
//! Drives one host over a remote shell instead of a cluster API. The host
//! runs the platform's `caravel-host` helper for app lifecycle commands;
//! unit inventory is kept in process since there is no backend to ask.
//!
//! Kept for installations that predate cluster-backed pools. New pools
//! should use the cluster-backed provisioner.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::app::App;
use crate::provisioner::{OutputSink, Provisioner, Unit};
use crate::{Error, Result, LOCAL_PROVISIONER};

/// Remote login user for the managed host
const DEFAULT_SSH_USER: &str = "ubuntu";

/// Provisioner backed by a single remote host reached over ssh
pub struct LocalProvisioner {
    host: String,
    user: String,
    units: RwLock<HashMap<String, Vec<Unit>>>,
}

impl LocalProvisioner {
    /// Create a provisioner for the given host with the default login user
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: DEFAULT_SSH_USER.to_string(),
            units: RwLock::new(HashMap::new()),
        }
    }

    /// Override the remote login user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Base ssh invocation for the managed host
    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-l")
            .arg(&self.user)
            .arg("-q")
            .arg("-o")
            .arg("StrictHostKeyChecking no")
            .arg(&self.host);
        cmd
    }

    /// Run a `caravel-host` lifecycle command on the host and wait for it
    async fn run_lifecycle(&self, app: &App, action: &str) -> Result<()> {
        let mut cmd = self.ssh_command();
        cmd.arg("caravel-host").arg(action).arg(&app.name);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(app = %app.name, host = %self.host, action = %action, "running host lifecycle command");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::provision_for(&app.name, format!("ssh spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provision_for(
                &app.name,
                format!("caravel-host {} failed: {}", action, stderr.trim()),
            ));
        }
        Ok(())
    }

    fn record_unit(&self, app: &App) -> Unit {
        let mut units = self.units.write().expect("unit inventory lock poisoned");
        let entry = units.entry(app.name.clone()).or_default();
        let unit = Unit {
            name: format!("{}-{}", app.name, entry.len() + 1),
            app: app.name.clone(),
            address: Some(self.host.clone()),
            status: "running".to_string(),
        };
        entry.push(unit.clone());
        unit
    }

    fn first_unit(&self, app: &App) -> Option<Unit> {
        let units = self.units.read().expect("unit inventory lock poisoned");
        units.get(&app.name).and_then(|u| u.first().cloned())
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn kind(&self) -> &str {
        LOCAL_PROVISIONER
    }

    async fn provision(&self, app: &App) -> Result<()> {
        self.run_lifecycle(app, "start").await?;
        let unit = self.record_unit(app);
        info!(app = %app.name, host = %self.host, unit = %unit.name, "provisioned app on host");
        Ok(())
    }

    async fn destroy(&self, app: &App) -> Result<()> {
        self.run_lifecycle(app, "stop").await?;
        self.units
            .write()
            .expect("unit inventory lock poisoned")
            .remove(&app.name);
        info!(app = %app.name, host = %self.host, "destroyed app on host");
        Ok(())
    }

    async fn add_units(&self, app: &App, count: u32) -> Result<Vec<Unit>> {
        // All units share the one host; adding a unit is bookkeeping plus
        // a host-side scale command.
        self.run_lifecycle(app, "scale-up").await?;
        for _ in 0..count {
            self.record_unit(app);
        }
        let units = self.units.read().expect("unit inventory lock poisoned");
        Ok(units.get(&app.name).cloned().unwrap_or_default())
    }

    async fn remove_unit(&self, app: &App, unit_name: &str) -> Result<()> {
        let mut units = self.units.write().expect("unit inventory lock poisoned");
        let Some(entry) = units.get_mut(&app.name) else {
            return Err(Error::provision_for(
                &app.name,
                format!("no unit {:?} running", unit_name),
            ));
        };
        let before = entry.len();
        entry.retain(|u| u.name != unit_name);
        if entry.len() == before {
            return Err(Error::provision_for(
                &app.name,
                format!("no unit {:?} running", unit_name),
            ));
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        app: &App,
        command: &str,
        args: &[String],
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<()> {
        // The legacy behavior indexed the first unit unchecked; a command
        // against an app with zero units must fail cleanly instead.
        if self.first_unit(app).is_none() {
            return Err(Error::no_unit(&app.name));
        }

        let mut cmd = self.ssh_command();
        cmd.arg(command).args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::provision_for(&app.name, format!("ssh spawn failed: {}", e)))?;

        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal_with_context("local-exec", "missing stdout pipe"))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal_with_context("local-exec", "missing stderr pipe"))?;

        let (out_res, err_res, status) = tokio::join!(
            tokio::io::copy(&mut child_out, stdout),
            tokio::io::copy(&mut child_err, stderr),
            child.wait(),
        );
        out_res.map_err(|e| Error::provision_for(&app.name, format!("stdout stream: {}", e)))?;
        err_res.map_err(|e| Error::provision_for(&app.name, format!("stderr stream: {}", e)))?;

        let status = status
            .map_err(|e| Error::provision_for(&app.name, format!("ssh wait failed: {}", e)))?;
        if !status.success() {
            return Err(Error::provision_for(
                &app.name,
                format!("remote command exited with {}", status),
            ));
        }
        Ok(())
    }

    async fn address(&self, app: &App) -> Result<String> {
        self.first_unit(app)
            .and_then(|u| u.address)
            .ok_or_else(|| Error::no_unit(&app.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner_with_units(app: &App, count: usize) -> LocalProvisioner {
        let prov = LocalProvisioner::new("203.0.113.5");
        for _ in 0..count {
            prov.record_unit(app);
        }
        prov
    }

    #[tokio::test]
    async fn test_address_returns_host_of_first_unit() {
        let app = App::new("app-d", "docker");
        let prov = provisioner_with_units(&app, 2);
        assert_eq!(prov.address(&app).await.unwrap(), "203.0.113.5");
    }

    /// The legacy implementation indexed units[0] and crashed on apps with
    /// no units; the reworked guard must return a clean error instead.
    #[tokio::test]
    async fn test_address_with_zero_units_is_no_unit_error() {
        let app = App::new("app-d", "docker");
        let prov = LocalProvisioner::new("203.0.113.5");
        let err = prov.address(&app).await.unwrap_err();
        assert!(matches!(err, Error::NoUnit { .. }));
    }

    #[tokio::test]
    async fn test_execute_command_with_zero_units_is_no_unit_error() {
        let app = App::new("app-d", "docker");
        let prov = LocalProvisioner::new("203.0.113.5");
        let mut out = Vec::new();
        let mut err_sink = Vec::new();
        let err = prov
            .execute_command(&app, "date", &[], &mut out, &mut err_sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoUnit { .. }));
    }

    #[tokio::test]
    async fn test_remove_unit_updates_inventory() {
        let app = App::new("app-d", "docker");
        let prov = provisioner_with_units(&app, 2);

        prov.remove_unit(&app, "app-d-1").await.unwrap();
        // Remaining unit still answers address queries.
        assert!(prov.address(&app).await.is_ok());

        let err = prov.remove_unit(&app, "app-d-1").await.unwrap_err();
        assert!(matches!(err, Error::Provision { .. }));
    }

    #[test]
    fn test_unit_names_are_sequential_per_app() {
        let app = App::new("app-d", "docker");
        let prov = LocalProvisioner::new("203.0.113.5");
        let first = prov.record_unit(&app);
        let second = prov.record_unit(&app);
        assert_eq!(first.name, "app-d-1");
        assert_eq!(second.name, "app-d-2");
    }
}
