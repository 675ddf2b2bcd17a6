use crate::deadline::ExecBackend;
use crate::env::{ModelEnv, CONTROLLER_MODEL_NAME};
use crate::error::CommandError;
use crate::status::Status;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::Instant;
use tracing::debug;

/// A client shared between the lifecycle manager's regions. The driving and
/// teardown clients may be the same handle or two handles over the same
/// configuration home.
pub type SharedClient = Rc<RefCell<dyn Client>>;

#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub to: Option<String>,
    pub bootstrap_series: Option<String>,
}

/// Capability contract the lifecycle manager requires of a substrate client.
pub trait Client {
    fn env(&self) -> &ModelEnv;
    fn env_mut(&mut self) -> &mut ModelEnv;
    fn backend(&self) -> Rc<ExecBackend>;

    fn bootstrap(&mut self, upload_tools: bool, options: &BootstrapOptions) -> Result<()>;
    fn is_jes_enabled(&self) -> bool;
    fn supports_destroy_environment(&self) -> bool;
    fn destroy_environment(&mut self) -> Result<()>;
    fn kill_controller(&mut self) -> Result<()>;

    fn get_status(&mut self) -> Result<Status>;
    /// A client addressing the reserved administrative model, backed by the
    /// same configuration home and deadline state.
    fn get_controller_client(&self) -> Box<dyn Client>;
    /// May fail when the controller is unreachable.
    fn iter_model_clients(&mut self) -> Result<Vec<Box<dyn Client>>>;
    /// Generic command invocation, wrapped in the deadline check and recorded
    /// in the timing histogram.
    fn juju(&mut self, op: &str, args: &[&str]) -> Result<String>;
    fn add_ssh_machines(&mut self, machines: &[String]) -> Result<()>;

    /// Env-update keys this client version hard-codes itself; the composed
    /// booted region omits them from the environment-update hook.
    fn hardcoded_bootstrap_options(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Builds the driving client for a run. The harness consumes this instead of
/// constructing concrete clients, so tests can substitute fakes.
pub trait ClientFactory {
    fn client_from_config(
        &self,
        env_name: &str,
        juju_bin: &Path,
        debug: bool,
        soft_deadline: Option<DateTime<Utc>>,
    ) -> Result<SharedClient>;
}

/// Version-specific behaviour held as data rather than an inheritance chain.
/// Two variants cover the closed set of supported substrate generations:
/// legacy single-environment (1.x) and multi-model (2.x).
#[derive(Debug, Clone)]
pub struct VersionProfile {
    pub version: String,
    pub jes_enabled: bool,
    pub has_destroy_environment: bool,
    /// Flag used to address a model on the command line.
    pub model_flag: &'static str,
    /// Env-update keys the bootstrap command of this generation replaces.
    pub bootstrap_replaces: BTreeSet<String>,
}

impl VersionProfile {
    pub fn for_version(version: &str) -> Self {
        if version.starts_with("1.") {
            Self::legacy(version)
        } else {
            Self::multi_model(version)
        }
    }

    pub fn legacy(version: &str) -> Self {
        Self {
            version: version.to_string(),
            jes_enabled: false,
            has_destroy_environment: true,
            model_flag: "-e",
            bootstrap_replaces: BTreeSet::new(),
        }
    }

    pub fn multi_model(version: &str) -> Self {
        Self {
            version: version.to_string(),
            jes_enabled: true,
            has_destroy_environment: false,
            model_flag: "-m",
            bootstrap_replaces: ["series", "bootstrap_host", "agent_stream"]
                .iter()
                .map(|key| key.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

/// Client adapter that translates the capability contract into invocations of
/// the substrate binary.
pub struct SubstrateClient {
    env: ModelEnv,
    juju_bin: PathBuf,
    profile: VersionProfile,
    debug: bool,
    backend: Rc<ExecBackend>,
}

impl SubstrateClient {
    pub fn new(
        env: ModelEnv,
        juju_bin: impl Into<PathBuf>,
        version: &str,
        debug: bool,
        soft_deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            env,
            juju_bin: juju_bin.into(),
            profile: VersionProfile::for_version(version),
            debug,
            backend: ExecBackend::with_deadline(soft_deadline),
        }
    }

    pub fn profile(&self) -> &VersionProfile {
        &self.profile
    }

    /// Query the binary for its version string.
    pub fn discover_version(juju_bin: &Path) -> Result<String> {
        let output = Command::new(juju_bin)
            .arg("--version")
            .output()
            .with_context(|| format!("could not run {}", juju_bin.display()))?;
        if !output.status.success() {
            return Err(anyhow!("{} --version failed", juju_bin.display()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn model_client(&self, model_name: &str) -> Box<dyn Client> {
        let mut env = self.env.clone();
        env.environment = model_name.to_string();
        Box::new(Self {
            env,
            juju_bin: self.juju_bin.clone(),
            profile: self.profile.clone(),
            debug: self.debug,
            backend: self.backend.clone(),
        })
    }

    fn run_juju(&self, op: &str, args: &[&str], include_model: bool) -> Result<String> {
        let mut argv: Vec<String> = vec![op.to_string()];
        if self.debug {
            argv.push("--debug".to_string());
        }
        if include_model {
            argv.push(self.profile.model_flag.to_string());
            argv.push(self.env.environment.clone());
        }
        argv.extend(args.iter().map(|arg| arg.to_string()));
        let rendered = format!("{} {}", self.juju_bin.display(), argv.join(" "));
        debug!("running {rendered}");
        self.backend.check_timeouts(|| {
            let started = Instant::now();
            let output = Command::new(&self.juju_bin)
                .args(&argv)
                .env("JUJU_HOME", &self.env.juju_home)
                .env("JUJU_DATA", &self.env.juju_home)
                .output()
                .with_context(|| format!("could not spawn {rendered}"))?;
            self.backend
                .record_timing("juju", op, started.elapsed().as_secs_f64());
            if !output.status.success() {
                return Err(CommandError {
                    command: rendered.clone(),
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }
                .into());
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

impl Client for SubstrateClient {
    fn env(&self) -> &ModelEnv {
        &self.env
    }

    fn env_mut(&mut self) -> &mut ModelEnv {
        &mut self.env
    }

    fn backend(&self) -> Rc<ExecBackend> {
        self.backend.clone()
    }

    fn bootstrap(&mut self, upload_tools: bool, options: &BootstrapOptions) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        if self.profile.jes_enabled {
            // 2.x bootstrap takes cloud/region and controller positionally.
            let cloud = match self.env.config.get("region").and_then(|v| v.as_str()) {
                Some(region) => format!("{}/{}", self.env.provider_type(), region),
                None => self.env.provider_type().to_string(),
            };
            args.push(cloud);
            args.push(self.env.controller_name.clone());
        }
        if upload_tools {
            args.push("--upload-tools".to_string());
        }
        if let Some(to) = &options.to {
            args.push("--to".to_string());
            args.push(to.clone());
        }
        if let Some(series) = &options.bootstrap_series {
            args.push("--bootstrap-series".to_string());
            args.push(series.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_juju("bootstrap", &arg_refs, !self.profile.jes_enabled)?;
        Ok(())
    }

    fn is_jes_enabled(&self) -> bool {
        self.profile.jes_enabled
    }

    fn supports_destroy_environment(&self) -> bool {
        self.profile.has_destroy_environment
    }

    fn destroy_environment(&mut self) -> Result<()> {
        let name = self.env.environment.clone();
        self.run_juju("destroy-environment", &[&name, "--force", "--yes"], false)?;
        Ok(())
    }

    fn kill_controller(&mut self) -> Result<()> {
        let name = self.env.controller_name.clone();
        self.run_juju("kill-controller", &[&name, "--yes"], false)?;
        Ok(())
    }

    fn get_status(&mut self) -> Result<Status> {
        let text = self.run_juju("status", &["--format", "json"], true)?;
        Status::from_json(&text)
    }

    fn get_controller_client(&self) -> Box<dyn Client> {
        self.model_client(CONTROLLER_MODEL_NAME)
    }

    fn iter_model_clients(&mut self) -> Result<Vec<Box<dyn Client>>> {
        if !self.profile.jes_enabled {
            return Ok(vec![self.model_client(&self.env.environment)]);
        }
        let text = self.run_juju("models", &["--format", "json"], false)?;
        let listing: ModelList =
            serde_json::from_str(&text).context("could not parse model listing")?;
        if listing.models.is_empty() {
            return Err(anyhow!("controller reported no models"));
        }
        Ok(listing
            .models
            .iter()
            .map(|model| self.model_client(&model.name))
            .collect())
    }

    fn juju(&mut self, op: &str, args: &[&str]) -> Result<String> {
        self.run_juju(op, args, true)
    }

    fn add_ssh_machines(&mut self, machines: &[String]) -> Result<()> {
        for machine in machines {
            let target = format!("ssh:{machine}");
            self.run_juju("add-machine", &[&target], true)?;
        }
        Ok(())
    }

    fn hardcoded_bootstrap_options(&self) -> BTreeSet<String> {
        self.profile.bootstrap_replaces.clone()
    }
}

/// Default factory: loads the environment from the configuration home and
/// selects a version profile by asking the binary.
pub struct SubstrateClientFactory {
    pub config_home: PathBuf,
}

impl SubstrateClientFactory {
    pub fn new(config_home: impl Into<PathBuf>) -> Self {
        Self {
            config_home: config_home.into(),
        }
    }
}

impl ClientFactory for SubstrateClientFactory {
    fn client_from_config(
        &self,
        env_name: &str,
        juju_bin: &Path,
        debug: bool,
        soft_deadline: Option<DateTime<Utc>>,
    ) -> Result<SharedClient> {
        let env = ModelEnv::from_config_home(env_name, &self.config_home)?;
        let version = SubstrateClient::discover_version(juju_bin)?;
        Ok(Rc::new(RefCell::new(SubstrateClient::new(
            env,
            juju_bin,
            &version,
            debug,
            soft_deadline,
        ))))
    }
}

/// The controller client targets the reserved administrative model.
pub fn is_controller_client(client: &dyn Client) -> bool {
    client.env().environment == CONTROLLER_MODEL_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_profile_selection() {
        let legacy = VersionProfile::for_version("1.25.6");
        assert!(!legacy.jes_enabled);
        assert!(legacy.has_destroy_environment);
        assert_eq!(legacy.model_flag, "-e");
        assert!(legacy.bootstrap_replaces.is_empty());

        let current = VersionProfile::for_version("2.0.1");
        assert!(current.jes_enabled);
        assert!(!current.has_destroy_environment);
        assert_eq!(current.model_flag, "-m");
        assert!(current.bootstrap_replaces.contains("bootstrap_host"));
    }

    #[test]
    fn model_listing_parses() {
        let listing: ModelList = serde_json::from_str(
            r#"{"models": [{"name": "controller"}, {"name": "name"}]}"#,
        )
        .expect("parse models");
        let names: Vec<&str> = listing.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["controller", "name"]);
    }
}
