//! Lifecycle harness: bootstrap a control plane, run a verification payload,
//! harvest diagnostics from every machine, and guarantee teardown.

pub mod logs;
pub mod remote;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use stack_core::{
    command_failure, is_controller_client, is_soft_deadline, update_env, BootstrapOptions,
    Client, ClientFactory, EnvUpdateParams, ExecBackend, LoggedError, ModelEnv, SharedClient,
    Terminated, CONTROLLER_MODEL_NAME,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::logs::{archive_logs, copy_remote_logs, dump_juju_timings, safe_print_status, wait_for_port};
use crate::remote::Remote;

const SSH_PORT: u16 = 22;
const PORT_WAIT: Duration = Duration::from_secs(120);

/// Seam between the lifecycle manager and the log harvester, so tests can
/// record harvest decisions without touching any machine.
pub trait LogDumper {
    /// Whether this target is worth harvesting at all.
    fn should_dump(&self, client: &dyn Client) -> bool {
        let _ = client;
        true
    }

    fn dump(
        &self,
        client: &mut dyn Client,
        directory: &Path,
        runtime_config: Option<&Path>,
        known_hosts: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// The real harvester.
pub struct EnvLogDumper;

impl LogDumper for EnvLogDumper {
    fn dump(
        &self,
        client: &mut dyn Client,
        directory: &Path,
        runtime_config: Option<&Path>,
        known_hosts: &BTreeMap<String, String>,
    ) -> Result<()> {
        logs::dump_env_logs_known_hosts(client, directory, runtime_config, known_hosts)
    }
}

/// Parsed invocation parameters, shared between the command-line front end
/// and `BootstrapManager::from_args`.
#[derive(Debug, Clone, Default)]
pub struct RunnerArgs {
    /// Named environment in the configuration home.
    pub env: String,
    pub juju_bin: PathBuf,
    /// Unique run name; the disposable environment is derived from it.
    pub temp_env_name: String,
    pub logs: Option<PathBuf>,
    pub debug: bool,
    pub bootstrap_host: Option<String>,
    pub machines: Vec<String>,
    pub series: Option<String>,
    pub agent_url: Option<String>,
    pub agent_stream: Option<String>,
    pub region: Option<String>,
    pub keep_env: bool,
    pub upload_tools: bool,
    pub multi_model: bool,
    pub deadline: Option<DateTime<Utc>>,
}

/// Deployment parameters and lifecycle flags for one run.
#[derive(Debug, Clone, Default)]
pub struct DeployParams {
    pub bootstrap_host: Option<String>,
    pub machines: Vec<String>,
    pub series: Option<String>,
    pub agent_url: Option<String>,
    pub agent_stream: Option<String>,
    pub region: Option<String>,
    /// None disables timing and log dumps.
    pub log_dir: Option<PathBuf>,
    /// Skip teardown entirely, leaving the environment running.
    pub keep_env: bool,
    /// Keep the isolated configuration home in place after bootstrap.
    pub permanent: bool,
    pub jes_enabled: bool,
}

/// Drives one bootstrap / run / teardown cycle through nested scoped
/// regions. Each region method runs its cleanup on both exit paths, and the
/// regions unwind in reverse order of entry.
pub struct BootstrapManager {
    pub temp_env_name: String,
    client: SharedClient,
    tear_down_client: SharedClient,
    pub machines: Vec<String>,
    pub series: Option<String>,
    pub agent_url: Option<String>,
    pub agent_stream: Option<String>,
    pub region: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub keep_env: bool,
    pub permanent: bool,
    pub jes_enabled: bool,
    /// machine-id to resolved address, used for ssh attachment and log
    /// harvesting.
    pub known_hosts: BTreeMap<String, String>,
    tear_down_count: u32,
    dumper: Rc<dyn LogDumper>,
    wait_port: Box<dyn Fn(&str, u16, Duration) -> Result<()>>,
}

impl std::fmt::Debug for BootstrapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapManager")
            .field("temp_env_name", &self.temp_env_name)
            .field("machines", &self.machines)
            .field("series", &self.series)
            .field("log_dir", &self.log_dir)
            .field("keep_env", &self.keep_env)
            .field("permanent", &self.permanent)
            .field("jes_enabled", &self.jes_enabled)
            .field("known_hosts", &self.known_hosts)
            .field("tear_down_count", &self.tear_down_count)
            .finish_non_exhaustive()
    }
}

impl BootstrapManager {
    pub fn new(
        temp_env_name: impl Into<String>,
        client: SharedClient,
        tear_down_client: SharedClient,
        params: DeployParams,
    ) -> Result<Self> {
        if params.jes_enabled && !params.permanent {
            bail!("a multi-model-enabled run cannot be non-permanent");
        }
        let mut known_hosts = BTreeMap::new();
        if let Some(host) = &params.bootstrap_host {
            known_hosts.insert("0".to_string(), host.clone());
        }
        Ok(Self {
            temp_env_name: temp_env_name.into(),
            client,
            tear_down_client,
            machines: params.machines,
            series: params.series,
            agent_url: params.agent_url,
            agent_stream: params.agent_stream,
            region: params.region,
            log_dir: params.log_dir,
            keep_env: params.keep_env,
            permanent: params.permanent,
            jes_enabled: params.jes_enabled,
            known_hosts,
            tear_down_count: 0,
            dumper: Rc::new(EnvLogDumper),
            wait_port: Box::new(wait_for_port),
        })
    }

    /// Build a manager from parsed invocation parameters and a client
    /// factory. Without an explicit log directory, one is synthesized under
    /// the temp root and created eagerly.
    pub fn from_args(args: &RunnerArgs, factory: &dyn ClientFactory) -> Result<Self> {
        let client =
            factory.client_from_config(&args.env, &args.juju_bin, args.debug, args.deadline)?;
        let jes_enabled = args.multi_model || client.borrow().is_jes_enabled();
        let log_dir = match &args.logs {
            Some(dir) => dir.clone(),
            None => {
                let dir = std::env::temp_dir()
                    .join(&args.temp_env_name)
                    .join("logs")
                    .join(Utc::now().format("%Y%m%d%H%M%S").to_string());
                fs::create_dir_all(&dir)?;
                dir
            }
        };
        Self::new(
            args.temp_env_name.clone(),
            client.clone(),
            client,
            DeployParams {
                bootstrap_host: args.bootstrap_host.clone(),
                machines: args.machines.clone(),
                series: args.series.clone(),
                agent_url: args.agent_url.clone(),
                agent_stream: args.agent_stream.clone(),
                region: args.region.clone(),
                log_dir: Some(log_dir),
                keep_env: args.keep_env,
                permanent: jes_enabled,
                jes_enabled,
            },
        )
    }

    pub fn client(&self) -> SharedClient {
        self.client.clone()
    }

    pub fn tear_down_count(&self) -> u32 {
        self.tear_down_count
    }

    pub fn set_dumper(&mut self, dumper: Rc<dyn LogDumper>) {
        self.dumper = dumper;
    }

    pub fn set_wait_port(&mut self, f: impl Fn(&str, u16, Duration) -> Result<()> + 'static) {
        self.wait_port = Box::new(f);
    }

    fn backends(&self) -> (Rc<ExecBackend>, Rc<ExecBackend>) {
        (
            self.client.borrow().backend(),
            self.tear_down_client.borrow().backend(),
        )
    }

    fn set_homes(&self, home: &Path) {
        self.client.borrow_mut().env_mut().juju_home = home.to_path_buf();
        if !Rc::ptr_eq(&self.client, &self.tear_down_client) {
            self.tear_down_client.borrow_mut().env_mut().juju_home = home.to_path_buf();
        }
    }

    fn mirror_env_to_tear_down_client(&self) {
        if Rc::ptr_eq(&self.client, &self.tear_down_client) {
            return;
        }
        let env = self.client.borrow().env().clone();
        *self.tear_down_client.borrow_mut().env_mut() = env;
    }

    /// Outermost region: no side effects besides dumping the command-timing
    /// histogram on both exit paths (skipped without a log directory).
    pub fn top_context<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        if let Some(log_dir) = &self.log_dir {
            if let Err(err) = dump_juju_timings(&*self.client.borrow(), log_dir) {
                warn!("Could not dump command timings: {err:?}");
            }
        }
        result
    }

    /// Provisioning isolation region. Renames the run's environment to a
    /// disposable `<name>-temp` namespace, points the configuration home at
    /// a nested `isolated` directory for the duration, and on exit restores
    /// the home pointer (unless permanent) and tears down if nothing else
    /// already has. `machines` are waited on for ssh alongside the bootstrap
    /// host; `omit_config` overrides the keys withheld from the
    /// environment-update hook (defaulting to whatever the client version
    /// hard-codes itself).
    pub fn bootstrap_context<T>(
        &mut self,
        machines: &[String],
        omit_config: Option<&BTreeSet<String>>,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let original_home = self.client.borrow().env().juju_home.clone();
        let bootstrap_host = self.known_hosts.get("0").cloned();

        let mut wait_targets = machines.to_vec();
        if let Some(host) = &bootstrap_host {
            wait_targets.push(host.clone());
        }
        for target in &wait_targets {
            info!("Waiting for port {SSH_PORT} on {target}");
            (self.wait_port)(target, SSH_PORT, PORT_WAIT)?;
        }

        let temp_name = format!("{}-temp", self.temp_env_name);
        let params = EnvUpdateParams {
            series: self.series.clone(),
            bootstrap_host,
            agent_url: self.agent_url.clone(),
            agent_stream: self.agent_stream.clone(),
            region: self.region.clone(),
        };
        let omit = match omit_config {
            Some(keys) => keys.clone(),
            None => self.client.borrow().hardcoded_bootstrap_options(),
        };
        let isolated = original_home.join("isolated");
        {
            let mut client = self.client.borrow_mut();
            update_env(client.env_mut(), &temp_name, &params, &omit);
            client.env_mut().juju_home = isolated.clone();
            client.env().dump_yaml(&isolated)?;
        }
        self.mirror_env_to_tear_down_client();

        let result = f(self);

        if !self.permanent {
            self.set_homes(&original_home);
        }
        if self.tear_down_count == 0 && !self.keep_env {
            // A legacy jenv in the isolated home marks a pre-multi-model
            // bootstrap; controller-level destroy would be wrong for it.
            let env_name = self.client.borrow().env().environment.clone();
            let try_jes = !ModelEnv::jenv_path(&isolated, &env_name).exists();
            if let Err(err) = self.tear_down(try_jes) {
                if result.is_ok() {
                    return Err(err);
                }
                warn!("Teardown after a failed bootstrap also failed: {err:?}");
            }
        }
        result
    }

    /// Workload region. Entry resolves the controller machine's address and
    /// attaches any not-yet-known machines; exit harvests logs and then
    /// tears down (unless `keep_env`), on both exit paths.
    pub fn runtime_context<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = self.runtime_entry().and_then(|_| f(self));
        let result = match result {
            Ok(value) => Ok(value),
            Err(err) if is_soft_deadline(&err) || err.is::<LoggedError>() => Err(err),
            Err(err) => {
                safe_print_status(&mut *self.client.borrow_mut());
                error!("{err:?}");
                if let Some(command) = command_failure(&err) {
                    error!("Output from failed command:\n{}", command.stdout);
                    error!("{}", command.stderr);
                }
                Err(LoggedError::wrap(err))
            }
        };
        self.dump_all_logs();
        if !self.keep_env {
            if let Err(err) = self.tear_down(self.jes_enabled) {
                if result.is_ok() {
                    return Err(err);
                }
                warn!("Teardown after a failed run also failed: {err:?}");
            }
        }
        result
    }

    fn runtime_entry(&mut self) -> Result<()> {
        if !self.known_hosts.contains_key("0") {
            let status = self.client.borrow_mut().get_status()?;
            let address = status
                .machine_address("0")
                .ok_or_else(|| anyhow!("no address reported for machine 0"))?
                .to_string();
            self.known_hosts.insert("0".to_string(), address);
        }
        let addable: Vec<String> = self
            .machines
            .iter()
            .filter(|machine| !self.known_hosts.values().any(|known| &known == machine))
            .cloned()
            .collect();
        if !addable.is_empty() {
            self.client.borrow_mut().add_ssh_machines(&addable)?;
        }
        Ok(())
    }

    /// The full composed lifecycle: timing region, provisioning isolation,
    /// the bootstrap call itself, then the workload region. A logged failure
    /// escaping the whole composition converts to the process-termination
    /// signal so it is not reported twice.
    pub fn booted_context<T>(
        &mut self,
        upload_tools: bool,
        options: &BootstrapOptions,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.run_booted(upload_tools, options, true, f)
    }

    /// Same composition against a pre-provisioned environment: the bootstrap
    /// call is skipped, everything else runs.
    pub fn existing_booted_context<T>(
        &mut self,
        upload_tools: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.run_booted(upload_tools, &BootstrapOptions::default(), false, f)
    }

    fn run_booted<T>(
        &mut self,
        upload_tools: bool,
        options: &BootstrapOptions,
        do_bootstrap: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let result = self.top_context(|mgr| {
            let machines = mgr.machines.clone();
            mgr.bootstrap_context(&machines, None, |mgr| {
                if do_bootstrap {
                    mgr.handle_bootstrap_exceptions(|mgr| {
                        let options = mgr.effective_bootstrap_options(options);
                        mgr.client.borrow_mut().bootstrap(upload_tools, &options)
                    })?;
                }
                mgr.runtime_context(f)
            })
        });
        result.map_err(|err| {
            if err.is::<LoggedError>() {
                anyhow::Error::new(Terminated)
            } else {
                err
            }
        })
    }

    /// Versions that hard-code the series in the bootstrap command never see
    /// it through the environment-update hook, so it is forwarded as a
    /// bootstrap option instead.
    fn effective_bootstrap_options(&self, options: &BootstrapOptions) -> BootstrapOptions {
        let mut options = options.clone();
        let hardcoded = self.client.borrow().hardcoded_bootstrap_options();
        if hardcoded.contains("series") && options.bootstrap_series.is_none() {
            options.bootstrap_series = self.series.clone();
        }
        options
    }

    /// Failure boundary around the bootstrap call: log the failure and any
    /// captured output, salvage whatever the bootstrap host already wrote,
    /// and mark the error as reported. The advisory deadline signal passes
    /// through untouched so it is never mistaken for a real bootstrap
    /// failure.
    pub fn handle_bootstrap_exceptions<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) if is_soft_deadline(&err) => Err(err),
            Err(err) => {
                error!("Bootstrap failed: {err:?}");
                if let Some(command) = command_failure(&err) {
                    error!("Output from failed command:\n{}", command.stdout);
                    error!("{}", command.stderr);
                }
                self.salvage_bootstrap_host_logs();
                Err(LoggedError::wrap(err))
            }
        }
    }

    fn salvage_bootstrap_host_logs(&self) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };
        let (driving, teardown) = self.backends();
        driving.ignore_soft_deadline(|| {
            teardown.ignore_soft_deadline(|| {
                if let Some(host) = self.known_hosts.get("0").cloned() {
                    let remote = match &self.series {
                        Some(series) => Remote::with_series(host, series.clone()),
                        None => Remote::from_address(host),
                    };
                    copy_remote_logs(&remote, &log_dir);
                }
                if let Err(err) = archive_logs(&log_dir) {
                    warn!("Could not archive salvaged logs: {err:?}");
                }
            })
        });
    }

    /// Destroy everything the run provisioned. `try_jes` permits
    /// controller-level destruction when the teardown client supports it.
    /// The attempt is recorded even when the destroy fails; mismatched
    /// configuration homes abort before any destructive call.
    pub fn tear_down(&mut self, try_jes: bool) -> Result<()> {
        self.tear_down_count += 1;
        {
            let driving = self.client.borrow();
            let teardown = self.tear_down_client.borrow();
            if driving.env().juju_home != teardown.env().juju_home {
                bail!("tear-down client must share the driving client's configuration home");
            }
        }
        let (driving, teardown) = self.backends();
        let result = driving.ignore_soft_deadline(|| {
            teardown.ignore_soft_deadline(|| {
                let mut client = self.tear_down_client.borrow_mut();
                if try_jes && client.is_jes_enabled() {
                    client.kill_controller()
                } else if client.supports_destroy_environment() {
                    client.destroy_environment()
                } else {
                    client.kill_controller()
                }
            })
        });
        match result {
            Err(err) if is_soft_deadline(&err) => {
                warn!("Deadline expired during teardown; environment destroyed anyway");
                Ok(())
            }
            other => other,
        }
    }

    /// Harvest logs for every reachable target, deadline-exempt throughout.
    /// No-op without a log directory; partial collection beats none, so
    /// model-iteration failure degrades to the driving client plus a
    /// synthesized controller client, and per-target failures are warnings.
    pub fn dump_all_logs(&self) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };
        let dumper = self.dumper.clone();
        let (driving, teardown) = self.backends();
        driving.ignore_soft_deadline(|| {
            teardown.ignore_soft_deadline(|| {
                if !self.jes_enabled {
                    let (home, name) = {
                        let client = self.client.borrow();
                        (client.env().juju_home.clone(), client.env().environment.clone())
                    };
                    let jenv = ModelEnv::jenv_path(&home, &name);
                    let runtime_config = jenv.exists().then_some(jenv);
                    self.dump_one(
                        dumper.as_ref(),
                        &mut *self.client.borrow_mut(),
                        &log_dir,
                        runtime_config.as_deref(),
                    );
                    return;
                }
                let iteration = self.client.borrow_mut().iter_model_clients();
                let model_clients = match iteration {
                    Ok(clients) => clients,
                    Err(err) => {
                        warn!("Could not enumerate model clients for log collection: {err:?}");
                        // The controller model still holds the logs that
                        // explain why the listing failed.
                        let mut controller = self.client.borrow().get_controller_client();
                        self.dump_one(
                            dumper.as_ref(),
                            &mut *self.client.borrow_mut(),
                            &log_dir,
                            None,
                        );
                        let cache = ModelEnv::cache_path(&controller.env().juju_home);
                        self.dump_one(
                            dumper.as_ref(),
                            controller.as_mut(),
                            &log_dir,
                            Some(&cache),
                        );
                        return;
                    }
                };
                for mut model_client in model_clients {
                    let runtime_config = is_controller_client(model_client.as_ref())
                        .then(|| ModelEnv::cache_path(&model_client.env().juju_home));
                    self.dump_one(
                        dumper.as_ref(),
                        model_client.as_mut(),
                        &log_dir,
                        runtime_config.as_deref(),
                    );
                }
            })
        });
    }

    fn dump_one(
        &self,
        dumper: &dyn LogDumper,
        client: &mut dyn Client,
        log_dir: &Path,
        runtime_config: Option<&Path>,
    ) {
        let model_name = client.env().environment.clone();
        if !dumper.should_dump(client) {
            info!("Skipping log collection for {model_name}");
            return;
        }
        let subdir = if is_controller_client(client) {
            CONTROLLER_MODEL_NAME.to_string()
        } else {
            model_name.clone()
        };
        let directory = log_dir.join(subdir);
        if let Err(err) = fs::create_dir_all(&directory) {
            warn!("Could not create {}: {err}", directory.display());
            return;
        }
        if let Err(err) = dumper.dump(client, &directory, runtime_config, &self.known_hosts) {
            warn!("Log collection failed for {model_name}: {err:?}");
        }
    }
}
