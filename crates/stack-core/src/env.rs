use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Reserved model name of the administrative control-plane model.
pub const CONTROLLER_MODEL_NAME: &str = "controller";

/// Configuration of one model/environment plus the configuration home it
/// lives under. The driving and teardown clients of a run must reference the
/// same configuration home; the lifecycle manager asserts this before any
/// destructive call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEnv {
    pub environment: String,
    pub controller_name: String,
    pub juju_home: PathBuf,
    pub config: BTreeMap<String, Value>,
}

impl ModelEnv {
    pub fn new(
        name: impl Into<String>,
        config: BTreeMap<String, Value>,
        juju_home: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        Self {
            controller_name: name.clone(),
            environment: name,
            juju_home: juju_home.into(),
            config,
        }
    }

    /// Load the named environment from `<home>/environments.yaml`.
    pub fn from_config_home(name: &str, home: &Path) -> Result<Self> {
        let path = Self::environments_path(home);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let doc: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("could not parse {}", path.display()))?;
        let config = doc
            .get("environments")
            .and_then(|envs| envs.get(name))
            .ok_or_else(|| anyhow!("no environment {name} in {}", path.display()))?;
        let config: BTreeMap<String, Value> = serde_json::from_value(config.clone())
            .with_context(|| format!("environment {name} is not a mapping"))?;
        Ok(Self::new(name, config, home))
    }

    pub fn provider_type(&self) -> &str {
        self.config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Local provider: agents run on the harness host and logs are plain
    /// files under the configuration home.
    pub fn is_local(&self) -> bool {
        self.provider_type() == "local"
    }

    /// Rename the model, keeping the controller name and the config `name`
    /// key in step.
    pub fn set_model_name(&mut self, name: &str) {
        self.environment = name.to_string();
        self.controller_name = name.to_string();
        self.config.insert("name".to_string(), json!(name));
    }

    pub fn environments_path(home: &Path) -> PathBuf {
        home.join("environments.yaml")
    }

    /// Legacy single-environment config artifact. Its presence marks a
    /// pre-multi-model substrate.
    pub fn jenv_path(home: &Path, name: &str) -> PathBuf {
        home.join("environments").join(format!("{name}.jenv"))
    }

    /// Controller runtime config used by multi-model substrates.
    pub fn cache_path(home: &Path) -> PathBuf {
        home.join("models").join("cache.yaml")
    }

    /// Serialize this environment's provider config as an `environments.yaml`
    /// under `home`, so an isolated configuration home is self-contained.
    pub fn dump_yaml(&self, home: &Path) -> Result<()> {
        let mut environments = serde_json::Map::new();
        environments.insert(self.environment.clone(), serde_json::to_value(&self.config)?);
        let doc = json!({ "environments": environments });
        let text = serde_yaml::to_string(&doc)?;
        fs::create_dir_all(home)
            .with_context(|| format!("could not create {}", home.display()))?;
        fs::write(Self::environments_path(home), text)?;
        Ok(())
    }
}

/// Configuration home resolution: `$JUJU_HOME`, else `~/.juju`.
pub fn default_config_home() -> PathBuf {
    if let Some(home) = std::env::var_os("JUJU_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    home.join(".juju")
}

/// Deployment parameters applied to an environment before bootstrap.
#[derive(Debug, Clone, Default)]
pub struct EnvUpdateParams {
    pub series: Option<String>,
    pub bootstrap_host: Option<String>,
    pub agent_url: Option<String>,
    pub agent_stream: Option<String>,
    pub region: Option<String>,
}

/// Provider environment-update hook: rename the environment and fold the
/// deployment parameters into its config. Keys named in `omit` are skipped,
/// as is `region` when unset (a pre-configured region must survive).
pub fn update_env(
    env: &mut ModelEnv,
    new_name: &str,
    params: &EnvUpdateParams,
    omit: &BTreeSet<String>,
) {
    env.set_model_name(new_name);
    if !omit.contains("series") {
        if let Some(series) = &params.series {
            env.config.insert("default-series".to_string(), json!(series));
        }
    }
    if !omit.contains("bootstrap_host") {
        if let Some(host) = &params.bootstrap_host {
            env.config.insert("bootstrap-host".to_string(), json!(host));
        }
    }
    if !omit.contains("agent_url") {
        if let Some(url) = &params.agent_url {
            env.config.insert("tools-metadata-url".to_string(), json!(url));
        }
    }
    if !omit.contains("agent_stream") {
        if let Some(stream) = &params.agent_stream {
            env.config.insert("agent-stream".to_string(), json!(stream));
        }
    }
    if !omit.contains("region") {
        if let Some(region) = &params.region {
            env.config.insert("region".to_string(), json!(region));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paas_env() -> ModelEnv {
        let mut config = BTreeMap::new();
        config.insert("type".to_string(), json!("paas"));
        ModelEnv::new("foo", config, "/tmp/home")
    }

    #[test]
    fn update_env_sets_deployment_keys() {
        let mut env = paas_env();
        let params = EnvUpdateParams {
            series: Some("wacky".to_string()),
            bootstrap_host: Some("baz".to_string()),
            agent_url: Some("url".to_string()),
            agent_stream: Some("devel".to_string()),
            region: None,
        };
        update_env(&mut env, "bar", &params, &BTreeSet::new());
        assert_eq!(env.environment, "bar");
        assert_eq!(env.controller_name, "bar");
        assert_eq!(env.config["name"], json!("bar"));
        assert_eq!(env.config["default-series"], json!("wacky"));
        assert_eq!(env.config["bootstrap-host"], json!("baz"));
        assert_eq!(env.config["tools-metadata-url"], json!("url"));
        assert_eq!(env.config["agent-stream"], json!("devel"));
        assert!(!env.config.contains_key("region"));
    }

    #[test]
    fn update_env_region_none_preserves_existing() {
        let mut env = paas_env();
        env.config.insert("region".to_string(), json!("region-foo"));
        update_env(&mut env, "bar", &EnvUpdateParams::default(), &BTreeSet::new());
        assert_eq!(env.config["region"], json!("region-foo"));
    }

    #[test]
    fn update_env_honours_omit_set() {
        let mut env = paas_env();
        let params = EnvUpdateParams {
            series: Some("wacky".to_string()),
            bootstrap_host: Some("bootstrap.example.org".to_string()),
            agent_url: Some("url".to_string()),
            agent_stream: Some("devel".to_string()),
            region: None,
        };
        let omit: BTreeSet<String> =
            ["bootstrap_host", "series"].iter().map(|s| s.to_string()).collect();
        update_env(&mut env, "bar", &params, &omit);
        assert!(!env.config.contains_key("default-series"));
        assert!(!env.config.contains_key("bootstrap-host"));
        assert_eq!(env.config["tools-metadata-url"], json!("url"));
        assert_eq!(env.config["agent-stream"], json!("devel"));
    }

    #[test]
    fn yaml_round_trip_through_config_home() {
        let home = std::env::temp_dir().join(format!(
            "stack_core_env_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let env = paas_env();
        env.dump_yaml(&home).expect("dump yaml");
        let loaded = ModelEnv::from_config_home("foo", &home).expect("load env");
        assert_eq!(loaded.environment, "foo");
        assert_eq!(loaded.provider_type(), "paas");
        let _ = fs::remove_dir_all(&home);
    }

    #[test]
    fn legacy_and_cache_paths() {
        let home = Path::new("/home/user/.juju");
        assert_eq!(
            ModelEnv::jenv_path(home, "foo"),
            Path::new("/home/user/.juju/environments/foo.jenv")
        );
        assert_eq!(
            ModelEnv::cache_path(home),
            Path::new("/home/user/.juju/models/cache.yaml")
        );
    }
}
