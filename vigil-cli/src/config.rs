use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use vigil_core::ClusterConfig;

/// Reference configuration used when no file exists.
const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub node_id: Option<u32>,
    pub bind: Option<String>,
    pub advertise: Option<String>,
    pub seeds: Vec<String>,
    pub preferred_leader: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut ClusterConfig) -> Result<()> {
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(advertise) = &self.advertise {
            let addr = advertise
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid advertise address '{advertise}'"))?;
            config.advertise_addr = Some(addr);
        }
        if !self.seeds.is_empty() {
            config.seeds.clone_from(&self.seeds);
        }
        if self.preferred_leader {
            config.preferred_leader = true;
        }
        Ok(())
    }
}

pub struct ConfigManager {
    path: PathBuf,
    config: CliConfig,
}

impl ConfigManager {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        Self::load_with_path(path)
    }

    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?
        } else {
            toml::from_str(DEFAULT_CONFIG).context("bundled default config is invalid")?
        };
        Ok(Self { path, config })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies flag overrides and validates the merged cluster configuration.
    pub fn effective(&self, overrides: &Overrides) -> Result<ClusterConfig> {
        let mut cluster = self.config.cluster.clone();
        overrides.apply(&mut cluster)?;
        cluster
            .validate()
            .with_context(|| format!("invalid cluster configuration from {}", self.path.display()))?;
        Ok(cluster)
    }
}

pub fn to_toml(config: &ClusterConfig) -> Result<String> {
    let wrapped = CliConfig {
        cluster: config.clone(),
    };
    toml::to_string_pretty(&wrapped).context("failed to render configuration")
}

fn default_config_path() -> Result<PathBuf> {
    let base =
        dirs::config_dir().ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(base.join("vigil").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_core::DetectorConfig;

    #[test]
    fn shipped_defaults_match_library_defaults() {
        let shipped: CliConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        let library = ClusterConfig::default();
        assert_eq!(shipped.cluster.magic, library.magic);
        assert_eq!(shipped.cluster.bind, library.bind);
        assert_eq!(shipped.cluster.heartbeat.interval, library.heartbeat.interval);
        assert_eq!(
            shipped.cluster.registry.unreachable_node_delay,
            library.registry.unreachable_node_delay
        );
        assert!(matches!(shipped.cluster.detector, DetectorConfig::Phi(_)));
        shipped.cluster.validate().unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::load_with_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(manager.config.cluster.node_id, 0);
    }

    #[test]
    fn file_values_and_overrides_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[cluster]
node_id = 4
seeds = ["10.0.0.1:7946"]

[cluster.heartbeat]
interval = "250ms"

[cluster.detector]
algorithm = "adaptive"
multiplier = 3.0
"#,
        )
        .unwrap();

        let manager = ConfigManager::load_with_path(&path).unwrap();
        let overrides = Overrides {
            bind: Some("127.0.0.1:0".to_string()),
            preferred_leader: true,
            ..Overrides::default()
        };
        let effective = manager.effective(&overrides).unwrap();
        assert_eq!(effective.node_id, 4);
        assert_eq!(effective.bind, "127.0.0.1:0");
        assert_eq!(effective.seeds, vec!["10.0.0.1:7946".to_string()]);
        assert_eq!(effective.heartbeat.interval, Duration::from_millis(250));
        assert!(effective.preferred_leader);
        match effective.detector {
            DetectorConfig::Adaptive(adaptive) => {
                assert!((adaptive.multiplier - 3.0).abs() < f64::EPSILON);
                assert_eq!(adaptive.min_samples, 10);
            }
            DetectorConfig::Phi(_) => panic!("expected adaptive detector"),
        }
    }

    #[test]
    fn invalid_values_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cluster.heartbeat]\ntimeout = \"100ms\"\n").unwrap();
        let manager = ConfigManager::load_with_path(&path).unwrap();
        assert!(manager.effective(&Overrides::default()).is_err());
    }

    #[test]
    fn rendered_config_reloads() {
        let rendered = to_toml(&ClusterConfig::default()).unwrap();
        let reloaded: CliConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reloaded.cluster.gossip.fanout, 3);
    }
}
