use std::{collections::BTreeMap, path::Path};

use log::{info, warn};
use serde::Deserialize;

use super::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_SCAN_INTERVAL: u64 = 60;
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_LOGGER: &str = "stdout";

/// All key/value pairs must be present on a resource for the filter to match.
pub type TagFilter = BTreeMap<String, String>;

/// Looks up an environment variable. Swapped out in tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String>
{
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LoggingConfig
{
    #[serde(default)]
    pub logger: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RoleConfig
{
    pub role_arn: String,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Exporter configuration file schema.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config
{
    pub logging: LoggingConfig,
    /// Seconds between scans.
    pub scan_interval: u64,
    pub ignore_default_credentials: bool,
    pub regions: Vec<String>,
    pub roles: Vec<RoleConfig>,
    pub clusters: Vec<String>,
    pub cluster_tags: Vec<TagFilter>,
    pub services: Vec<String>,
    pub service_tags: Vec<TagFilter>,
    /// Upper bound on services processed at the same time.
    pub max_concurrency: usize,
}

impl Config
{
    /// Reads the file named by `CONFIG_FILE` (default `config.yaml`) and applies
    /// environment overrides. Defaults are applied separately, once the
    /// ambient region is known.
    pub fn load(env: EnvLookup<'_>) -> Result<Config>
    {
        let path = env("CONFIG_FILE").unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        let mut config = Config::read(&path)?;
        config.apply_env(env)?;
        Ok(config)
    }

    /// A missing file is an empty configuration; anything else that goes wrong is fatal.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Config>
    {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path)
        {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!("config file {} does not exist - using empty configuration", path.display());
                return Ok(Config::default());
            }
            Err(error) => return Err(Error::Config(format!("failed to read {}: {}", path.display(), error))),
        };

        let config = Config::parse(&contents)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Config>
    {
        if contents.trim().is_empty()
        {
            return Ok(Config::default());
        }
        Ok(serde_yaml_ng::from_str(contents)?)
    }

    pub fn apply_env(&mut self, env: EnvLookup<'_>) -> Result<()>
    {
        if let Some(scan_interval) = env("SCAN_INTERVAL")
        {
            self.scan_interval = scan_interval
                .trim()
                .parse::<u64>()
                .map_err(|error| Error::Config(format!("Invalid scan interval {}: {}", scan_interval, error)))?;
        }
        Ok(())
    }

    /// Fills in everything left unset. `default_region` is used when no
    /// regions are configured, and roles without regions inherit the result.
    pub fn apply_defaults(&mut self, default_region: Option<String>) -> Result<()>
    {
        // make sure we have something to scan
        if self.ignore_default_credentials && self.roles.is_empty()
        {
            return Err(Error::Config(
                "Nothing to scan for - either add roles to your config file, or re-enable the default credentials".to_string(),
            ));
        }

        if self.scan_interval == 0
        {
            self.scan_interval = DEFAULT_SCAN_INTERVAL;
        }
        if self.max_concurrency == 0
        {
            self.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        if self.logging.logger.is_empty()
        {
            self.logging.logger = DEFAULT_LOGGER.to_string();
        }

        if self.regions.is_empty()
        {
            match default_region
            {
                Some(region) => self.regions = vec![region],
                None => return Err(Error::Config("no regions configured and no default AWS region found".to_string())),
            }
        }

        for role in self.roles.iter_mut()
        {
            if role.regions.is_empty()
            {
                role.regions = self.regions.clone();
            }
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> std::time::Duration
    {
        std::time::Duration::from_secs(self.scan_interval)
    }
}

#[cfg(test)]
pub(crate) fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
{
    let vars: BTreeMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key: &str| vars.get(key).cloned()
}

#[test]
fn test_parse_full_config()
{
    let config = Config::parse(r#"
logging:
  logger: loki
  options:
    url: http://loki:3100/loki/api/v1/push
    org_id: tenant-1
scan_interval: 30
ignore_default_credentials: true
regions: [eu-west-1, eu-west-2]
roles:
  - role_arn: arn:aws:iam::123456789012:role/reader
  - role_arn: arn:aws:iam::210987654321:role/reader
    regions: [us-east-1]
clusters: [production]
cluster_tags:
  - environment: production
    team: platform
service_tags:
  - exporter: enabled
"#).unwrap();

    assert_eq!(config.logging.logger, "loki");
    assert_eq!(config.logging.options["org_id"], "tenant-1");
    assert_eq!(config.scan_interval, 30);
    assert!(config.ignore_default_credentials);
    assert_eq!(config.roles.len(), 2);
    assert_eq!(config.roles[1].regions, vec!["us-east-1"]);
    assert_eq!(config.clusters, vec!["production"]);
    assert_eq!(config.cluster_tags[0].get("team").map(String::as_str), Some("platform"));
    assert_eq!(config.service_tags.len(), 1);
    assert!(config.services.is_empty());
}

#[test]
fn test_empty_config()
{
    assert_eq!(Config::parse("").unwrap(), Config::default());
    assert_eq!(Config::parse("\n  \n").unwrap(), Config::default());
}

#[test]
fn test_missing_file_is_empty_config()
{
    let dir = tempfile::tempdir().unwrap();
    let config = Config::read(dir.path().join("nope.yaml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_invalid_yaml_is_an_error()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "scan_interval: [not, a, number]").unwrap();

    assert!(matches!(Config::read(&path), Err(Error::Yaml(_))));
}

#[test]
fn test_load_uses_config_file_env()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exporter.yaml");
    std::fs::write(&path, "scan_interval: 15\nregions: [ap-southeast-2]\n").unwrap();

    let path = path.to_string_lossy().to_string();
    let env = env_from(&[("CONFIG_FILE", path.as_str()), ("SCAN_INTERVAL", "90")]);
    let config = Config::load(&env).unwrap();

    assert_eq!(config.scan_interval, 90);
    assert_eq!(config.regions, vec!["ap-southeast-2"]);
}

#[test]
fn test_invalid_scan_interval_env()
{
    let env = env_from(&[("SCAN_INTERVAL", "soon")]);
    let mut config = Config::default();

    let error = config.apply_env(&env).unwrap_err();
    assert!(error.to_string().contains("Invalid scan interval soon"));
}

#[test]
fn test_defaults()
{
    let mut config = Config::parse("roles:\n  - role_arn: arn:aws:iam::1:role/r\n").unwrap();
    config.apply_defaults(Some("eu-west-1".to_string())).unwrap();

    assert_eq!(config.scan_interval, DEFAULT_SCAN_INTERVAL);
    assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    assert_eq!(config.logging.logger, "stdout");
    assert_eq!(config.regions, vec!["eu-west-1"]);
    assert_eq!(config.roles[0].regions, vec!["eu-west-1"]);
}

#[test]
fn test_configured_regions_win_over_default()
{
    let mut config = Config::parse("regions: [us-west-2]\n").unwrap();
    config.apply_defaults(Some("eu-west-1".to_string())).unwrap();
    assert_eq!(config.regions, vec!["us-west-2"]);
}

#[test]
fn test_nothing_to_scan()
{
    let mut config = Config::parse("ignore_default_credentials: true\n").unwrap();
    let error = config.apply_defaults(Some("eu-west-1".to_string())).unwrap_err();
    assert!(error.to_string().contains("Nothing to scan for"));
}

#[test]
fn test_no_region_anywhere()
{
    let mut config = Config::default();
    assert!(config.apply_defaults(None).is_err());
}
