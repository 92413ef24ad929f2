use std::sync::Arc;

use async_trait::async_trait;

use crate::libs::{
    config::{Config, EnvLookup},
    error::{Error, Result},
    event::LogBatch,
};

pub mod loki;
pub mod stdout;

pub type EmitterOptions = serde_json::Map<String, serde_json::Value>;

/// Somewhere to send batches of service events.
#[async_trait]
pub trait Emitter: Send + Sync
{
    async fn process_log_batch(&self, batch: &LogBatch) -> Result<()>;
}

// Every emitter gets to look at the environment before any emitter is built,
// so the emitter type can be inferred from its variables: running with
// LOKI_URL=http://example.com sets up the loki emitter on its own.
pub fn configure_env_vars(config: &mut Config, env: EnvLookup<'_>)
{
    stdout::configure_env_vars(config, env);
    loki::configure_env_vars(config, env);
}

pub fn emitter_from_config(name: &str, options: &EmitterOptions) -> Result<Arc<dyn Emitter>>
{
    match name
    {
        "loki" => Ok(Arc::new(loki::LokiEmitter::new(options)?)),
        "stdout" => Ok(Arc::new(stdout::StdoutEmitter::new(options)?)),
        _ => Err(Error::Emitter(format!("unknown emitter '{}'", name))),
    }
}

/// Decodes emitter options into the emitter's own option struct.
pub(crate) fn options_to_struct<T: serde::de::DeserializeOwned>(options: &EmitterOptions) -> Result<T>
{
    serde_json::from_value(serde_json::Value::Object(options.clone()))
        .map_err(|error| Error::Emitter(format!("invalid emitter options: {}", error)))
}

#[test]
fn test_unknown_emitter()
{
    let error = emitter_from_config("kafka", &EmitterOptions::new()).err().unwrap();
    assert_eq!(error.to_string(), "unknown emitter 'kafka'");
}

#[test]
fn test_known_emitters()
{
    assert!(emitter_from_config("stdout", &EmitterOptions::new()).is_ok());

    let mut options = EmitterOptions::new();
    options.insert("url".to_string(), serde_json::json!("http://localhost:3100/loki/api/v1/push"));
    assert!(emitter_from_config("loki", &options).is_ok());
}

#[test]
fn test_env_selects_loki()
{
    let env = |key: &str| match key
    {
        "LOKI_URL" => Some("http://loki:3100/loki/api/v1/push".to_string()),
        _ => None,
    };
    let mut config = Config::default();
    config.logging.logger = "stdout".to_string();

    configure_env_vars(&mut config, &env);

    assert_eq!(config.logging.logger, "loki");
    assert_eq!(config.logging.options["url"], "http://loki:3100/loki/api/v1/push");
    assert!(!config.logging.options.contains_key("org_id"));
}

#[test]
fn test_env_overrides_file_options()
{
    let env = |key: &str| match key
    {
        "LOKI_ORG_ID" => Some("tenant-2".to_string()),
        _ => None,
    };
    let mut config = Config::parse("logging:\n  logger: loki\n  options:\n    url: http://a\n    org_id: tenant-1\n").unwrap();

    configure_env_vars(&mut config, &env);

    assert_eq!(config.logging.options["url"], "http://a");
    assert_eq!(config.logging.options["org_id"], "tenant-2");
}

#[test]
fn test_no_env_leaves_config_alone()
{
    let env = |_: &str| -> Option<String> { None };
    let mut config = Config::default();

    configure_env_vars(&mut config, &env);

    assert_eq!(config, Config::default());
}
