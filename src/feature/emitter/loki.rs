use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use log::{debug, warn};
use maplit::btreemap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{options_to_struct, Emitter, EmitterOptions};
use crate::libs::{
    config::{Config, EnvLookup},
    error::{Error, Result},
    event::{unix_nanos, LogBatch},
    labels::prom_string_tag,
};

const MAX_RETRIES: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Debug, Clone, Default)]
struct LokiOptions
{
    #[serde(default)]
    url: String,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LokiStream
{
    pub stream: BTreeMap<String, String>,
    pub values: Vec<[String; 2]>,
}

/// Body of a push to `/loki/api/v1/push`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LokiPayload
{
    pub streams: Vec<LokiStream>,
}

#[derive(Debug, Clone)]
pub struct LokiEmitter
{
    url: String,
    org_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
    min_retry_delay: Duration,
}

impl LokiEmitter
{
    pub fn new(options: &EmitterOptions) -> Result<LokiEmitter>
    {
        let options: LokiOptions = options_to_struct(options)?;

        // validate configuration
        if options.url.is_empty()
        {
            return Err(Error::Emitter("must set a loki URL to send logs to".to_string()));
        }
        let org_id = options.org_id.filter(|org_id| !org_id.is_empty());
        if org_id.is_none()
        {
            warn!("warning: no loki org id set");
        }

        Ok(LokiEmitter {
            url: options.url,
            org_id,
            username: options.username.filter(|username| !username.is_empty()),
            password: options.password,
            client: http_client(REQUEST_TIMEOUT)?,
            min_retry_delay: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> LokiEmitter
    {
        self.client = http_client(timeout).unwrap();
        self
    }

    #[cfg(test)]
    fn with_min_retry_delay(mut self, delay: Duration) -> LokiEmitter
    {
        self.min_retry_delay = delay;
        self
    }

    async fn push_payload(&self, payload: &LokiPayload) -> Result<()>
    {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(org_id) = &self.org_id
        {
            request = request.header("X-Scope-OrgID", org_id);
        }
        if let Some(username) = &self.username
        {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT
        {
            let body = response.text().await?;
            return Err(Error::Loki { status: status.as_u16(), body });
        }
        Ok(())
    }
}

// A push that never gets an answer would hold up the whole scan.
fn http_client(timeout: Duration) -> Result<reqwest::Client>
{
    Ok(reqwest::Client::builder().connect_timeout(timeout).timeout(timeout).build()?)
}

pub fn configure_env_vars(config: &mut Config, env: EnvLookup<'_>)
{
    for (variable, option) in [("LOKI_URL", "url"), ("LOKI_ORG_ID", "org_id")]
    {
        if let Some(value) = env(variable)
        {
            config.logging.logger = "loki".to_string();
            config.logging.options.insert(option.to_string(), serde_json::Value::String(value));
        }
    }
}

/// One stream per batch, labelled with where the events came from.
pub fn log_batch_to_loki_payload(batch: &LogBatch) -> LokiPayload
{
    let mut labels = btreemap! {
        "aws_account".to_string() => batch.account_id.clone(),
        "role_arn".to_string() => batch.role_arn.clone(),
        "aws_region".to_string() => batch.region.clone(),
        "ecs_cluster".to_string() => batch.cluster.clone(),
        "service_name".to_string() => batch.service.name.clone(),
    };

    for tag in &batch.service.tags
    {
        let (_, key) = prom_string_tag(&format!("tag_{}", tag.key), true);
        labels.insert(key, tag.value.clone());
    }

    let values = batch.logs
        .iter()
        .map(|row| [unix_nanos(&row.timestamp).to_string(), row.msg.clone()])
        .collect();

    LokiPayload { streams: vec![LokiStream { stream: labels, values }] }
}

#[async_trait]
impl Emitter for LokiEmitter
{
    async fn process_log_batch(&self, batch: &LogBatch) -> Result<()>
    {
        let payload = log_batch_to_loki_payload(batch);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_retry_delay)
            .with_max_times(MAX_RETRIES);

        (|| async { self.push_payload(&payload).await })
            .retry(backoff)
            .when(Error::is_retryable)
            .notify(|error: &Error, delay: Duration| warn!("loki push failed, retrying in {:?}: {}", delay, error))
            .await?;

        debug!("Pushed {} event(s) for {}/{} to loki", batch.logs.len(), batch.cluster, batch.service.name);
        Ok(())
    }
}

#[cfg(test)]
fn sample_batch() -> LogBatch
{
    use chrono::{TimeZone, Utc};

    use crate::libs::event::{EcsService, LogRow, Tag};

    LogBatch {
        account_id: "123456789012".to_string(),
        role_arn: "arn:aws:sts::123456789012:assumed-role/reader/session".to_string(),
        region: "eu-west-1".to_string(),
        cluster: "production".to_string(),
        service: EcsService {
            name: "api".to_string(),
            tags: vec![Tag::new("CostCenter", "42"), Tag::new("aws:cloudformation:stack-name", "api-stack")],
        },
        logs: vec![
            LogRow { msg: "(service api) has started 1 tasks.".to_string(), timestamp: Utc.timestamp_opt(1_700_000_000, 5).unwrap() },
            LogRow { msg: "(service api) has reached a steady state.".to_string(), timestamp: Utc.timestamp_opt(1_700_000_060, 0).unwrap() },
        ],
    }
}

#[cfg(test)]
fn loki_options(url: String, org_id: Option<&str>) -> EmitterOptions
{
    let mut options = EmitterOptions::new();
    options.insert("url".to_string(), serde_json::json!(url));
    if let Some(org_id) = org_id
    {
        options.insert("org_id".to_string(), serde_json::json!(org_id));
    }
    options
}

#[test]
fn test_payload()
{
    let payload = log_batch_to_loki_payload(&sample_batch());

    assert_eq!(payload.streams.len(), 1);
    let stream = &payload.streams[0];
    assert_eq!(stream.stream, btreemap! {
        "aws_account".to_string() => "123456789012".to_string(),
        "role_arn".to_string() => "arn:aws:sts::123456789012:assumed-role/reader/session".to_string(),
        "aws_region".to_string() => "eu-west-1".to_string(),
        "ecs_cluster".to_string() => "production".to_string(),
        "service_name".to_string() => "api".to_string(),
        "tag_cost_center".to_string() => "42".to_string(),
        "tag_aws_cloudformation_stack_name".to_string() => "api-stack".to_string(),
    });
    assert_eq!(stream.values, vec![
        ["1700000000000000005".to_string(), "(service api) has started 1 tasks.".to_string()],
        ["1700000060000000000".to_string(), "(service api) has reached a steady state.".to_string()],
    ]);
}

#[test]
fn test_requires_url()
{
    let error = LokiEmitter::new(&EmitterOptions::new()).unwrap_err();
    assert_eq!(error.to_string(), "must set a loki URL to send logs to");
}

#[tokio::test]
async fn test_push()
{
    use wiremock::{matchers::{body_json, header, method, path}, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    let batch = sample_batch();
    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .and(header("X-Scope-OrgID", "tenant-1"))
        .and(header("content-type", "application/json"))
        .and(body_json(log_batch_to_loki_payload(&batch)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let emitter = LokiEmitter::new(&loki_options(format!("{}/loki/api/v1/push", server.uri()), Some("tenant-1"))).unwrap();
    emitter.process_log_batch(&batch).await.unwrap();
}

#[tokio::test]
async fn test_rejected_push_is_not_retried()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("entry out of order"))
        .expect(1)
        .mount(&server)
        .await;

    let emitter = LokiEmitter::new(&loki_options(server.uri(), None)).unwrap();
    let error = emitter.process_log_batch(&sample_batch()).await.unwrap_err();

    assert!(matches!(&error, Error::Loki { status: 400, body } if body == "entry out of order"));
    assert!(error.to_string().contains("received response status: 400"));
}

#[tokio::test]
async fn test_server_errors_are_retried()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let emitter = LokiEmitter::new(&loki_options(server.uri(), None))
        .unwrap()
        .with_min_retry_delay(Duration::from_millis(1));
    emitter.process_log_batch(&sample_batch()).await.unwrap();
}

#[tokio::test]
async fn test_basic_auth()
{
    use wiremock::{matchers::{header, method}, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut options = loki_options(server.uri(), None);
    options.insert("username".to_string(), serde_json::json!("user"));
    options.insert("password".to_string(), serde_json::json!("pass"));

    let emitter = LokiEmitter::new(&options).unwrap();
    emitter.process_log_batch(&sample_batch()).await.unwrap();
}

#[tokio::test]
async fn test_gives_up_after_max_retries()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("ingester unavailable"))
        .expect(MAX_RETRIES as u64 + 1)
        .mount(&server)
        .await;

    let emitter = LokiEmitter::new(&loki_options(server.uri(), None))
        .unwrap()
        .with_min_retry_delay(Duration::from_millis(1));
    let error = emitter.process_log_batch(&sample_batch()).await.unwrap_err();

    assert!(matches!(error, Error::Loki { status: 503, .. }));
}

#[tokio::test]
async fn test_unanswered_push_times_out()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(600)))
        .mount(&server)
        .await;

    let emitter = LokiEmitter::new(&loki_options(server.uri(), None))
        .unwrap()
        .with_min_retry_delay(Duration::from_millis(1))
        .with_timeout(Duration::from_millis(100));
    let result = tokio::time::timeout(Duration::from_secs(20), emitter.process_log_batch(&sample_batch())).await;

    let error = result.expect("push should give up on its own").unwrap_err();
    assert!(matches!(error, Error::Http(_)));
    assert!(error.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), MAX_RETRIES + 1);
}
