use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, sts::AssumeRoleProvider, BehaviorVersion, Region, SdkConfig};
use aws_sdk_ecs::types::{ClusterField, Failure, ServiceField};
use chrono::{DateTime, Utc};
use log::{debug, error, warn};

use crate::libs::{
    error::Result,
    event::{ClientIdentity, EcsCluster, EcsService, LogRow, Tag},
};

const SESSION_NAME: &str = "ecs-events-exporter";

/// The slice of the ECS API the exporter needs.
///
/// List calls follow pagination to the end. Describe calls include tags and
/// log any per-resource failures instead of returning them.
#[async_trait]
pub trait EcsApi: Send + Sync
{
    fn identity(&self) -> &ClientIdentity;

    async fn list_clusters(&self) -> Result<Vec<String>>;

    async fn describe_clusters(&self, clusters: &[String]) -> Result<Vec<EcsCluster>>;

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>>;

    /// At most ten services per call.
    async fn describe_services(&self, cluster: &str, services: &[String]) -> Result<Vec<EcsService>>;

    /// Every event ECS still holds for the service, in no particular order.
    async fn service_events(&self, cluster: &str, service: &str) -> Result<Vec<LogRow>>;
}

#[derive(Debug, Clone)]
pub struct AwsEcsClient
{
    client: aws_sdk_ecs::Client,
    identity: ClientIdentity,
}

impl AwsEcsClient
{
    /// Builds a client for `region`, assuming `role_arn` when one is given.
    pub async fn connect(role_arn: Option<&str>, region: &str) -> Result<AwsEcsClient>
    {
        let region = Region::new(region.to_string());
        let base = aws_config::defaults(BehaviorVersion::latest()).region(region.clone()).load().await;

        let config: SdkConfig = match role_arn
        {
            Some(role_arn) =>
            {
                let provider = AssumeRoleProvider::builder(role_arn)
                    .session_name(SESSION_NAME)
                    .region(region.clone())
                    .configure(&base)
                    .build()
                    .await;
                aws_config::defaults(BehaviorVersion::latest())
                    .region(region.clone())
                    .credentials_provider(provider)
                    .load()
                    .await
            }
            None => base,
        };

        let caller = aws_sdk_sts::Client::new(&config).get_caller_identity().send().await?;
        let identity = ClientIdentity {
            account_id: caller.account().unwrap_or_default().to_string(),
            role_arn: caller.arn().unwrap_or_default().to_string(),
            region: region.to_string(),
        };
        debug!("Connected to {} in {} as {}", identity.account_id, identity.region, identity.role_arn);

        Ok(AwsEcsClient { client: aws_sdk_ecs::Client::new(&config), identity })
    }
}

fn convert_tags(tags: &[aws_sdk_ecs::types::Tag]) -> Vec<Tag>
{
    tags.iter()
        .filter_map(|tag| Some(Tag::new(tag.key()?, tag.value().unwrap_or_default())))
        .collect()
}

fn log_failures(failures: &[Failure])
{
    for failure in failures
    {
        warn!("warning: {} {}", failure.reason().unwrap_or_default(), failure.arn().unwrap_or_default());
    }
}

#[async_trait]
impl EcsApi for AwsEcsClient
{
    fn identity(&self) -> &ClientIdentity
    {
        &self.identity
    }

    async fn list_clusters(&self) -> Result<Vec<String>>
    {
        let mut clusters = Vec::new();
        let mut next_token: Option<String> = None;
        loop
        {
            let output = self.client.list_clusters().set_next_token(next_token.take()).send().await?;
            clusters.extend(output.cluster_arns().iter().cloned());
            match output.next_token()
            {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(clusters)
    }

    async fn describe_clusters(&self, clusters: &[String]) -> Result<Vec<EcsCluster>>
    {
        let output = self.client
            .describe_clusters()
            .set_clusters(Some(clusters.to_vec()))
            .include(ClusterField::Tags)
            .send()
            .await?;
        log_failures(output.failures());

        Ok(output.clusters()
            .iter()
            .filter_map(|cluster| {
                Some(EcsCluster { name: cluster.cluster_name()?.to_string(), tags: convert_tags(cluster.tags()) })
            })
            .collect())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>>
    {
        let mut services = Vec::new();
        let mut next_token: Option<String> = None;
        loop
        {
            let output = self.client
                .list_services()
                .cluster(cluster)
                .set_next_token(next_token.take())
                .send()
                .await?;
            services.extend(output.service_arns().iter().cloned());
            match output.next_token()
            {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(services)
    }

    async fn describe_services(&self, cluster: &str, services: &[String]) -> Result<Vec<EcsService>>
    {
        let output = self.client
            .describe_services()
            .cluster(cluster)
            .set_services(Some(services.to_vec()))
            .include(ServiceField::Tags)
            .send()
            .await?;
        log_failures(output.failures());

        Ok(output.services()
            .iter()
            .filter_map(|service| {
                Some(EcsService { name: service.service_name()?.to_string(), tags: convert_tags(service.tags()) })
            })
            .collect())
    }

    async fn service_events(&self, cluster: &str, service: &str) -> Result<Vec<LogRow>>
    {
        let output = self.client
            .describe_services()
            .cluster(cluster)
            .services(service)
            .send()
            .await?;
        log_failures(output.failures());

        let mut logs = Vec::new();
        for event in output.services().iter().flat_map(|service| service.events())
        {
            let (Some(message), Some(created_at)) = (event.message(), event.created_at()) else { continue };
            let Some(timestamp) = DateTime::<Utc>::from_timestamp(created_at.secs(), created_at.subsec_nanos()) else { continue };
            logs.push(LogRow { msg: message.to_string(), timestamp });
        }
        Ok(logs)
    }
}

/// One client per region for the given role (or the default credentials).
/// Regions that fail to connect are logged and skipped.
pub async fn clients_for_role(regions: &[String], role_arn: Option<&str>) -> Vec<Arc<dyn EcsApi>>
{
    let mut clients: Vec<Arc<dyn EcsApi>> = Vec::new();
    for region in regions
    {
        match AwsEcsClient::connect(role_arn, region).await
        {
            Ok(client) => clients.push(Arc::new(client)),
            Err(err) => error!("failed to create ECS client for {} in {}: {}", role_arn.unwrap_or("default credentials"), region, err),
        }
    }
    clients
}

/// The region the default provider chain resolves to, if any.
pub async fn current_region() -> Option<String>
{
    RegionProviderChain::default_provider().region().await.map(|region| region.to_string())
}

#[test]
fn test_convert_tags()
{
    let tags = vec![
        aws_sdk_ecs::types::Tag::builder().key("team").value("platform").build(),
        aws_sdk_ecs::types::Tag::builder().value("orphan").build(),
        aws_sdk_ecs::types::Tag::builder().key("empty").build(),
    ];

    assert_eq!(convert_tags(&tags), vec![Tag::new("team", "platform"), Tag::new("empty", "")]);
}

#[tokio::test]
async fn test_no_regions_no_clients()
{
    assert!(clients_for_role(&[], None).await.is_empty());
}

#[cfg(test)]
fn mock_client(server: &wiremock::MockServer) -> AwsEcsClient
{
    use aws_sdk_ecs::config::{BehaviorVersion, Credentials, Region};

    let config = aws_sdk_ecs::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("eu-west-1"))
        .endpoint_url(server.uri())
        .credentials_provider(Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"))
        .build();
    AwsEcsClient { client: aws_sdk_ecs::Client::from_conf(config), identity: ClientIdentity::default() }
}

#[cfg(test)]
fn ecs_target(operation: &str) -> wiremock::matchers::HeaderExactMatcher
{
    wiremock::matchers::header("x-amz-target", format!("AmazonEC2ContainerServiceV20141113.{}", operation).as_str())
}

#[cfg(test)]
fn ecs_response(body: serde_json::Value) -> wiremock::ResponseTemplate
{
    wiremock::ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/x-amz-json-1.1")
}

#[tokio::test]
async fn test_list_calls_follow_pagination()
{
    use serde_json::json;
    use wiremock::{matchers::{body_partial_json, method}, Mock, MockServer};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(ecs_target("ListClusters"))
        .and(body_partial_json(json!({ "nextToken": "page-2" })))
        .respond_with(ecs_response(json!({ "clusterArns": ["arn:aws:ecs:eu-west-1:123456789012:cluster/staging"] })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(ecs_target("ListClusters"))
        .respond_with(ecs_response(json!({
            "clusterArns": ["arn:aws:ecs:eu-west-1:123456789012:cluster/production"],
            "nextToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(ecs_target("ListServices"))
        .and(body_partial_json(json!({ "cluster": "production", "nextToken": "page-2" })))
        .respond_with(ecs_response(json!({ "serviceArns": ["arn:aws:ecs:eu-west-1:123456789012:service/production/worker"] })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(ecs_target("ListServices"))
        .and(body_partial_json(json!({ "cluster": "production" })))
        .respond_with(ecs_response(json!({
            "serviceArns": ["arn:aws:ecs:eu-west-1:123456789012:service/production/api"],
            "nextToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_client(&server);
    assert_eq!(client.list_clusters().await.unwrap(), vec![
        "arn:aws:ecs:eu-west-1:123456789012:cluster/production",
        "arn:aws:ecs:eu-west-1:123456789012:cluster/staging",
    ]);
    assert_eq!(client.list_services("production").await.unwrap(), vec![
        "arn:aws:ecs:eu-west-1:123456789012:service/production/api",
        "arn:aws:ecs:eu-west-1:123456789012:service/production/worker",
    ]);
}

#[tokio::test]
async fn test_describe_calls_include_tags_and_skip_failures()
{
    use serde_json::json;
    use wiremock::{matchers::{body_partial_json, method}, Mock, MockServer};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(ecs_target("DescribeClusters"))
        .and(body_partial_json(json!({ "include": ["TAGS"] })))
        .respond_with(ecs_response(json!({
            "clusters": [{
                "clusterName": "production",
                "clusterArn": "arn:aws:ecs:eu-west-1:123456789012:cluster/production",
                "tags": [{ "key": "environment", "value": "production" }]
            }],
            "failures": [{ "arn": "arn:aws:ecs:eu-west-1:123456789012:cluster/gone", "reason": "MISSING" }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(ecs_target("DescribeServices"))
        .and(body_partial_json(json!({ "cluster": "production", "include": ["TAGS"] })))
        .respond_with(ecs_response(json!({
            "services": [{ "serviceName": "api", "tags": [{ "key": "team", "value": "platform" }] }],
            "failures": [{ "arn": "arn:aws:ecs:eu-west-1:123456789012:service/production/gone", "reason": "MISSING" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_client(&server);

    let clusters = client.describe_clusters(&["production".to_string(), "gone".to_string()]).await.unwrap();
    assert_eq!(clusters, vec![EcsCluster { name: "production".to_string(), tags: vec![Tag::new("environment", "production")] }]);

    let services = client.describe_services("production", &["api".to_string(), "gone".to_string()]).await.unwrap();
    assert_eq!(services, vec![EcsService { name: "api".to_string(), tags: vec![Tag::new("team", "platform")] }]);
}

#[tokio::test]
async fn test_service_events_keep_sub_second_timestamps()
{
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::{matchers::{body_partial_json, method}, Mock, MockServer};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(ecs_target("DescribeServices"))
        .and(body_partial_json(json!({ "cluster": "production", "services": ["api"] })))
        .respond_with(ecs_response(json!({
            "services": [{
                "serviceName": "api",
                "events": [
                    { "id": "2", "createdAt": 1792143060.0, "message": "(service api) has reached a steady state." },
                    { "id": "1", "createdAt": 1792143000.5, "message": "(service api) has started 1 tasks." },
                    { "id": "0", "message": "no timestamp" }
                ]
            }],
            "failures": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let logs = mock_client(&server).service_events("production", "api").await.unwrap();
    assert_eq!(logs, vec![
        LogRow { msg: "(service api) has reached a steady state.".to_string(), timestamp: Utc.timestamp_opt(1792143060, 0).unwrap() },
        LogRow { msg: "(service api) has started 1 tasks.".to_string(), timestamp: Utc.timestamp_opt(1792143000, 500_000_000).unwrap() },
    ]);
}

#[tokio::test]
async fn test_api_errors_are_returned()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(ecs_target("ListClusters"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-amzn-errortype", "AccessDeniedException")
                .set_body_raw(r#"{"__type":"AccessDeniedException","message":"not allowed"}"#, "application/x-amz-json-1.1"),
        )
        .mount(&server)
        .await;

    assert!(mock_client(&server).list_clusters().await.is_err());
}
