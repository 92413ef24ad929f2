use chrono::{DateTime, Utc};
use log::debug;

use super::aws::EcsApi;
use crate::libs::{
    config::TagFilter,
    error::Result,
    event::{EcsService, LogRow, Tag},
};

// API limits per describe call.
const CLUSTER_CHUNK_SIZE: usize = 100;
const SERVICE_CHUNK_SIZE: usize = 10;

/// An empty filter list matches everything. Otherwise at least one filter must
/// have all of its key/value pairs present in `tags`.
pub fn matches_tag_filters(filters: &[TagFilter], tags: &[Tag]) -> bool
{
    if filters.is_empty()
    {
        return true;
    }
    filters.iter().any(|filter| {
        filter
            .iter()
            .all(|(key, value)| tags.iter().any(|tag| &tag.key == key && &tag.value == value))
    })
}

/// Names of the clusters to scan. With no explicit `clusters`, every cluster
/// in the account/region is considered.
pub async fn cluster_list(api: &dyn EcsApi, clusters: &[String], filters: &[TagFilter]) -> Result<Vec<String>>
{
    let clusters = if clusters.is_empty() { api.list_clusters().await? } else { clusters.to_vec() };

    let mut output = Vec::new();
    for chunk in clusters.chunks(CLUSTER_CHUNK_SIZE)
    {
        for cluster in api.describe_clusters(chunk).await?
        {
            if matches_tag_filters(filters, &cluster.tags)
            {
                output.push(cluster.name);
            }
        }
    }
    debug!("{} {}: {} cluster(s) to scan", api.identity().account_id, api.identity().region, output.len());
    Ok(output)
}

/// Services in `cluster` to scan, with their tags. With no explicit
/// `services`, every service in the cluster is considered.
pub async fn service_list(api: &dyn EcsApi, cluster: &str, services: &[String], filters: &[TagFilter]) -> Result<Vec<EcsService>>
{
    let services = if services.is_empty() { api.list_services(cluster).await? } else { services.to_vec() };

    let mut output = Vec::new();
    for chunk in services.chunks(SERVICE_CHUNK_SIZE)
    {
        for service in api.describe_services(cluster, chunk).await?
        {
            if matches_tag_filters(filters, &service.tags)
            {
                output.push(service);
            }
        }
    }
    Ok(output)
}

/// Events created in `(since, until]`, oldest first.
pub async fn deployment_logs(
    api: &dyn EcsApi,
    cluster: &str,
    service: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<LogRow>>
{
    let mut logs: Vec<LogRow> = api
        .service_events(cluster, service)
        .await?
        .into_iter()
        .filter(|row| row.timestamp > since && row.timestamp <= until)
        .collect();
    logs.sort_by_key(|row| row.timestamp);
    Ok(logs)
}

#[cfg(test)]
fn filter(pairs: &[(&str, &str)]) -> TagFilter
{
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn test_tag_filters()
{
    let tags = super::fake::to_tags(&[("environment", "production"), ("team", "platform")]);

    assert!(matches_tag_filters(&[], &tags));
    assert!(matches_tag_filters(&[], &[]));
    assert!(matches_tag_filters(&[filter(&[("environment", "production")])], &tags));
    assert!(matches_tag_filters(&[filter(&[("environment", "production"), ("team", "platform")])], &tags));
    assert!(!matches_tag_filters(&[filter(&[("environment", "production"), ("team", "data")])], &tags));
    assert!(!matches_tag_filters(&[filter(&[("environment", "production")])], &[]));

    // Filters are alternatives.
    let either = [filter(&[("team", "data")]), filter(&[("team", "platform")])];
    assert!(matches_tag_filters(&either, &tags));
}

#[tokio::test]
async fn test_cluster_list_filters_by_tag()
{
    let api = super::fake::FakeEcs::default()
        .with_cluster("production", &[("environment", "production")])
        .with_cluster("staging", &[("environment", "staging")])
        .with_cluster("untagged", &[]);

    let all = cluster_list(&api, &[], &[]).await.unwrap();
    assert_eq!(all, vec!["production", "staging", "untagged"]);

    let production = cluster_list(&api, &[], &[filter(&[("environment", "production")])]).await.unwrap();
    assert_eq!(production, vec!["production"]);

    let named = cluster_list(&api, &["staging".to_string()], &[]).await.unwrap();
    assert_eq!(named, vec!["staging"]);
}

#[tokio::test]
async fn test_cluster_list_chunks_describe_calls()
{
    let mut api = super::fake::FakeEcs::default();
    for index in 0..150
    {
        api = api.with_cluster(&format!("cluster-{}", index), &[]);
    }

    let clusters = cluster_list(&api, &[], &[]).await.unwrap();
    assert_eq!(clusters.len(), 150);
    assert_eq!(clusters[149], "cluster-149");
    assert_eq!(*api.describe_cluster_calls.lock().unwrap(), vec![100, 50]);
}

#[tokio::test]
async fn test_service_list_chunks_describe_calls()
{
    let mut api = super::fake::FakeEcs::default().with_cluster("production", &[]);
    for index in 0..23
    {
        let tags: &[(&str, &str)] = if index % 2 == 0 { &[("exporter", "enabled")] } else { &[] };
        api = api.with_service("production", &format!("service-{}", index), tags);
    }

    let services = service_list(&api, "production", &[], &[]).await.unwrap();
    assert_eq!(services.len(), 23);
    assert_eq!(*api.describe_calls.lock().unwrap(), vec![10, 10, 3]);

    let enabled = service_list(&api, "production", &[], &[filter(&[("exporter", "enabled")])]).await.unwrap();
    assert_eq!(enabled.len(), 12);
    assert!(enabled.iter().all(|service| service.tags == super::fake::to_tags(&[("exporter", "enabled")])));
}

#[tokio::test]
async fn test_deployment_logs_window()
{
    use chrono::TimeZone;

    let at = |second: u32| Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, second).unwrap();
    let row = |second: u32, msg: &str| LogRow { msg: msg.to_string(), timestamp: at(second) };

    let api = super::fake::FakeEcs::default().with_events("production", "api", vec![
        row(40, "too new"),
        row(30, "(service api) has reached a steady state."),
        row(10, "exactly at since"),
        row(20, "(service api) has started 1 tasks."),
        row(5, "too old"),
    ]);

    let logs = deployment_logs(&api, "production", "api", at(10), at(30)).await.unwrap();
    let messages: Vec<&str> = logs.iter().map(|row| row.msg.as_str()).collect();
    assert_eq!(messages, vec!["(service api) has started 1 tasks.", "(service api) has reached a steady state."]);
}
