// In-memory ECS used by the discovery and scanner tests.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::aws::EcsApi;
use crate::libs::{
    error::{Error, Result},
    event::{ClientIdentity, EcsCluster, EcsService, LogRow, Tag},
};

#[derive(Debug, Default)]
pub struct FakeEcs
{
    pub identity: ClientIdentity,
    pub clusters: Vec<EcsCluster>,
    pub services: HashMap<String, Vec<EcsService>>,
    pub events: HashMap<(String, String), Vec<LogRow>>,
    pub failing_clusters: Vec<String>,
    /// Sizes of every `describe_clusters` call, in call order.
    pub describe_cluster_calls: Mutex<Vec<usize>>,
    /// Sizes of every `describe_services` call, in call order.
    pub describe_calls: Mutex<Vec<usize>>,
}

impl Default for ClientIdentity
{
    fn default() -> Self
    {
        ClientIdentity {
            account_id: "123456789012".to_string(),
            role_arn: "arn:aws:sts::123456789012:assumed-role/reader/ecs-events-exporter".to_string(),
            region: "eu-west-1".to_string(),
        }
    }
}

impl FakeEcs
{
    pub fn with_cluster(mut self, name: &str, tags: &[(&str, &str)]) -> FakeEcs
    {
        self.clusters.push(EcsCluster { name: name.to_string(), tags: to_tags(tags) });
        self
    }

    pub fn with_service(mut self, cluster: &str, name: &str, tags: &[(&str, &str)]) -> FakeEcs
    {
        self.services
            .entry(cluster.to_string())
            .or_default()
            .push(EcsService { name: name.to_string(), tags: to_tags(tags) });
        self
    }

    pub fn with_events(mut self, cluster: &str, service: &str, events: Vec<LogRow>) -> FakeEcs
    {
        self.events.insert((cluster.to_string(), service.to_string()), events);
        self
    }

    pub fn failing(mut self, cluster: &str) -> FakeEcs
    {
        self.failing_clusters.push(cluster.to_string());
        self
    }

    fn check(&self, cluster: &str) -> Result<()>
    {
        if self.failing_clusters.iter().any(|failing| failing == cluster)
        {
            return Err(Error::Aws(format!("AccessDeniedException: not allowed to read {}", cluster)));
        }
        Ok(())
    }
}

pub fn to_tags(tags: &[(&str, &str)]) -> Vec<Tag>
{
    tags.iter().map(|(key, value)| Tag::new(key, value)).collect()
}

fn arn_name(arn: &str) -> &str
{
    arn.rsplit('/').next().unwrap_or(arn)
}

#[async_trait]
impl EcsApi for FakeEcs
{
    fn identity(&self) -> &ClientIdentity
    {
        &self.identity
    }

    async fn list_clusters(&self) -> Result<Vec<String>>
    {
        Ok(self.clusters
            .iter()
            .map(|cluster| format!("arn:aws:ecs:eu-west-1:123456789012:cluster/{}", cluster.name))
            .collect())
    }

    async fn describe_clusters(&self, clusters: &[String]) -> Result<Vec<EcsCluster>>
    {
        assert!(clusters.len() <= 100, "describe_clusters called with {} clusters", clusters.len());
        self.describe_cluster_calls.lock().unwrap().push(clusters.len());

        Ok(clusters
            .iter()
            .filter_map(|requested| self.clusters.iter().find(|cluster| cluster.name == arn_name(requested)))
            .cloned()
            .collect())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>>
    {
        self.check(cluster)?;
        Ok(self.services
            .get(cluster)
            .map(|services| {
                services
                    .iter()
                    .map(|service| format!("arn:aws:ecs:eu-west-1:123456789012:service/{}/{}", cluster, service.name))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_services(&self, cluster: &str, services: &[String]) -> Result<Vec<EcsService>>
    {
        self.check(cluster)?;
        assert!(services.len() <= 10, "describe_services called with {} services", services.len());
        self.describe_calls.lock().unwrap().push(services.len());

        let known = self.services.get(cluster).cloned().unwrap_or_default();
        Ok(services
            .iter()
            .filter_map(|requested| known.iter().find(|service| service.name == arn_name(requested)))
            .cloned()
            .collect())
    }

    async fn service_events(&self, cluster: &str, service: &str) -> Result<Vec<LogRow>>
    {
        self.check(cluster)?;
        Ok(self.events.get(&(cluster.to_string(), service.to_string())).cloned().unwrap_or_default())
    }
}
