use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{future::join_all, stream, StreamExt};
use log::{debug, error, info, warn};

use super::{
    aws::{clients_for_role, EcsApi},
    discovery::{cluster_list, deployment_logs, service_list},
    emitter::Emitter,
};
use crate::libs::{
    config::{Config, TagFilter},
    error::{Error, Result},
    event::{EcsService, LogBatch},
};

/// Which clusters and services to look at.
#[derive(Debug, Clone, Default)]
pub struct ScanTargets
{
    pub clusters: Vec<String>,
    pub cluster_tags: Vec<TagFilter>,
    pub services: Vec<String>,
    pub service_tags: Vec<TagFilter>,
}

impl From<&Config> for ScanTargets
{
    fn from(config: &Config) -> Self
    {
        ScanTargets {
            clusters: config.clusters.clone(),
            cluster_tags: config.cluster_tags.clone(),
            services: config.services.clone(),
            service_tags: config.service_tags.clone(),
        }
    }
}

/// Outcome of a single scan.
#[derive(Debug, Default)]
pub struct ScanReport
{
    pub services: usize,
    pub batches: usize,
    pub events: usize,
    pub errors: Vec<Error>,
}

/// Role, region, cluster and service name.
type ServiceKey = (String, String, String, String);

pub struct Scanner
{
    clients: Vec<Arc<dyn EcsApi>>,
    emitter: Arc<dyn Emitter>,
    targets: ScanTargets,
    interval: Duration,
    max_concurrency: usize,
    /// Window starts of services whose last export failed.
    backlog: Mutex<HashMap<ServiceKey, DateTime<Utc>>>,
}

/// Default credentials for every configured region (unless ignored), then
/// every role for each of its regions.
pub async fn connect_clients(config: &Config) -> Vec<Arc<dyn EcsApi>>
{
    let mut clients = Vec::new();
    if !config.ignore_default_credentials
    {
        clients.extend(clients_for_role(&config.regions, None).await);
    }
    for role in &config.roles
    {
        clients.extend(clients_for_role(&role.regions, Some(role.role_arn.as_str())).await);
    }
    clients
}

impl Scanner
{
    pub fn new(config: &Config, clients: Vec<Arc<dyn EcsApi>>, emitter: Arc<dyn Emitter>) -> Result<Scanner>
    {
        // bail out if we have no clients to scrape
        if clients.is_empty()
        {
            return Err(Error::Config("no aws credentials to use".to_string()));
        }

        Ok(Scanner {
            clients,
            emitter,
            targets: ScanTargets::from(config),
            interval: config.scan_interval(),
            max_concurrency: config.max_concurrency.max(1),
            backlog: Mutex::new(HashMap::new()),
        })
    }

    /// Exports every event created in `(since, until]`. Errors are collected
    /// rather than returned so one bad cluster does not hide the others.
    pub async fn scan(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> ScanReport
    {
        let mut report = ScanReport::default();
        let targets = &self.targets;

        // clients -> clusters
        let cluster_results = join_all(self.clients.iter().map(|client| async move {
            let clusters = cluster_list(client.as_ref(), &targets.clusters, &targets.cluster_tags).await;
            (client.clone(), clusters)
        }))
        .await;

        let mut cluster_work = Vec::new();
        for (client, clusters) in cluster_results
        {
            match clusters
            {
                Ok(clusters) => cluster_work.extend(clusters.into_iter().map(|cluster| (client.clone(), cluster))),
                Err(err) => report.errors.push(err),
            }
        }

        // clusters -> services
        let service_results: Vec<_> = stream::iter(cluster_work)
            .map(|(client, cluster)| async move {
                let services = service_list(client.as_ref(), &cluster, &targets.services, &targets.service_tags).await;
                (client, cluster, services)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut service_work = Vec::new();
        for (client, cluster, services) in service_results
        {
            match services
            {
                Ok(services) => service_work.extend(services.into_iter().map(|service| (client.clone(), cluster.clone(), service))),
                Err(err) => report.errors.push(err),
            }
        }
        report.services = service_work.len();

        // services -> events -> emitter
        let export_results: Vec<Result<usize>> = stream::iter(service_work)
            .map(|(client, cluster, service)| async move {
                self.export_service(client.as_ref(), &cluster, service, since, until).await
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for result in export_results
        {
            match result
            {
                Ok(0) => {},
                Ok(events) =>
                {
                    report.batches += 1;
                    report.events += events;
                }
                Err(err) => report.errors.push(err),
            }
        }

        report
    }

    /// Exports one service, starting from its backlog if an earlier export
    /// failed. A failure keeps the window start for the next scan.
    async fn export_service(
        &self,
        api: &dyn EcsApi,
        cluster: &str,
        service: EcsService,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<usize>
    {
        let identity = api.identity();
        let key: ServiceKey = (identity.role_arn.clone(), identity.region.clone(), cluster.to_string(), service.name.clone());

        let since = {
            let backlog = self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            backlog.get(&key).map_or(since, |pending| (*pending).min(since))
        };

        let result = self.export_window(api, cluster, service, since, until).await;

        let mut backlog = self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &result
        {
            Ok(_) =>
            {
                backlog.remove(&key);
            }
            Err(_) =>
            {
                warn!("{}/{} will be retried from {}", key.2, key.3, since);
                backlog.insert(key, since);
            }
        }
        result
    }

    async fn export_window(
        &self,
        api: &dyn EcsApi,
        cluster: &str,
        service: EcsService,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<usize>
    {
        let logs = deployment_logs(api, cluster, &service.name, since, until).await?;
        if logs.is_empty()
        {
            return Ok(0);
        }

        let events = logs.len();
        let batch = LogBatch::new(api.identity(), cluster, service, logs);
        self.emitter.process_log_batch(&batch).await?;
        Ok(events)
    }

    /// Scans every `interval` until `shutdown` resolves. Each scan picks up
    /// where the previous one ended, and services that failed to export are
    /// retried from the start of their failed window.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let lookback = chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut since = Utc::now() - lookback;

        loop
        {
            let until = Utc::now();
            let report = tokio::select! {
                report = self.scan(since, until) => report,
                _ = &mut shutdown =>
                {
                    info!("Shutting down");
                    return;
                }
            };

            for err in &report.errors
            {
                error!("error: {}", err);
            }
            debug!(
                "Scanned {} service(s) from {} to {}: {} event(s) in {} batch(es), {} error(s)",
                report.services, since, until, report.events, report.batches, report.errors.len()
            );
            since = until;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = &mut shutdown =>
                {
                    info!("Shutting down");
                    return;
                }
            }
        }
    }
}

/// Resolves on ctrl+c, or SIGTERM on unix.
pub async fn shutdown_signal()
{
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await
        {
            error!("failed to listen for ctrl+c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(mut signal) =>
            {
                signal.recv().await;
            }
            Err(err) =>
            {
                error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
#[derive(Default)]
struct RecordingEmitter
{
    batches: Mutex<Vec<LogBatch>>,
    fail_for: Mutex<Option<String>>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Emitter for RecordingEmitter
{
    async fn process_log_batch(&self, batch: &LogBatch) -> Result<()>
    {
        if self.fail_for.lock().unwrap().as_deref() == Some(batch.service.name.as_str())
        {
            return Err(Error::Emitter(format!("refusing {}", batch.service.name)));
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
fn seconds_ago(seconds: i64) -> DateTime<Utc>
{
    Utc::now() - chrono::Duration::seconds(seconds)
}

#[cfg(test)]
fn event(seconds: i64, msg: &str) -> crate::libs::event::LogRow
{
    crate::libs::event::LogRow { msg: msg.to_string(), timestamp: seconds_ago(seconds) }
}

#[test]
fn test_requires_clients()
{
    let emitter: Arc<dyn Emitter> = Arc::new(RecordingEmitter::default());
    let error = Scanner::new(&Config::default(), vec![], emitter).err().unwrap();
    assert!(error.to_string().contains("no aws credentials to use"));
}

#[tokio::test]
async fn test_scan_exports_new_events_per_service()
{
    use super::fake::FakeEcs;

    let api = FakeEcs::default()
        .with_cluster("production", &[("environment", "production")])
        .with_cluster("staging", &[("environment", "staging")])
        .with_service("production", "api", &[("team", "platform")])
        .with_service("production", "worker", &[])
        .with_service("production", "idle", &[])
        .with_service("staging", "api", &[])
        .with_events("production", "api", vec![event(5, "api deployed"), event(500, "ancient history")])
        .with_events("production", "worker", vec![event(20, "worker started"), event(10, "worker steady")])
        .with_events("staging", "api", vec![event(5, "staging api deployed")]);

    let config = Config::parse("cluster_tags:\n  - environment: production\nmax_concurrency: 2\n").unwrap();
    let emitter = Arc::new(RecordingEmitter::default());
    let scanner = Scanner::new(&config, vec![Arc::new(api) as Arc<dyn EcsApi>], emitter.clone()).unwrap();

    let report = scanner.scan(seconds_ago(60), Utc::now()).await;

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.services, 3);
    assert_eq!(report.batches, 2);
    assert_eq!(report.events, 3);

    let mut batches = emitter.batches.lock().unwrap().clone();
    batches.sort_by(|a, b| a.service.name.cmp(&b.service.name));
    assert_eq!(batches[0].service.name, "api");
    assert_eq!(batches[0].cluster, "production");
    assert_eq!(batches[0].account_id, "123456789012");
    assert_eq!(batches[0].region, "eu-west-1");
    assert_eq!(batches[0].service.tags, super::fake::to_tags(&[("team", "platform")]));
    assert_eq!(batches[0].logs.len(), 1);

    let worker: Vec<&str> = batches[1].logs.iter().map(|row| row.msg.as_str()).collect();
    assert_eq!(worker, vec!["worker started", "worker steady"]);
}

#[tokio::test]
async fn test_scan_collects_errors_and_carries_on()
{
    use super::fake::FakeEcs;

    let api = FakeEcs::default()
        .with_cluster("broken", &[])
        .with_cluster("production", &[])
        .with_service("production", "api", &[])
        .with_service("production", "rejected", &[])
        .with_events("production", "api", vec![event(5, "api deployed")])
        .with_events("production", "rejected", vec![event(5, "rejected deployed")])
        .failing("broken");

    let emitter = Arc::new(RecordingEmitter { fail_for: Mutex::new(Some("rejected".to_string())), ..Default::default() });
    let scanner = Scanner::new(&Config::default(), vec![Arc::new(api) as Arc<dyn EcsApi>], emitter.clone()).unwrap();

    let report = scanner.scan(seconds_ago(60), Utc::now()).await;

    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    assert_eq!(report.batches, 1);
    assert_eq!(emitter.batches.lock().unwrap()[0].service.name, "api");
}

#[tokio::test]
async fn test_run_scans_until_shutdown()
{
    use super::fake::FakeEcs;

    let api = FakeEcs::default()
        .with_cluster("production", &[])
        .with_service("production", "api", &[])
        .with_events("production", "api", vec![event(5, "api deployed")]);

    let mut config = Config::default();
    config.scan_interval = 3600;
    let emitter = Arc::new(RecordingEmitter::default());
    let scanner = Scanner::new(&config, vec![Arc::new(api) as Arc<dyn EcsApi>], emitter.clone()).unwrap();

    scanner.run(tokio::time::sleep(Duration::from_millis(200))).await;

    assert_eq!(emitter.batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_export_is_retried_from_its_window()
{
    use super::fake::FakeEcs;

    let api = FakeEcs::default()
        .with_cluster("production", &[])
        .with_service("production", "api", &[])
        .with_service("production", "rejected", &[])
        .with_events("production", "api", vec![event(30, "api deployed")])
        .with_events("production", "rejected", vec![event(30, "rejected deployed")]);

    let emitter = Arc::new(RecordingEmitter { fail_for: Mutex::new(Some("rejected".to_string())), ..Default::default() });
    let scanner = Scanner::new(&Config::default(), vec![Arc::new(api) as Arc<dyn EcsApi>], emitter.clone()).unwrap();

    let first_until = Utc::now();
    let report = scanner.scan(seconds_ago(60), first_until).await;
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.batches, 1);

    // The emitter recovers; the next window alone no longer holds either event.
    *emitter.fail_for.lock().unwrap() = None;
    let report = scanner.scan(first_until, Utc::now()).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.batches, 1);

    let batches = emitter.batches.lock().unwrap().clone();
    let exported: Vec<(&str, &str)> = batches
        .iter()
        .flat_map(|batch| batch.logs.iter().map(move |row| (batch.service.name.as_str(), row.msg.as_str())))
        .collect();
    assert_eq!(exported, vec![("api", "api deployed"), ("rejected", "rejected deployed")]);

    // Once exported, the service is back on the shared window.
    let report = scanner.scan(Utc::now(), Utc::now()).await;
    assert_eq!(report.batches, 0);
}
