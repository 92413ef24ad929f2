use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag
{
    pub key: String,
    pub value: String,
}

impl Tag
{
    pub fn new(key: &str, value: &str) -> Tag
    {
        Tag { key: key.to_string(), value: value.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsCluster
{
    pub name: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsService
{
    pub name: String,
    pub tags: Vec<Tag>,
}

/// Who a client is scanning as, resolved from the caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity
{
    pub account_id: String,
    pub role_arn: String,
    pub region: String,
}

/// A single service event message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow
{
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

/// New events for one service, with everything needed to label them.
#[derive(Debug, Clone)]
pub struct LogBatch
{
    pub account_id: String,
    pub role_arn: String,
    pub region: String,
    pub cluster: String,
    pub service: EcsService,
    pub logs: Vec<LogRow>,
}

impl LogBatch
{
    pub fn new(identity: &ClientIdentity, cluster: &str, service: EcsService, logs: Vec<LogRow>) -> LogBatch
    {
        LogBatch {
            account_id: identity.account_id.clone(),
            role_arn: identity.role_arn.clone(),
            region: identity.region.clone(),
            cluster: cluster.to_string(),
            service,
            logs,
        }
    }
}

/// Nanoseconds since the epoch, saturating for timestamps past 2262.
pub fn unix_nanos(timestamp: &DateTime<Utc>) -> i64
{
    timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
