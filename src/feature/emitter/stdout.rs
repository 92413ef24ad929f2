use std::io::Write;

use async_trait::async_trait;

use super::{Emitter, EmitterOptions};
use crate::libs::{
    config::{Config, EnvLookup},
    error::Result,
    event::{unix_nanos, LogBatch, LogRow},
};

/// Prints one line per event.
#[derive(Debug, Clone, Default)]
pub struct StdoutEmitter;

impl StdoutEmitter
{
    pub fn new(_options: &EmitterOptions) -> Result<StdoutEmitter>
    {
        // nothing to configure
        Ok(StdoutEmitter)
    }
}

pub fn configure_env_vars(_config: &mut Config, _env: EnvLookup<'_>)
{
    // nothing to configure
}

pub fn format_row(batch: &LogBatch, row: &LogRow) -> String
{
    format!(
        "[{} / {}] [{} {} {} {} {}] {}",
        row.timestamp.format("%Y-%m-%d %H:%M:%S%.f %z %Z"),
        unix_nanos(&row.timestamp),
        batch.account_id,
        batch.role_arn,
        batch.region,
        batch.cluster,
        batch.service.name,
        row.msg
    )
}

#[async_trait]
impl Emitter for StdoutEmitter
{
    async fn process_log_batch(&self, batch: &LogBatch) -> Result<()>
    {
        // One lock for the whole batch keeps its lines together.
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for row in &batch.logs
        {
            writeln!(handle, "{}", format_row(batch, row))?;
        }
        handle.flush()?;
        Ok(())
    }
}

#[test]
fn test_format_row()
{
    use chrono::{TimeZone, Utc};

    use crate::libs::event::EcsService;

    let batch = LogBatch {
        account_id: "123456789012".to_string(),
        role_arn: "arn:aws:sts::123456789012:assumed-role/reader/session".to_string(),
        region: "eu-west-1".to_string(),
        cluster: "production".to_string(),
        service: EcsService { name: "api".to_string(), tags: vec![] },
        logs: vec![],
    };
    let row = LogRow {
        msg: "(service api) has reached a steady state.".to_string(),
        timestamp: Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap(),
    };

    assert_eq!(
        format_row(&batch, &row),
        "[2026-10-16 09:30:00 +0000 UTC / 1792143000000000000] \
         [123456789012 arn:aws:sts::123456789012:assumed-role/reader/session eu-west-1 production api] \
         (service api) has reached a steady state."
    );
}
