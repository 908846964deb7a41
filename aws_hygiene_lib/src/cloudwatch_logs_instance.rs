use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_cloudwatchlogs::{Client as CloudWatchLogsClient, types::InputLogEvent};
use log::debug;
use std::fmt;

use crate::rds_cloudwatch_logs::{LogEvent, LogStreamApi};

#[derive(Clone)]
pub struct CloudWatchLogsInstance {
    logs_client: CloudWatchLogsClient,
}

impl fmt::Debug for CloudWatchLogsInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CloudWatchLogsInstance")
    }
}

impl CloudWatchLogsInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            logs_client: CloudWatchLogsClient::from_conf(sdk_config.into()),
        }
    }
}

impl LogStreamApi for CloudWatchLogsInstance {
    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<bool, Error> {
        let result = self
            .logs_client
            .create_log_stream()
            .log_group_name(log_group)
            .log_stream_name(log_stream)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_resource_already_exists_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        events: &[LogEvent],
    ) -> Result<(), Error> {
        let events = events
            .iter()
            .map(|e| {
                InputLogEvent::builder()
                    .timestamp(e.timestamp)
                    .message(e.message.as_str())
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let output = self
            .logs_client
            .put_log_events()
            .log_group_name(log_group)
            .log_stream_name(log_stream)
            .set_log_events(Some(events))
            .send()
            .await?;
        if let Some(rejected) = output.rejected_log_events_info() {
            debug!("rejected log events {rejected:?}");
        }
        Ok(())
    }
}
