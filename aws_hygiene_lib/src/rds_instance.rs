use anyhow::{Error, format_err};
use aws_config::SdkConfig;
use aws_sdk_rds::{
    Client as RdsClient,
    types::{DbSnapshot, DescribeDbLogFilesDetails},
};
use log::debug;
use stack_string::{StackString, format_sstr};
use std::{fmt, time::Duration};
use time::OffsetDateTime;

use crate::{
    errors::service_error_code,
    iso_8601_datetime::from_aws_datetime,
    poll::{PollStatus, poll_with_fixed_delay},
    rds_cloudwatch_logs::{LogFilePortion, RdsLogApi},
};

const DB_SNAPSHOT_NOT_FOUND: &str = "DBSnapshotNotFound";

#[derive(Clone)]
pub struct RdsInstance {
    rds_client: RdsClient,
}

impl fmt::Debug for RdsInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RdsInstance")
    }
}

impl RdsInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            rds_client: RdsClient::from_conf(sdk_config.into()),
        }
    }

    /// Manual snapshots of the instance, excluding public and shared ones.
    /// Snapshots without a creation time are skipped.
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_manual_db_snapshots(
        &self,
        db_instance_identifier: &str,
    ) -> Result<Vec<DbSnapshotInfo>, Error> {
        let mut marker: Option<String> = None;
        let mut snapshots = Vec::new();
        loop {
            let output = self
                .rds_client
                .describe_db_snapshots()
                .db_instance_identifier(db_instance_identifier)
                .include_public(false)
                .include_shared(false)
                .snapshot_type("manual")
                .set_marker(marker.take())
                .send()
                .await?;
            snapshots.extend(
                output
                    .db_snapshots()
                    .iter()
                    .filter_map(DbSnapshotInfo::from_db_snapshot),
            );
            match output.marker() {
                Some(m) if !m.is_empty() => marker = Some(m.into()),
                _ => break,
            }
        }
        Ok(snapshots)
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn delete_db_snapshot(&self, db_snapshot_identifier: &str) -> Result<(), Error> {
        self.rds_client
            .delete_db_snapshot()
            .db_snapshot_identifier(db_snapshot_identifier)
            .send()
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns error if aws api fails for any reason other than the snapshot
    /// being gone
    pub async fn db_snapshot_exists(&self, db_snapshot_identifier: &str) -> Result<bool, Error> {
        let result = self
            .rds_client
            .describe_db_snapshots()
            .db_snapshot_identifier(db_snapshot_identifier)
            .send()
            .await;
        match result {
            Ok(output) => Ok(!output.db_snapshots().is_empty()),
            Err(e) if service_error_code(&e) == Some(DB_SNAPSHOT_NOT_FOUND) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    /// Returns error if aws api fails or the snapshot is still present after
    /// every attempt
    pub async fn wait_for_db_snapshot_deleted(
        &self,
        db_snapshot_identifier: &str,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), Error> {
        let what = format_sstr!("db snapshot {db_snapshot_identifier} to be deleted");
        poll_with_fixed_delay(&what, attempts, delay, |_| async move {
            if self.db_snapshot_exists(db_snapshot_identifier).await? {
                Ok(PollStatus::Pending)
            } else {
                Ok(PollStatus::Done(()))
            }
        })
        .await
    }
}

impl RdsLogApi for RdsInstance {
    async fn get_log_files_since(
        &self,
        db_instance_identifier: &str,
        since_ms: i64,
    ) -> Result<Vec<DbLogFileInfo>, Error> {
        let mut marker: Option<String> = None;
        let mut log_files = Vec::new();
        loop {
            let output = self
                .rds_client
                .describe_db_log_files()
                .db_instance_identifier(db_instance_identifier)
                .file_last_written(since_ms)
                .set_marker(marker.take())
                .send()
                .await?;
            log_files.extend(
                output
                    .describe_db_log_files()
                    .iter()
                    .filter_map(DbLogFileInfo::from_details),
            );
            match output.marker() {
                Some(m) if !m.is_empty() => marker = Some(m.into()),
                _ => break,
            }
        }
        debug!("found {} log files for {db_instance_identifier}", log_files.len());
        Ok(log_files)
    }

    async fn download_log_file_portion(
        &self,
        db_instance_identifier: &str,
        log_file_name: &str,
        marker: &str,
        number_of_lines: i32,
    ) -> Result<LogFilePortion, Error> {
        let output = self
            .rds_client
            .download_db_log_file_portion()
            .db_instance_identifier(db_instance_identifier)
            .log_file_name(log_file_name)
            .marker(marker)
            .number_of_lines(number_of_lines)
            .send()
            .await?;
        let additional_data_pending = output.additional_data_pending().unwrap_or(false);
        let marker = match output.marker() {
            Some(m) => Some(m.into()),
            None if additional_data_pending => {
                return Err(format_err!(
                    "log file {log_file_name} has more data but no marker"
                ));
            }
            None => None,
        };
        Ok(LogFilePortion {
            data: output.log_file_data().map(Into::into),
            marker,
            additional_data_pending,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSnapshotInfo {
    pub id: StackString,
    pub create_time: OffsetDateTime,
    pub status: Option<StackString>,
}

impl DbSnapshotInfo {
    fn from_db_snapshot(snapshot: &DbSnapshot) -> Option<Self> {
        Some(Self {
            id: snapshot.db_snapshot_identifier()?.into(),
            create_time: from_aws_datetime(snapshot.snapshot_create_time()?).ok()?,
            status: snapshot.status().map(Into::into),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbLogFileInfo {
    pub name: StackString,
    /// milliseconds since the epoch
    pub last_written: i64,
    pub size: i64,
}

impl DbLogFileInfo {
    fn from_details(details: &DescribeDbLogFilesDetails) -> Option<Self> {
        Some(Self {
            name: details.log_file_name()?.into(),
            last_written: details.last_written().unwrap_or(0),
            size: details.size().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_rds::types::{DbSnapshot, DescribeDbLogFilesDetails};
    use aws_smithy_types::DateTime;
    use time::macros::datetime;

    use crate::rds_instance::{DbLogFileInfo, DbSnapshotInfo};

    #[test]
    fn test_db_snapshot_info() {
        let snapshot = DbSnapshot::builder()
            .db_snapshot_identifier("foo-db-2017-03-01")
            .snapshot_create_time(DateTime::from_secs(
                datetime!(2017-03-01 22:00:00 UTC).unix_timestamp(),
            ))
            .status("available")
            .build();
        let info = DbSnapshotInfo::from_db_snapshot(&snapshot).expect("has create time");
        assert_eq!(info.id.as_str(), "foo-db-2017-03-01");
        assert_eq!(info.create_time, datetime!(2017-03-01 22:00:00 UTC));
        assert_eq!(info.status.as_deref(), Some("available"));

        let creating = DbSnapshot::builder()
            .db_snapshot_identifier("foo-db-creating")
            .status("creating")
            .build();
        assert!(DbSnapshotInfo::from_db_snapshot(&creating).is_none());
    }

    #[test]
    fn test_db_log_file_info() {
        let details = DescribeDbLogFilesDetails::builder()
            .log_file_name("error/postgresql.log.2018-01-01-00")
            .last_written(1_514_768_400_000)
            .size(1024)
            .build();
        let info = DbLogFileInfo::from_details(&details).expect("has name");
        assert_eq!(info.name.as_str(), "error/postgresql.log.2018-01-01-00");
        assert_eq!(info.last_written, 1_514_768_400_000);
        assert_eq!(info.size, 1024);
    }
}
