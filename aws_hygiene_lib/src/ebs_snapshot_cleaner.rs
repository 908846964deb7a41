use anyhow::{Error, format_err};
use clap::Parser;
use log::{info, warn};
use stack_string::{StackString, format_sstr};
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    ec2_instance::{Ec2Instance, SnapshotInfo},
    errors::service_error_code,
    iso_8601_datetime::expiration_date,
    lambda_handler::run_lambda,
    session::AwsOpts,
};

const SNAPSHOT_IN_USE: &str = "InvalidSnapshot.InUse";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeTag {
    pub key: StackString,
    pub value: StackString,
}

impl ExcludeTag {
    /// # Errors
    /// Returns error if only one of key and value is given
    pub fn new(key: Option<StackString>, value: Option<StackString>) -> Result<Option<Self>, Error> {
        match (key, value) {
            (Some(key), Some(value)) => Ok(Some(Self { key, value })),
            (None, None) => Ok(None),
            _ => Err(format_err!(
                "must specify both --exclude-tag-key and --exclude-tag-value"
            )),
        }
    }

    fn matches(&self, snapshot: &SnapshotInfo) -> bool {
        snapshot
            .tags
            .iter()
            .any(|(k, v)| k == &self.key && v == &self.value)
    }
}

/// Started no later than `expiration` and not carrying the excluded tag
#[must_use]
pub fn check_ebs_snapshot(
    snapshot: &SnapshotInfo,
    expiration: OffsetDateTime,
    exclude: Option<&ExcludeTag>,
) -> bool {
    let Some(start_time) = snapshot.start_time else {
        return false;
    };
    if start_time > expiration {
        return false;
    }
    !exclude.is_some_and(|tag| tag.matches(snapshot))
}

#[derive(Parser, Debug, Clone)]
/// Delete EBS snapshots older than the retention window
pub struct EbsSnapshotCleanerOpts {
    #[clap(long, env = "DRY_RUN")]
    /// Don't make any changes, log what would have happened
    dry_run: bool,
    #[clap(long, env = "RETENTION_DAYS", default_value = "30")]
    /// Maximum retention age in days
    retention_days: u32,
    #[clap(long, env = "EXCLUDE_TAG_KEY")]
    /// Key of the snapshot tag to exclude from cleanup, requires
    /// --exclude-tag-value
    exclude_tag_key: Option<StackString>,
    #[clap(long, env = "EXCLUDE_TAG_VALUE")]
    /// Value of the snapshot tag to exclude from cleanup, requires
    /// --exclude-tag-key
    exclude_tag_value: Option<StackString>,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

#[derive(Debug, Clone)]
struct SnapshotCleaner {
    ec2: Ec2Instance,
    exclude: Option<ExcludeTag>,
    retention_days: u32,
    dry_run: bool,
}

impl SnapshotCleaner {
    async fn clean_snapshots(&self) -> Result<Vec<StackString>, Error> {
        let expiration = expiration_date(OffsetDateTime::now_utc(), self.retention_days);
        let mut output = Vec::new();
        for snapshot in self.ec2.get_own_snapshots().await? {
            if !check_ebs_snapshot(&snapshot, expiration, self.exclude.as_ref()) {
                continue;
            }
            if self.dry_run {
                let line = format_sstr!("Would have deleted ebs snapshot {}", snapshot.id);
                info!("{line}");
                output.push(line);
                continue;
            }
            if let Err(e) = self.ec2.delete_snapshot(&snapshot.id).await {
                if service_error_code(&e) == Some(SNAPSHOT_IN_USE) {
                    warn!("snapshot in use, not deleted ebs-snapshot-id={}", snapshot.id);
                    continue;
                }
                return Err(format_err!(
                    "Failed to delete ebs snapshot {}: {e}",
                    snapshot.id
                ));
            }
            let line = format_sstr!("Deleted ebs snapshot {}", snapshot.id);
            info!("{line}");
            output.push(line);
        }
        Ok(output)
    }
}

impl EbsSnapshotCleanerOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let exclude = ExcludeTag::new(opts.exclude_tag_key, opts.exclude_tag_value)?;
        let sdk_config = opts.aws.sdk_config().await;
        let cleaner = SnapshotCleaner {
            ec2: Ec2Instance::new(&sdk_config),
            exclude,
            retention_days: opts.retention_days,
            dry_run: opts.dry_run,
        };

        if opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let cleaner = cleaner.clone();
                async move { cleaner.clean_snapshots().await }
            })
            .await;
        }

        let stdout = StdoutChannel::<StackString>::new();
        for line in cleaner.clean_snapshots().await? {
            stdout.send(line);
        }
        stdout.close().await.map_err(Into::into)
    }
}
