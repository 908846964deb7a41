use anyhow::{Error, format_err};
use clap::Parser;
use log::info;
use stack_string::{StackString, format_sstr};
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    config::Config,
    iso_8601_datetime::{convert_datetime_to_str, expiration_date},
    rds_instance::{DbSnapshotInfo, RdsInstance},
    session::AwsOpts,
};

/// Newest first
pub fn sort_db_snapshots(snapshots: &mut [DbSnapshotInfo]) {
    snapshots.sort_by(|a, b| b.create_time.cmp(&a.create_time));
}

/// Snapshots created before `expiration`, plus any beyond the newest
/// `max_snapshots` (0 means no count limit)
#[must_use]
pub fn find_db_snapshots_to_delete(
    mut snapshots: Vec<DbSnapshotInfo>,
    expiration: OffsetDateTime,
    max_snapshots: usize,
) -> Vec<DbSnapshotInfo> {
    sort_db_snapshots(&mut snapshots);
    snapshots
        .into_iter()
        .enumerate()
        .filter_map(|(i, snapshot)| {
            let expired = snapshot.create_time < expiration;
            let over_limit = max_snapshots != 0 && i + 1 > max_snapshots;
            (expired || over_limit).then_some(snapshot)
        })
        .collect()
}

#[derive(Parser, Debug, Clone)]
/// Delete manual RDS snapshots past retention or over a count limit
pub struct RdsSnapshotCleanerOpts {
    #[clap(long, env = "DB_INSTANCE_IDENTIFIER")]
    /// RDS database instance identifier
    db_instance_identifier: StackString,
    #[clap(long, default_value = "30")]
    /// Maximum retention age in days
    retention_days: u32,
    #[clap(long, default_value = "0")]
    /// Maximum number of manual snapshots allowed, takes precedence over
    /// --retention-days
    max_snapshots: usize,
    #[clap(long)]
    /// Don't make any changes, log what would have happened
    dry_run: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

impl RdsSnapshotCleanerOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        if opts.db_instance_identifier.is_empty() {
            return Err(format_err!("DB instance identifier is required"));
        }
        let config = Config::init_config()?;
        let sdk_config = opts.aws.sdk_config().await;
        let rds = RdsInstance::new(&sdk_config);

        let expiration = expiration_date(OffsetDateTime::now_utc(), opts.retention_days);
        let snapshots = rds
            .get_manual_db_snapshots(&opts.db_instance_identifier)
            .await?;
        let to_delete = find_db_snapshots_to_delete(snapshots, expiration, opts.max_snapshots);
        info!("{} DB snapshots to delete", to_delete.len());

        let stdout = StdoutChannel::<StackString>::new();
        for snapshot in &to_delete {
            let created = convert_datetime_to_str(snapshot.create_time)?;
            if opts.dry_run {
                stdout.send(format_sstr!(
                    "Would delete DB snapshot '{}' created on {created}",
                    snapshot.id
                ));
                continue;
            }
            info!("deleting snapshot '{}' created on {created}", snapshot.id);
            rds.delete_db_snapshot(&snapshot.id).await?;
            rds.wait_for_db_snapshot_deleted(
                &snapshot.id,
                config.waiter_max_attempts,
                config.waiter_poll_interval(),
            )
            .await?;
            stdout.send(format_sstr!("Deleted DB snapshot '{}'", snapshot.id));
        }
        stdout.close().await.map_err(Into::into)
    }
}
