#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::rds_snapshot_cleaner::RdsSnapshotCleanerOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    RdsSnapshotCleanerOpts::process_args().await
}
