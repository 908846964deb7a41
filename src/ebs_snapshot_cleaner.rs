#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::ebs_snapshot_cleaner::EbsSnapshotCleanerOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    EbsSnapshotCleanerOpts::process_args().await
}
