#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::rds_cloudwatch_logs::RdsCloudwatchLogsOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    RdsCloudwatchLogsOpts::process_args().await
}
