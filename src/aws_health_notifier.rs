#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::aws_health_notifier::AwsHealthNotifierOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    AwsHealthNotifierOpts::process_args().await
}
