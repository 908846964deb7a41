#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::ecr_scan::EcrScanOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    EcrScanOpts::process_args().await
}
