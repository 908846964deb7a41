#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::trusted_advisor_refresh::TrustedAdvisorRefreshOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    TrustedAdvisorRefreshOpts::process_args().await
}
