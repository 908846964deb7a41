#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::ami_cleaner::AmiCleanerOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    AmiCleanerOpts::process_args().await
}
