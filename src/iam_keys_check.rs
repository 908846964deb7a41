#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::iam_keys_check::IamKeysCheckOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    IamKeysCheckOpts::process_args().await
}
