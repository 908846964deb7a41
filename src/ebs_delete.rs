#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::ebs_delete::EbsDeleteOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    EbsDeleteOpts::process_args().await
}
