#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::packer_janitor::PackerJanitorOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    PackerJanitorOpts::process_args().await
}
