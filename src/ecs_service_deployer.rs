#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::ecs_service_deployer::EcsServiceDeployerOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    EcsServiceDeployerOpts::process_args().await
}
