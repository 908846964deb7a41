#![allow(clippy::semicolon_if_nothing_returned)]
use anyhow::Error;
use aws_hygiene_lib::s3_bucket_size::S3BucketSizeOpts;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    S3BucketSizeOpts::process_args().await
}
