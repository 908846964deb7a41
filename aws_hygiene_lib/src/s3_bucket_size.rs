use anyhow::Error;
use clap::{CommandFactory, Parser};
use log::{debug, info};
use stack_string::{StackString, format_sstr};
use std::future::Future;
use stdout_channel::StdoutChannel;

use crate::{
    cloudwatch_instance::{CloudWatchInstance, MetricAverage, latest_average},
    s3_instance::S3Instance,
    session::{get_sdk_config, sdk_config_for_region},
};

/// Storage classes reported under the `BucketSizeBytes` metric
pub const STORAGE_TYPES: [&str; 3] = [
    "StandardStorage",
    "StandardIAStorage",
    "ReducedRedundancyStorage",
];

/// Daily metrics can lag by several hours, so look back further than a day
const METRIC_WINDOW_DAYS: i64 = 3;

pub trait BucketMetricsApi {
    fn bucket_size_datapoints(
        &self,
        bucket: &str,
        storage_type: &str,
    ) -> impl Future<Output = Result<Vec<MetricAverage>, Error>> + Send;
}

impl BucketMetricsApi for CloudWatchInstance {
    async fn bucket_size_datapoints(
        &self,
        bucket: &str,
        storage_type: &str,
    ) -> Result<Vec<MetricAverage>, Error> {
        self.get_daily_averages(
            "AWS/S3",
            "BucketSizeBytes",
            &[("BucketName", bucket), ("StorageType", storage_type)],
            METRIC_WINDOW_DAYS,
        )
        .await
    }
}

/// Size in bytes of one storage class, 0 when there are no datapoints
/// # Errors
/// Returns error if aws api fails
pub async fn get_bucket_size_in_bytes<T: BucketMetricsApi>(
    api: &T,
    bucket: &str,
    storage_type: &str,
) -> Result<u64, Error> {
    let datapoints = api.bucket_size_datapoints(bucket, storage_type).await?;
    let size = latest_average(&datapoints).map_or(0, |avg| avg as u64);
    debug!("bucket={bucket} storage_type={storage_type} size={size}");
    Ok(size)
}

/// # Errors
/// Returns error if aws api fails
pub async fn get_bucket_size<T: BucketMetricsApi>(api: &T, bucket: &str) -> Result<u64, Error> {
    let mut size = 0;
    for storage_type in STORAGE_TYPES {
        size += get_bucket_size_in_bytes(api, bucket, storage_type).await?;
    }
    Ok(size)
}

#[derive(Parser, Debug, Clone)]
/// Report an S3 bucket's size from CloudWatch storage metrics
pub struct S3BucketSizeOpts {
    #[clap(long)]
    /// S3 bucket to size
    bucket: Option<StackString>,
    #[clap(long, default_value = "us-east-1")]
    /// AWS region used to look up the bucket
    region: StackString,
    #[clap(short, long, env = "AWS_PROFILE")]
    /// AWS credentials profile to use
    profile: Option<StackString>,
}

impl S3BucketSizeOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let Some(bucket) = opts.bucket.as_deref().filter(|b| !b.is_empty()) else {
            Self::command().print_help()?;
            return Ok(());
        };
        let sdk_config = get_sdk_config(Some(opts.region.as_str()), opts.profile.as_deref()).await;
        let s3 = S3Instance::new(&sdk_config);
        let bucket_region = s3.get_bucket_region(bucket).await?;
        info!("bucket={bucket} region={bucket_region}");

        let cloudwatch =
            CloudWatchInstance::new(&sdk_config_for_region(&sdk_config, &bucket_region));
        let size = get_bucket_size(&cloudwatch, bucket).await?;

        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!("{size}"));
        stdout.close().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use clap::CommandFactory;
    use std::{collections::HashMap, sync::Mutex};
    use time::macros::datetime;

    use crate::{
        cloudwatch_instance::MetricAverage,
        s3_bucket_size::{BucketMetricsApi, S3BucketSizeOpts, get_bucket_size},
    };

    #[derive(Default)]
    struct FakeCloudWatch {
        datapoints: HashMap<&'static str, Vec<MetricAverage>>,
        requested: Mutex<Vec<String>>,
    }

    impl BucketMetricsApi for FakeCloudWatch {
        async fn bucket_size_datapoints(
            &self,
            bucket: &str,
            storage_type: &str,
        ) -> Result<Vec<MetricAverage>, Error> {
            self.requested
                .lock()
                .expect("lock")
                .push(format!("{bucket}/{storage_type}"));
            Ok(self.datapoints.get(storage_type).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn test_opts() {
        S3BucketSizeOpts::command().debug_assert();
    }

    #[tokio::test]
    async fn test_get_bucket_size() -> Result<(), Error> {
        let mut api = FakeCloudWatch::default();
        api.datapoints.insert(
            "StandardStorage",
            vec![
                MetricAverage {
                    timestamp: datetime!(2020-01-01 00:00:00 UTC),
                    average: 100.0,
                },
                MetricAverage {
                    timestamp: datetime!(2020-01-02 00:00:00 UTC),
                    average: 150.0,
                },
            ],
        );
        api.datapoints.insert(
            "ReducedRedundancyStorage",
            vec![MetricAverage {
                timestamp: datetime!(2020-01-02 00:00:00 UTC),
                average: 25.0,
            }],
        );
        assert_eq!(get_bucket_size(&api, "logs").await?, 175);
        assert_eq!(
            *api.requested.lock().expect("lock"),
            vec![
                "logs/StandardStorage",
                "logs/StandardIAStorage",
                "logs/ReducedRedundancyStorage"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_get_bucket_size_without_datapoints() -> Result<(), Error> {
        let api = FakeCloudWatch::default();
        assert_eq!(get_bucket_size(&api, "empty").await?, 0);
        Ok(())
    }
}
