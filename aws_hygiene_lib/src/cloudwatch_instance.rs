use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_cloudwatch::{
    Client as CloudWatchClient,
    types::{Datapoint, Dimension, Statistic},
};
use std::fmt;
use time::{Duration, OffsetDateTime};

use crate::iso_8601_datetime::{from_aws_datetime, to_aws_datetime};

#[derive(Clone)]
pub struct CloudWatchInstance {
    cloudwatch_client: CloudWatchClient,
}

impl fmt::Debug for CloudWatchInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CloudWatchInstance")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAverage {
    pub timestamp: OffsetDateTime,
    pub average: f64,
}

impl MetricAverage {
    fn from_datapoint(datapoint: &Datapoint) -> Option<Self> {
        Some(Self {
            timestamp: from_aws_datetime(datapoint.timestamp()?).ok()?,
            average: datapoint.average()?,
        })
    }
}

/// Average of the most recent datapoint
#[must_use]
pub fn latest_average(datapoints: &[MetricAverage]) -> Option<f64> {
    datapoints
        .iter()
        .max_by_key(|d| d.timestamp)
        .map(|d| d.average)
}

impl CloudWatchInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            cloudwatch_client: CloudWatchClient::from_conf(sdk_config.into()),
        }
    }

    /// Daily `Average` datapoints of `namespace/metric_name` over the last
    /// `days` days
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_daily_averages(
        &self,
        namespace: &str,
        metric_name: &str,
        dimensions: &[(&str, &str)],
        days: i64,
    ) -> Result<Vec<MetricAverage>, Error> {
        let end_time = OffsetDateTime::now_utc();
        let start_time = end_time - Duration::days(days);
        let dimensions = dimensions
            .iter()
            .map(|(name, value)| Dimension::builder().name(*name).value(*value).build())
            .collect();
        let output = self
            .cloudwatch_client
            .get_metric_statistics()
            .namespace(namespace)
            .metric_name(metric_name)
            .set_dimensions(Some(dimensions))
            .start_time(to_aws_datetime(start_time))
            .end_time(to_aws_datetime(end_time))
            .period(86_400)
            .statistics(Statistic::Average)
            .send()
            .await?;
        Ok(output
            .datapoints()
            .iter()
            .filter_map(MetricAverage::from_datapoint)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_cloudwatch::types::Datapoint;
    use aws_smithy_types::DateTime;
    use time::macros::datetime;

    use crate::cloudwatch_instance::{MetricAverage, latest_average};

    #[test]
    fn test_latest_average() {
        let datapoints = [
            MetricAverage {
                timestamp: datetime!(2018-01-01 00:00:00 UTC),
                average: 1.0,
            },
            MetricAverage {
                timestamp: datetime!(2018-01-03 00:00:00 UTC),
                average: 3.0,
            },
            MetricAverage {
                timestamp: datetime!(2018-01-02 00:00:00 UTC),
                average: 2.0,
            },
        ];
        assert_eq!(latest_average(&datapoints), Some(3.0));
        assert_eq!(latest_average(&[]), None);
    }

    #[test]
    fn test_metric_average_from_datapoint() {
        let datapoint = Datapoint::builder()
            .timestamp(DateTime::from_secs(1_514_764_800))
            .average(1024.0)
            .build();
        let average = MetricAverage::from_datapoint(&datapoint).expect("complete datapoint");
        assert_eq!(average.timestamp, datetime!(2018-01-01 00:00:00 UTC));
        assert_eq!(average.average, 1024.0);

        let missing = Datapoint::builder().average(1.0).build();
        assert!(MetricAverage::from_datapoint(&missing).is_none());
    }
}
