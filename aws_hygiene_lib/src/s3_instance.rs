use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_s3::Client as S3Client;
use stack_string::StackString;
use std::fmt;

#[derive(Clone)]
pub struct S3Instance {
    s3_client: S3Client,
}

impl fmt::Debug for S3Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("S3Instance")
    }
}

/// `GetBucketLocation` answers with an empty constraint for us-east-1 and the
/// legacy `EU` for eu-west-1
#[must_use]
pub fn normalize_bucket_region(location_constraint: Option<&str>) -> StackString {
    match location_constraint.unwrap_or("") {
        "" => "us-east-1".into(),
        "EU" => "eu-west-1".into(),
        region => region.into(),
    }
}

impl S3Instance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            s3_client: S3Client::from_conf(sdk_config.into()),
        }
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_bucket_region(&self, bucket: &str) -> Result<StackString, Error> {
        let output = self
            .s3_client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await?;
        Ok(normalize_bucket_region(
            output.location_constraint().map(|c| c.as_str()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::s3_instance::normalize_bucket_region;

    #[test]
    fn test_normalize_bucket_region() {
        assert_eq!(normalize_bucket_region(None).as_str(), "us-east-1");
        assert_eq!(normalize_bucket_region(Some("")).as_str(), "us-east-1");
        assert_eq!(normalize_bucket_region(Some("EU")).as_str(), "eu-west-1");
        assert_eq!(
            normalize_bucket_region(Some("us-west-2")).as_str(),
            "us-west-2"
        );
    }
}
