use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_sts::Client as StsClient;
use log::debug;
use stack_string::{StackString, format_sstr};
use std::fmt;

use crate::session::sdk_config_with_credentials;

#[derive(Clone)]
pub struct StsInstance {
    sts_client: StsClient,
    sdk_config: SdkConfig,
}

impl fmt::Debug for StsInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("StsInstance")
    }
}

#[must_use]
pub fn role_arn(account_id: &str, role_name: &str) -> StackString {
    format_sstr!("arn:aws:iam::{account_id}:role/{role_name}")
}

impl StsInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            sts_client: StsClient::from_conf(sdk_config.into()),
            sdk_config: sdk_config.clone(),
        }
    }

    /// Assume `role_name` in `account_id`, returning a config that signs with
    /// the temporary credentials
    /// # Errors
    /// Returns error if aws api fails
    pub async fn assume_role_config(
        &self,
        account_id: &str,
        role_name: &str,
        session_name: &str,
    ) -> Result<SdkConfig, Error> {
        let arn = role_arn(account_id, role_name);
        debug!("assuming role {arn} session={session_name}");
        let output = self
            .sts_client
            .assume_role()
            .role_arn(arn.as_str())
            .role_session_name(session_name)
            .send()
            .await?;
        sdk_config_with_credentials(&self.sdk_config, output.credentials(), "assume-role")
    }
}

#[cfg(test)]
mod tests {
    use crate::sts_instance::role_arn;

    #[test]
    fn test_role_arn() {
        assert_eq!(
            role_arn("123456789012", "ami-cleaner").as_str(),
            "arn:aws:iam::123456789012:role/ami-cleaner"
        );
    }
}
