use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_support::Client as SupportClient;
use std::fmt;

use crate::trusted_advisor_refresh::{CheckInfo, TrustedAdvisorApi};

#[derive(Clone)]
pub struct SupportInstance {
    support_client: SupportClient,
}

impl fmt::Debug for SupportInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SupportInstance")
    }
}

impl SupportInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            support_client: SupportClient::from_conf(sdk_config.into()),
        }
    }
}

impl TrustedAdvisorApi for SupportInstance {
    async fn describe_checks(&self) -> Result<Vec<CheckInfo>, Error> {
        let output = self
            .support_client
            .describe_trusted_advisor_checks()
            .language("en")
            .send()
            .await?;
        Ok(output
            .checks()
            .iter()
            .map(|c| CheckInfo {
                id: c.id().into(),
                name: c.name().into(),
            })
            .collect())
    }

    async fn refresh_check(&self, check_id: &str) -> Result<(), Error> {
        self.support_client
            .refresh_trusted_advisor_check()
            .check_id(check_id)
            .send()
            .await?;
        Ok(())
    }
}
