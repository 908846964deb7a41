use anyhow::{Error, format_err};
use aws_config::SdkConfig;
use aws_sdk_iam::Client as IamClient;
use log::debug;
use std::fmt;

use crate::{
    iam_keys_check::{CredentialReport, CredentialReportApi, GenerateOutcome, ReportLookup},
    iso_8601_datetime::from_aws_datetime,
};

#[derive(Clone)]
pub struct IamInstance {
    iam_client: IamClient,
}

impl fmt::Debug for IamInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("IamInstance")
    }
}

impl IamInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            iam_client: IamClient::from_conf(sdk_config.into()),
        }
    }
}

impl CredentialReportApi for IamInstance {
    async fn get_credential_report(&self) -> Result<ReportLookup, Error> {
        match self.iam_client.get_credential_report().send().await {
            Ok(output) => {
                let generated_time = output
                    .generated_time()
                    .ok_or_else(|| format_err!("credential report has no generated time"))
                    .and_then(from_aws_datetime)?;
                let content = output
                    .content()
                    .map(|blob| blob.as_ref().to_vec())
                    .unwrap_or_default();
                Ok(ReportLookup::Ready(CredentialReport {
                    content,
                    generated_time,
                }))
            }
            Err(e) => match e.as_service_error() {
                Some(se)
                    if se.is_credential_report_not_present_exception()
                        || se.is_credential_report_expired_exception() =>
                {
                    debug!("credential report missing or expired: {se}");
                    Ok(ReportLookup::NotPresent)
                }
                Some(se) if se.is_credential_report_not_ready_exception() => {
                    Ok(ReportLookup::NotReady)
                }
                _ => Err(e.into()),
            },
        }
    }

    async fn generate_credential_report(&self) -> Result<GenerateOutcome, Error> {
        match self.iam_client.generate_credential_report().send().await {
            Ok(output) => {
                debug!("generate credential report state={:?}", output.state());
                Ok(GenerateOutcome::Started)
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_limit_exceeded_exception()) =>
            {
                Ok(GenerateOutcome::LimitExceeded)
            }
            Err(e) => Err(e.into()),
        }
    }
}
