use aws_config::SdkConfig;
use aws_sdk_ssm::{Client as SsmClient, operation::get_parameter::GetParameterError};
use log::error;
use stack_string::StackString;
use std::fmt;

use crate::errors::{AwsSdkError, HygieneError};

#[derive(Clone)]
pub struct SsmInstance {
    ssm_client: SsmClient,
}

impl fmt::Debug for SsmInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SsmInstance")
    }
}

impl SsmInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            ssm_client: SsmClient::from_conf(sdk_config.into()),
        }
    }

    /// Fetch and decrypt a `SecureString` parameter
    /// # Errors
    /// Returns `SsmInternalError`, `SsmInvalidKey` or `SsmMissingValue` for
    /// the cases callers usually report, other aws failures are passed on
    pub async fn decrypt_value(&self, name: &str) -> Result<StackString, HygieneError> {
        let output = self
            .ssm_client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| classify_get_parameter_error(name, e))?;
        output
            .parameter()
            .and_then(|p| p.value())
            .map(Into::into)
            .ok_or_else(|| HygieneError::SsmMissingValue(name.into()))
    }
}

fn classify_get_parameter_error(
    name: &str,
    err: AwsSdkError<GetParameterError>,
) -> HygieneError {
    match err.as_service_error() {
        Some(e) if e.is_internal_server_error() => {
            error!("internal error fetching parameter {name}: {e}");
            HygieneError::SsmInternalError(name.into())
        }
        Some(e)
            if e.is_invalid_key_id()
                || e.is_parameter_not_found()
                || e.is_parameter_version_not_found() =>
        {
            error!("invalid parameter store key {name}: {e}");
            HygieneError::SsmInvalidKey(name.into())
        }
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_ssm::{
        operation::get_parameter::GetParameterError,
        types::error::{InternalServerError, ParameterNotFound},
    };
    use aws_smithy_runtime_api::{
        client::result::SdkError,
        http::{Response, StatusCode},
    };
    use aws_smithy_types::body::SdkBody;

    use crate::{errors::HygieneError, ssm_instance::classify_get_parameter_error};

    fn service_error(err: GetParameterError) -> SdkError<GetParameterError, Response> {
        let status = StatusCode::try_from(400).expect("valid status");
        SdkError::service_error(err, Response::new(status, SdkBody::empty()))
    }

    #[test]
    fn test_classify_get_parameter_error() {
        let err = service_error(GetParameterError::ParameterNotFound(
            ParameterNotFound::builder().build(),
        ));
        assert!(matches!(
            classify_get_parameter_error("/slack/webhook", err),
            HygieneError::SsmInvalidKey(_)
        ));

        let err = service_error(GetParameterError::InternalServerError(
            InternalServerError::builder().build(),
        ));
        assert!(matches!(
            classify_get_parameter_error("/slack/webhook", err),
            HygieneError::SsmInternalError(_)
        ));

        let err = SdkError::timeout_error("timed out");
        assert!(matches!(
            classify_get_parameter_error("/slack/webhook", err),
            HygieneError::GetParameterError(_)
        ));
    }
}
