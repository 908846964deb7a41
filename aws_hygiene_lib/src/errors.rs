use aws_sdk_ssm::operation::get_parameter::GetParameterError;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::{
    metadata::ProvideErrorMetadata, operation::BuildError as AwsBuildError,
};
use stack_string::StackString;
use thiserror::Error;

pub type AwsSdkError<T> = SdkError<T, aws_smithy_runtime_api::http::Response>;

/// Code returned by EC2 when a request made with `DryRun` would have succeeded.
pub const DRY_RUN_OPERATION: &str = "DryRunOperation";

#[derive(Error, Debug)]
pub enum HygieneError {
    #[error("{0}")]
    CustomError(StackString),
    #[error("{0}")]
    StaticCustomError(&'static str),
    #[error("Invalid target: repository and image tag are both required")]
    InvalidTarget,
    #[error("image scan failed: {0}")]
    ScanFailed(StackString),
    #[error("Unable to retrieve scan findings for {0}")]
    ScanFindingsUnavailable(StackString),
    #[error("gave up waiting for {what} after {attempts} attempts")]
    PollExhausted { what: StackString, attempts: usize },
    #[error("an internal error occurred fetching parameter {0}")]
    SsmInternalError(StackString),
    #[error("the provided parameter store key appears to be invalid: {0}")]
    SsmInvalidKey(StackString),
    #[error("parameter {0} has no value")]
    SsmMissingValue(StackString),
    #[error("GetParameterError {0}")]
    GetParameterError(Box<AwsSdkError<GetParameterError>>),
    #[error("AwsBuildError {0}")]
    AwsBuildError(Box<AwsBuildError>),
}

impl From<AwsSdkError<GetParameterError>> for HygieneError {
    fn from(value: AwsSdkError<GetParameterError>) -> Self {
        Self::GetParameterError(Box::new(value))
    }
}

impl From<AwsBuildError> for HygieneError {
    fn from(value: AwsBuildError) -> Self {
        Self::AwsBuildError(Box::new(value))
    }
}

/// Service error code attached to an aws error, e.g. `InvalidSnapshot.InUse`
pub fn service_error_code<E: ProvideErrorMetadata>(err: &E) -> Option<&str> {
    err.code()
}

pub fn is_dry_run_operation<E: ProvideErrorMetadata>(err: &E) -> bool {
    service_error_code(err) == Some(DRY_RUN_OPERATION)
}

#[cfg(test)]
mod tests {
    use aws_sdk_ec2::operation::{
        delete_snapshot::DeleteSnapshotError, terminate_instances::TerminateInstancesError,
    };
    use aws_sdk_ssm::operation::get_parameter::GetParameterError;
    use aws_smithy_types::error::{ErrorMetadata, operation::BuildError as AwsBuildError};

    use crate::errors::{
        AwsSdkError, HygieneError, is_dry_run_operation, service_error_code,
    };

    #[test]
    fn test_error_size() {
        println!("AwsBuildError {}", std::mem::size_of::<AwsBuildError>());
        println!(
            "GetParameterError {}",
            std::mem::size_of::<AwsSdkError<GetParameterError>>()
        );
        println!("HygieneError {}", std::mem::size_of::<HygieneError>());
        assert!(std::mem::size_of::<HygieneError>() <= 48);
    }

    #[test]
    fn test_dry_run_operation() {
        let err = TerminateInstancesError::generic(
            ErrorMetadata::builder()
                .code("DryRunOperation")
                .message("Request would have succeeded, but DryRun flag is set.")
                .build(),
        );
        assert!(is_dry_run_operation(&err));

        let err = DeleteSnapshotError::generic(
            ErrorMetadata::builder()
                .code("InvalidSnapshot.InUse")
                .build(),
        );
        assert!(!is_dry_run_operation(&err));
        assert_eq!(service_error_code(&err), Some("InvalidSnapshot.InUse"));
    }
}
