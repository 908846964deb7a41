use anyhow::Error;
use aws_config::SdkConfig;
use aws_sdk_ecr::{
    Client as EcrClient,
    operation::describe_image_scan_findings::DescribeImageScanFindingsOutput,
    types::{ImageIdentifier, ScanStatus},
};
use log::debug;
use stack_string::StackString;
use std::fmt;

use crate::{
    ecr_scan::{ImageScanApi, ScanFindings, ScanLookup, ScanState, ScanTarget},
    iso_8601_datetime::from_aws_datetime,
};

#[derive(Clone)]
pub struct EcrInstance {
    ecr_client: EcrClient,
}

impl fmt::Debug for EcrInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("EcrInstance")
    }
}

impl EcrInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            ecr_client: EcrClient::from_conf(sdk_config.into()),
        }
    }
}

fn image_identifier(target: &ScanTarget) -> ImageIdentifier {
    ImageIdentifier::builder()
        .image_tag(target.image_tag.as_str())
        .build()
}

fn scan_state(status: Option<&ScanStatus>, description: Option<&str>) -> ScanState {
    match status {
        Some(ScanStatus::Complete) => ScanState::Complete,
        Some(ScanStatus::InProgress) => ScanState::InProgress,
        Some(ScanStatus::Pending) | None => ScanState::Pending,
        Some(other) => ScanState::Failed(
            description
                .map_or_else(|| other.as_str().into(), Into::into),
        ),
    }
}

fn scan_findings(output: &DescribeImageScanFindingsOutput) -> ScanFindings {
    let status = output.image_scan_status();
    let findings = output.image_scan_findings();
    ScanFindings {
        state: scan_state(
            status.and_then(|s| s.status()),
            status.and_then(|s| s.description()),
        ),
        completed_at: findings
            .and_then(|f| f.image_scan_completed_at())
            .and_then(|t| from_aws_datetime(t).ok()),
        severity_counts: findings
            .and_then(|f| f.finding_severity_counts())
            .map(|counts| {
                counts
                    .iter()
                    .map(|(severity, count)| (StackString::from(severity.as_str()), *count))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

impl ImageScanApi for EcrInstance {
    async fn describe_scan(&self, target: &ScanTarget) -> Result<ScanLookup, Error> {
        let result = self
            .ecr_client
            .describe_image_scan_findings()
            .repository_name(target.repository.as_str())
            .image_id(image_identifier(target))
            .send()
            .await;
        match result {
            Ok(output) => Ok(ScanLookup::Found(scan_findings(&output))),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_scan_not_found_exception()) =>
            {
                debug!("no scan found for {target}");
                Ok(ScanLookup::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start_scan(&self, target: &ScanTarget) -> Result<(), Error> {
        self.ecr_client
            .start_image_scan()
            .repository_name(target.repository.as_str())
            .image_id(image_identifier(target))
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_ecr::{
        operation::describe_image_scan_findings::DescribeImageScanFindingsOutput,
        types::{FindingSeverity, ImageScanFindings, ImageScanStatus, ScanStatus},
    };
    use aws_smithy_types::DateTime;

    use crate::{
        ecr_instance::{scan_findings, scan_state},
        ecr_scan::ScanState,
    };

    #[test]
    fn test_scan_state() {
        assert_eq!(scan_state(Some(&ScanStatus::Complete), None), ScanState::Complete);
        assert_eq!(scan_state(Some(&ScanStatus::InProgress), None), ScanState::InProgress);
        assert_eq!(scan_state(None, None), ScanState::Pending);
        assert_eq!(
            scan_state(Some(&ScanStatus::Failed), Some("unsupported image")),
            ScanState::Failed("unsupported image".into())
        );
    }

    #[test]
    fn test_scan_findings() {
        let output = DescribeImageScanFindingsOutput::builder()
            .image_scan_status(
                ImageScanStatus::builder()
                    .status(ScanStatus::Complete)
                    .build(),
            )
            .image_scan_findings(
                ImageScanFindings::builder()
                    .image_scan_completed_at(DateTime::from_secs(1_600_000_000))
                    .finding_severity_counts(FindingSeverity::High, 2)
                    .finding_severity_counts(FindingSeverity::Low, 4)
                    .build(),
            )
            .build();
        let findings = scan_findings(&output);
        assert_eq!(findings.state, ScanState::Complete);
        assert_eq!(
            findings.completed_at.map(|t| t.unix_timestamp()),
            Some(1_600_000_000)
        );
        assert_eq!(findings.severity_counts.get("HIGH"), Some(&2));
        assert_eq!(findings.severity_counts.get("LOW"), Some(&4));
    }
}
