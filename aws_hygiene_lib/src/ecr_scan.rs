use anyhow::Error;
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use std::{collections::HashMap, fmt, future::Future, time::Duration};
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    config::Config,
    ecr_instance::EcrInstance,
    errors::HygieneError,
    lambda_handler::run_lambda,
    poll::{PollStatus, poll_with_fixed_delay},
    session::AwsOpts,
};

/// Image to evaluate, also the lambda event payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanTarget {
    pub repository: StackString,
    #[serde(rename = "imageTag")]
    pub image_tag: StackString,
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.image_tag)
    }
}

impl ScanTarget {
    /// # Errors
    /// Returns `InvalidTarget` unless both repository and tag are set
    pub fn validate(&self) -> Result<(), HygieneError> {
        if self.repository.is_empty() || self.image_tag.is_empty() {
            return Err(HygieneError::InvalidTarget);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Pending,
    InProgress,
    Complete,
    Failed(StackString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFindings {
    pub state: ScanState,
    pub completed_at: Option<OffsetDateTime>,
    pub severity_counts: HashMap<StackString, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanLookup {
    NotFound,
    Found(ScanFindings),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    #[serde(rename = "totalFindings")]
    pub total_findings: i64,
}

/// The two ECR calls the evaluator needs
pub trait ImageScanApi {
    fn describe_scan(
        &self,
        target: &ScanTarget,
    ) -> impl Future<Output = Result<ScanLookup, Error>> + Send;
    fn start_scan(&self, target: &ScanTarget) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub max_scan_age_hours: i64,
    pub attempts: usize,
    pub delay: Duration,
}

impl ScanSettings {
    #[must_use]
    pub fn new(config: &Config, max_scan_age_hours: i64) -> Self {
        Self {
            max_scan_age_hours,
            attempts: config.scan_max_attempts,
            delay: config.scan_poll_interval(),
        }
    }
}

/// Poll the scan findings until the scan is complete, starting a scan if the
/// image has never been scanned.
/// # Errors
/// Returns error if the scan fails, a describe/start call fails, or the scan
/// doesn't complete within the allowed attempts
pub async fn get_image_findings<T: ImageScanApi>(
    api: &T,
    target: &ScanTarget,
    settings: &ScanSettings,
) -> Result<ScanFindings, Error> {
    let what = format_sstr!("image scan of {target}");
    poll_with_fixed_delay(&what, settings.attempts, settings.delay, |attempt| async move {
        match api.describe_scan(target).await? {
            ScanLookup::NotFound => {
                info!("no scan found for {target}, starting one attempt={attempt}");
                api.start_scan(target).await?;
                Ok(PollStatus::Pending)
            }
            ScanLookup::Found(findings) => {
                if let ScanState::Failed(reason) = &findings.state {
                    return Err(
                        HygieneError::ScanFailed(format_sstr!("{target}: {reason}")).into(),
                    );
                }
                if findings.state == ScanState::Complete {
                    Ok(PollStatus::Done(findings))
                } else {
                    info!("scan of {target} still in progress attempt={attempt}");
                    Ok(PollStatus::Pending)
                }
            }
        }
    })
    .await
    .map_err(|e| match e.downcast_ref::<HygieneError>() {
        Some(HygieneError::PollExhausted { .. }) => {
            HygieneError::ScanFindingsUnavailable(format_sstr!("{target}")).into()
        }
        _ => e,
    })
}

/// Scans completed more than `max_age_hours` ago (or with no completion time)
/// are stale
#[must_use]
pub fn is_old_scan(findings: &ScanFindings, now: OffsetDateTime, max_age_hours: i64) -> bool {
    findings.completed_at.is_none_or(|completed_at| {
        (now - completed_at).whole_seconds() > max_age_hours * 3600
    })
}

#[must_use]
pub fn calculate_total_findings(findings: &ScanFindings) -> i64 {
    findings
        .severity_counts
        .values()
        .map(|count| i64::from(*count))
        .sum()
}

/// Total findings of the most recent scan, rescanning if the last scan is
/// older than the allowed age
/// # Errors
/// Returns error if the target is invalid or the scan cannot be retrieved
pub async fn evaluate<T: ImageScanApi>(
    api: &T,
    target: &ScanTarget,
    settings: &ScanSettings,
    now: OffsetDateTime,
) -> Result<ScanReport, Error> {
    target.validate()?;
    let mut findings = get_image_findings(api, target, settings).await?;
    if is_old_scan(&findings, now, settings.max_scan_age_hours) {
        warn!(
            "scan of {target} is older than {} hours, rescanning",
            settings.max_scan_age_hours
        );
        api.start_scan(target).await?;
        findings = get_image_findings(api, target, settings).await?;
    }
    let total_findings = calculate_total_findings(&findings);
    info!("scan result target={target} totalFindings={total_findings}");
    Ok(ScanReport { total_findings })
}

#[derive(Parser, Debug, Clone)]
/// Report the total vulnerability findings for an ECR image
pub struct EcrScanOpts {
    #[clap(short, long, env = "ECR_REPOSITORY")]
    /// ECR repository where the image is located
    repository: Option<StackString>,
    #[clap(short = 't', long = "tag", env = "IMAGE_TAG")]
    /// Image tag to retrieve findings for
    image_tag: Option<StackString>,
    #[clap(short, long, env = "MAX_SCAN_AGE", default_value = "24")]
    /// Maximum allowed age for image scan (hours)
    max_scan_age: i64,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

impl EcrScanOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let config = Config::init_config()?;
        let sdk_config = opts.aws.sdk_config().await;
        let ecr = EcrInstance::new(&sdk_config);
        let settings = ScanSettings::new(&config, opts.max_scan_age);

        if opts.lambda {
            return run_lambda(move |target: ScanTarget| {
                let ecr = ecr.clone();
                async move {
                    let report =
                        evaluate(&ecr, &target, &settings, OffsetDateTime::now_utc()).await?;
                    Ok(format_sstr!("{}", report.total_findings))
                }
            })
            .await;
        }

        let target = ScanTarget {
            repository: opts.repository.unwrap_or_default(),
            image_tag: opts.image_tag.unwrap_or_default(),
        };
        let report = evaluate(&ecr, &target, &settings, OffsetDateTime::now_utc()).await?;
        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!("{}", report.total_findings));
        stdout.close().await.map_err(Into::into)
    }
}
