use anyhow::{Error, format_err};
use clap::Parser;
use log::{error, info};
use stack_string::{StackString, format_sstr};
use std::future::Future;
use stdout_channel::StdoutChannel;

use crate::{
    lambda_handler::run_lambda,
    session::get_sdk_config,
    support_instance::SupportInstance,
};

/// Trusted Advisor is only served from us-east-1
pub const TRUSTED_ADVISOR_REGION: &str = "us-east-1";

const UNREFRESHABLE_CHECKS: [&str; 7] = [
    "AWS Direct Connect Connection Redundancy",
    "AWS Direct Connect Location Redundancy",
    "AWS Direct Connect Virtual Interface Redundancy",
    "PV Driver Version for EC2 Windows Instances",
    "EC2Config Service for EC2 Windows Instances",
    "Amazon EBS Public Snapshots",
    "Amazon RDS Public Snapshots",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInfo {
    pub id: StackString,
    pub name: StackString,
}

pub trait TrustedAdvisorApi {
    fn describe_checks(&self) -> impl Future<Output = Result<Vec<CheckInfo>, Error>> + Send;
    fn refresh_check(&self, check_id: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

#[must_use]
pub fn is_check_refreshable(name: &str) -> bool {
    !UNREFRESHABLE_CHECKS.contains(&name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Refresh every refreshable check. A failed refresh doesn't stop the rest.
/// # Errors
/// Returns error if the checks can't be listed or any refresh failed
pub async fn refresh<T: TrustedAdvisorApi>(api: &T) -> Result<RefreshSummary, Error> {
    let mut summary = RefreshSummary::default();
    for check in api.describe_checks().await? {
        if !is_check_refreshable(&check.name) {
            info!("skipping unrefreshable check name={} id={}", check.name, check.id);
            summary.skipped += 1;
            continue;
        }
        info!("refreshing name={} id={}", check.name, check.id);
        match api.refresh_check(&check.id).await {
            Ok(()) => summary.refreshed += 1,
            Err(e) => {
                error!("unable to refresh name={} id={} error={e}", check.name, check.id);
                summary.failed += 1;
            }
        }
    }
    if summary.failed > 0 {
        return Err(format_err!(
            "failed to refresh {} of {} trusted advisor checks",
            summary.failed,
            summary.failed + summary.refreshed
        ));
    }
    Ok(summary)
}

#[derive(Parser, Debug, Clone)]
/// Refresh every refreshable Trusted Advisor check
pub struct TrustedAdvisorRefreshOpts {
    #[clap(short, long, env = "AWS_PROFILE")]
    /// AWS credentials profile to use
    profile: Option<StackString>,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
}

impl TrustedAdvisorRefreshOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let sdk_config =
            get_sdk_config(Some(TRUSTED_ADVISOR_REGION), opts.profile.as_deref()).await;
        let support = SupportInstance::new(&sdk_config);

        if opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let support = support.clone();
                async move {
                    let summary = refresh(&support).await?;
                    Ok(format_sstr!("refreshed {}", summary.refreshed))
                }
            })
            .await;
        }

        let summary = refresh(&support).await?;
        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!(
            "refreshed={} skipped={}",
            summary.refreshed,
            summary.skipped
        ));
        stdout.close().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Error, format_err};
    use std::sync::Mutex;

    use crate::trusted_advisor_refresh::{
        CheckInfo, RefreshSummary, TrustedAdvisorApi, is_check_refreshable, refresh,
    };

    struct FakeSupport {
        checks: Vec<CheckInfo>,
        failing: &'static str,
        refreshed: Mutex<Vec<String>>,
    }

    impl TrustedAdvisorApi for FakeSupport {
        async fn describe_checks(&self) -> Result<Vec<CheckInfo>, Error> {
            Ok(self.checks.clone())
        }

        async fn refresh_check(&self, check_id: &str) -> Result<(), Error> {
            self.refreshed.lock().expect("lock").push(check_id.into());
            if check_id == self.failing {
                Err(format_err!("throttled"))
            } else {
                Ok(())
            }
        }
    }

    fn check(id: &str, name: &str) -> CheckInfo {
        CheckInfo {
            id: id.into(),
            name: name.into(),
        }
    }

    fn checks() -> Vec<CheckInfo> {
        vec![
            check("a", "Security Groups - Specific Ports Unrestricted"),
            check("b", "AWS Direct Connect Connection Redundancy"),
            check("c", "Amazon EBS Public Snapshots"),
            check("d", "Low Utilization Amazon EC2 Instances"),
        ]
    }

    #[test]
    fn test_is_check_refreshable() {
        assert!(is_check_refreshable("I'm Refreshable"));
        assert!(!is_check_refreshable("AWS Direct Connect Connection Redundancy"));
        assert!(!is_check_refreshable("Amazon RDS Public Snapshots"));
    }

    #[tokio::test]
    async fn test_refresh() -> Result<(), Error> {
        let api = FakeSupport {
            checks: checks(),
            failing: "",
            refreshed: Mutex::new(Vec::new()),
        };
        let summary = refresh(&api).await?;
        assert_eq!(
            summary,
            RefreshSummary {
                refreshed: 2,
                skipped: 2,
                failed: 0
            }
        );
        assert_eq!(*api.refreshed.lock().expect("lock"), vec!["a", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_continues_after_failure() -> Result<(), Error> {
        let api = FakeSupport {
            checks: checks(),
            failing: "a",
            refreshed: Mutex::new(Vec::new()),
        };
        assert!(refresh(&api).await.is_err());
        assert_eq!(*api.refreshed.lock().expect("lock"), vec!["a", "d"]);
        Ok(())
    }
}
