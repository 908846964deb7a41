use anyhow::{Error, format_err};
use clap::Parser;
use itertools::Itertools;
use log::{debug, info};
use stack_string::{StackString, format_sstr};
use std::{collections::BTreeSet, future::Future, time::Duration};
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    config::Config,
    errors::HygieneError,
    iam_instance::IamInstance,
    iso_8601_datetime::convert_str_to_datetime,
    lambda_handler::run_lambda,
    poll::{PollStatus, poll_with_fixed_delay},
    session::AwsOpts,
    slack::{SlackAttachment, SlackClient, SlackMessage, resolve_webhook_url},
    ssm_instance::SsmInstance,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialReport {
    pub content: Vec<u8>,
    pub generated_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLookup {
    Ready(CredentialReport),
    /// never generated, or expired
    NotPresent,
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Started,
    LimitExceeded,
}

pub trait CredentialReportApi {
    fn get_credential_report(&self) -> impl Future<Output = Result<ReportLookup, Error>> + Send;
    fn generate_credential_report(
        &self,
    ) -> impl Future<Output = Result<GenerateOutcome, Error>> + Send;
}

/// Fetch the credential report, generating it when missing and waiting while
/// it is being produced.
/// # Errors
/// Returns error if an api call fails or the report isn't ready after `tries`
pub async fn get_credential_report<T: CredentialReportApi>(
    api: &T,
    tries: usize,
    poll_interval: Duration,
) -> Result<CredentialReport, Error> {
    let result = poll_with_fixed_delay(
        "credential report",
        tries,
        poll_interval,
        |attempt| async move {
            match api.get_credential_report().await? {
                ReportLookup::Ready(report) => Ok(PollStatus::Done(report)),
                ReportLookup::NotPresent => {
                    let outcome = api.generate_credential_report().await?;
                    info!("generating credential report outcome={outcome:?} attempt={attempt}");
                    Ok(PollStatus::Pending)
                }
                ReportLookup::NotReady => {
                    debug!("credential report not ready attempt={attempt}");
                    Ok(PollStatus::Pending)
                }
            }
        },
    )
    .await;
    result.map_err(|e| match e.downcast_ref::<HygieneError>() {
        Some(HygieneError::PollExhausted { .. }) => {
            format_err!("maximum number of tries to get credential report reached")
        }
        _ => e,
    })
}

/// Credential report timestamps look like `2018-07-11T19:19:08+00:00`
/// # Errors
/// Returns error if the timestamp is malformed
pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime, Error> {
    convert_str_to_datetime(s).map_err(|e| format_err!("invalid timestamp {s}: {e}"))
}

fn key_is_stale(
    row: &csv::StringRecord,
    active_idx: Option<usize>,
    rotated_idx: Option<usize>,
    generated_time: OffsetDateTime,
    max_days: f64,
) -> Result<bool, Error> {
    let active = active_idx.and_then(|i| row.get(i)) == Some("true");
    if !active {
        return Ok(false);
    }
    let rotated = rotated_idx
        .and_then(|i| row.get(i))
        .ok_or_else(|| format_err!("credential report row has no last rotated column"))?;
    let last_rotated = parse_timestamp(rotated)?;
    let days = (generated_time - last_rotated).as_seconds_f64() / 86_400.0;
    Ok(days > max_days)
}

/// Users with an active access key older than `max_days` as of the report's
/// generation time, sorted and de-duplicated
/// # Errors
/// Returns error if the csv or a timestamp in it can't be parsed
pub fn find_stale_users(
    report: &CredentialReport,
    max_days: u32,
) -> Result<Vec<StackString>, Error> {
    let max_days = f64::from(max_days);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(report.content.as_slice());
    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(str::to_lowercase)
        .collect();
    let idx = |name: &str| header.iter().position(|h| h == name);
    let user_idx = idx("user");
    let key_columns = [
        (idx("access_key_1_active"), idx("access_key_1_last_rotated")),
        (idx("access_key_2_active"), idx("access_key_2_last_rotated")),
    ];

    let mut users = BTreeSet::new();
    for row in reader.records() {
        let row = row?;
        let Some(user) = user_idx.and_then(|i| row.get(i)) else {
            continue;
        };
        for (active_idx, rotated_idx) in key_columns {
            if key_is_stale(&row, active_idx, rotated_idx, report.generated_time, max_days)? {
                users.insert(StackString::from(user));
                break;
            }
        }
    }
    Ok(users.into_iter().collect())
}

#[must_use]
pub fn stale_keys_message(channel: &str, users: &[StackString], max_days: u32) -> SlackMessage {
    SlackMessage {
        channel: channel.into(),
        text: Some("AWS notification".into()),
        attachments: vec![SlackAttachment {
            title: "Message".into(),
            text: Some(format_sstr!(
                "The following users have an active access key over {max_days} days old: {}",
                users.iter().join(", ")
            )),
            ..SlackAttachment::default()
        }],
        ..SlackMessage::default()
    }
}

#[derive(Parser, Debug, Clone)]
/// Alert slack about IAM users whose active access keys are too old
pub struct IamKeysCheckOpts {
    #[clap(short, long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(long, env = "MAX_DAYS", default_value = "90")]
    /// Maximum age in days a key can be active without triggering an alert
    days: u32,
    #[clap(long, env = "POLL_INTERVAL", default_value = "5000")]
    /// Milliseconds between credential report availability checks
    poll_interval: u64,
    #[clap(long, env = "SLACK_WEBHOOK_URL")]
    /// Slack webhook url
    slack_webhook_url: Option<StackString>,
    #[clap(long, env = "SSM_SLACK_WEBHOOK_URL")]
    /// Name of the parameter store entry holding the slack webhook url
    ssm_slack_webhook_url: Option<StackString>,
    #[clap(long, env = "SLACK_CHANNEL")]
    /// Slack channel
    slack_channel: StackString,
    #[clap(flatten)]
    aws: AwsOpts,
}

#[derive(Debug, Clone)]
struct KeysCheck {
    opts: IamKeysCheckOpts,
    config: Config,
    iam: IamInstance,
    ssm: SsmInstance,
    slack: SlackClient,
}

impl KeysCheck {
    async fn run(&self) -> Result<Vec<StackString>, Error> {
        if self.opts.days == 0 {
            return Err(format_err!("MaxDays must be greater than 0"));
        }
        let webhook_url = resolve_webhook_url(
            self.opts.slack_webhook_url.as_deref(),
            self.opts.ssm_slack_webhook_url.as_deref(),
            &self.ssm,
        )
        .await?;
        let report = get_credential_report(
            &self.iam,
            self.config.credential_report_tries,
            Duration::from_millis(self.opts.poll_interval),
        )
        .await?;
        let users = find_stale_users(&report, self.opts.days)?;
        info!("stale access keys users={}", users.len());
        if !users.is_empty() {
            let message = stale_keys_message(&self.opts.slack_channel, &users, self.opts.days);
            self.slack.send(&webhook_url, &message).await?;
        }
        Ok(users)
    }
}

impl IamKeysCheckOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let config = Config::init_config()?;
        let sdk_config = opts.aws.sdk_config().await;
        let check = KeysCheck {
            iam: IamInstance::new(&sdk_config),
            ssm: SsmInstance::new(&sdk_config),
            slack: SlackClient::new(),
            config,
            opts,
        };

        if check.opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let check = check.clone();
                async move { check.run().await }
            })
            .await;
        }

        let users = check.run().await?;
        let stdout = StdoutChannel::<StackString>::new();
        for user in users {
            stdout.send(user);
        }
        stdout.close().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Error, format_err};
    use stack_string::StackString;
    use std::{collections::VecDeque, sync::Mutex, time::Duration};
    use time::macros::datetime;

    use crate::iam_keys_check::{
        CredentialReport, CredentialReportApi, GenerateOutcome, ReportLookup,
        find_stale_users, get_credential_report, parse_timestamp, stale_keys_message,
    };

    const CSV: &str = "\
user,arn,access_key_1_active,access_key_1_last_rotated,access_key_2_active,access_key_2_last_rotated
<root_account>,arn:aws:iam::1:root,false,N/A,false,N/A
alice,arn:aws:iam::1:user/alice,true,2018-01-01T00:00:00+00:00,false,N/A
bob,arn:aws:iam::1:user/bob,true,2018-07-01T00:00:00+00:00,false,N/A
carol,arn:aws:iam::1:user/carol,false,N/A,true,2017-12-01T00:00:00+00:00
dave,arn:aws:iam::1:user/dave,true,2017-01-01T00:00:00+00:00,true,2017-01-01T00:00:00+00:00
";

    fn names(users: &[StackString]) -> Vec<&str> {
        users.iter().map(StackString::as_str).collect()
    }

    fn report(content: &str) -> CredentialReport {
        CredentialReport {
            content: content.as_bytes().to_vec(),
            generated_time: datetime!(2018-07-11 19:19:08 UTC),
        }
    }

    struct FakeIam {
        lookups: Mutex<VecDeque<ReportLookup>>,
        generate_calls: Mutex<Vec<GenerateOutcome>>,
        generate_outcomes: Mutex<VecDeque<GenerateOutcome>>,
    }

    impl FakeIam {
        fn new(lookups: Vec<ReportLookup>, outcomes: Vec<GenerateOutcome>) -> Self {
            Self {
                lookups: Mutex::new(lookups.into()),
                generate_calls: Mutex::new(Vec::new()),
                generate_outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    impl CredentialReportApi for FakeIam {
        async fn get_credential_report(&self) -> Result<ReportLookup, Error> {
            self.lookups
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| format_err!("no more lookups"))
        }

        async fn generate_credential_report(&self) -> Result<GenerateOutcome, Error> {
            let outcome = self
                .generate_outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(GenerateOutcome::Started);
            self.generate_calls.lock().expect("lock").push(outcome);
            Ok(outcome)
        }
    }

    #[test]
    fn test_parse_timestamp() -> Result<(), Error> {
        let dt = parse_timestamp("2018-07-11T19:19:08+00:00")?;
        assert_eq!(dt, datetime!(2018-07-11 19:19:08 UTC));
        assert!(parse_timestamp("N/A").is_err());
        Ok(())
    }

    #[test]
    fn test_find_stale_users() -> Result<(), Error> {
        let users = find_stale_users(&report(CSV), 90)?;
        assert_eq!(names(&users), vec!["alice", "carol", "dave"]);

        let users = find_stale_users(&report(CSV), 1000)?;
        assert!(users.is_empty());

        let users = find_stale_users(&report(CSV), 5)?;
        assert_eq!(names(&users), vec!["alice", "bob", "carol", "dave"]);
        Ok(())
    }

    #[test]
    fn test_find_stale_users_uppercase_header() -> Result<(), Error> {
        let csv = "\
USER,ACCESS_KEY_1_ACTIVE,ACCESS_KEY_1_LAST_ROTATED
alice,true,2018-01-01T00:00:00+00:00
";
        assert_eq!(names(&find_stale_users(&report(csv), 90)?), vec!["alice"]);
        Ok(())
    }

    #[test]
    fn test_find_stale_users_bad_timestamp() {
        let csv = "\
user,access_key_1_active,access_key_1_last_rotated
alice,true,yesterday
";
        assert!(find_stale_users(&report(csv), 90).is_err());
    }

    #[test]
    fn test_stale_keys_message() -> Result<(), Error> {
        let message = stale_keys_message("#security", &["alice".into(), "bob".into()], 90);
        let value = serde_json::to_value(&message)?;
        assert_eq!(value["channel"], "#security");
        assert_eq!(value["text"], "AWS notification");
        assert_eq!(value["attachments"][0]["title"], "Message");
        assert_eq!(
            value["attachments"][0]["text"],
            "The following users have an active access key over 90 days old: alice, bob"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_get_credential_report_generates() -> Result<(), Error> {
        let api = FakeIam::new(
            vec![
                ReportLookup::NotPresent,
                ReportLookup::NotPresent,
                ReportLookup::NotReady,
                ReportLookup::Ready(report(CSV)),
            ],
            vec![GenerateOutcome::LimitExceeded, GenerateOutcome::Started],
        );
        let result = get_credential_report(&api, 5, Duration::ZERO).await?;
        assert_eq!(result, report(CSV));
        assert_eq!(
            *api.generate_calls.lock().expect("lock"),
            vec![GenerateOutcome::LimitExceeded, GenerateOutcome::Started]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_get_credential_report_tries_exhausted() -> Result<(), Error> {
        let api = FakeIam::new(vec![ReportLookup::NotReady; 3], Vec::new());
        let err = get_credential_report(&api, 3, Duration::ZERO)
            .await
            .expect_err("should run out of tries");
        assert_eq!(
            err.to_string(),
            "maximum number of tries to get credential report reached"
        );
        Ok(())
    }
}
