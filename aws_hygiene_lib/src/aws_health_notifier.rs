use anyhow::Error;
use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use stdout_channel::StdoutChannel;
use tokio::io::{AsyncReadExt, stdin};

use crate::{
    lambda_handler::run_lambda,
    session::AwsOpts,
    slack::{SlackAttachment, SlackClient, SlackField, SlackMessage, resolve_webhook_url},
    ssm_instance::SsmInstance,
};

pub const PERSONAL_HEALTH_DASHBOARD_URL: &str = "https://phd.aws.amazon.com/phd/home";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EventDescription {
    #[serde(default)]
    pub language: StackString,
    #[serde(rename = "latestDescription", default)]
    pub latest: StackString,
}

/// The `detail` of an `aws.health` event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    #[serde(default)]
    pub event_arn: StackString,
    #[serde(default)]
    pub service: StackString,
    #[serde(default)]
    pub event_type_code: StackString,
    #[serde(default)]
    pub event_type_category: StackString,
    #[serde(default)]
    pub event_description: Vec<EventDescription>,
}

/// CloudWatch / EventBridge envelope delivered to the lambda
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudWatchEvent {
    #[serde(default)]
    pub id: StackString,
    #[serde(rename = "detail-type", default)]
    pub detail_type: StackString,
    #[serde(default)]
    pub source: StackString,
    #[serde(default)]
    pub account: StackString,
    #[serde(default)]
    pub region: StackString,
    #[serde(default)]
    pub resources: Vec<StackString>,
    pub detail: HealthEvent,
}

impl HealthEvent {
    #[must_use]
    pub fn health_event_url(&self) -> StackString {
        format_sstr!(
            "{PERSONAL_HEALTH_DASHBOARD_URL}#/dashboard/open-issues?eventID={}&eventTab=details&layout=horizontal",
            self.event_arn
        )
    }

    /// English description if there is one, else the first
    #[must_use]
    pub fn latest_description(&self) -> &str {
        self.event_description
            .iter()
            .find(|d| d.language.starts_with("en"))
            .or_else(|| self.event_description.first())
            .map_or("", |d| d.latest.as_str())
    }

    #[must_use]
    pub fn slack_message(&self, channel: &str, icon_emoji: &str) -> SlackMessage {
        let field = |title: &str, value: &str, short: bool| SlackField {
            title: title.into(),
            value: value.into(),
            short,
        };
        SlackMessage {
            channel: channel.into(),
            icon_emoji: Some(icon_emoji.into()),
            attachments: vec![SlackAttachment {
                title: "AWS Health Notification".into(),
                title_link: Some(PERSONAL_HEALTH_DASHBOARD_URL.into()),
                color: Some("danger".into()),
                fields: vec![
                    field("Service", self.service.as_str(), false),
                    field("Description", self.latest_description(), false),
                    field("EventTypeCode", self.event_type_code.as_str(), false),
                    field("Link", self.health_event_url().as_str(), false),
                ],
                ..SlackAttachment::default()
            }],
            ..SlackMessage::default()
        }
    }
}

#[derive(Parser, Debug, Clone)]
/// Forward AWS Health events to slack. Reads the event from stdin unless
/// running as a lambda.
pub struct AwsHealthNotifierOpts {
    #[clap(long, env = "SLACK_CHANNEL")]
    /// Slack channel
    slack_channel: StackString,
    #[clap(long, env = "SLACK_EMOJI", default_value = ":boom:")]
    /// Slack emoji for the notifications
    slack_emoji: StackString,
    #[clap(long, env = "SSM_SLACK_WEBHOOK_URL")]
    /// Name of the parameter store entry holding the slack webhook url
    ssm_slack_webhook_url: Option<StackString>,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

#[derive(Debug, Clone)]
struct HealthNotifier {
    opts: AwsHealthNotifierOpts,
    ssm: SsmInstance,
    slack: SlackClient,
}

impl HealthNotifier {
    async fn notify(&self, event: &CloudWatchEvent) -> Result<StackString, Error> {
        let health = &event.detail;
        info!(
            "health event arn={} service={} code={}",
            health.event_arn, health.service, health.event_type_code
        );
        let webhook_url =
            resolve_webhook_url(None, self.opts.ssm_slack_webhook_url.as_deref(), &self.ssm)
                .await?;
        let message = health.slack_message(&self.opts.slack_channel, &self.opts.slack_emoji);
        self.slack.send(&webhook_url, &message).await?;
        info!("successfully sent slack message slack-channel={}", self.opts.slack_channel);
        Ok(health.health_event_url())
    }
}

impl AwsHealthNotifierOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let sdk_config = opts.aws.sdk_config().await;
        let notifier = HealthNotifier {
            ssm: SsmInstance::new(&sdk_config),
            slack: SlackClient::new(),
            opts,
        };

        if notifier.opts.lambda {
            return run_lambda(move |event: CloudWatchEvent| {
                let notifier = notifier.clone();
                async move { notifier.notify(&event).await }
            })
            .await;
        }

        let mut buf = String::new();
        stdin().read_to_string(&mut buf).await?;
        let event: CloudWatchEvent = serde_json::from_str(&buf)?;
        let url = notifier.notify(&event).await?;
        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(url);
        stdout.close().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use serde_json::json;

    use crate::aws_health_notifier::{CloudWatchEvent, EventDescription, HealthEvent};

    const EVENT: &str = r#"{
        "version": "0",
        "id": "121345678-1234-1234-1234-123456789012",
        "detail-type": "AWS Health Event",
        "source": "aws.health",
        "account": "123456789012",
        "time": "2016-06-05T06:27:57Z",
        "region": "us-west-2",
        "resources": ["i-abcd1111"],
        "detail": {
            "eventArn": "arn:aws:health:us-west-2::event/AWS_EC2_INSTANCE_STORE_DRIVE_PERFORMANCE_DEGRADED_90353408594353980",
            "service": "EC2",
            "eventTypeCode": "AWS_EC2_INSTANCE_STORE_DRIVE_PERFORMANCE_DEGRADED",
            "eventTypeCategory": "issue",
            "startTime": "Sun, 05 Jun 2016 05:01:10 GMT",
            "eventDescription": [{
                "language": "en_US",
                "latestDescription": "A description of the event will be provided here"
            }]
        }
    }"#;

    #[test]
    fn test_parse_event() -> Result<(), Error> {
        let event: CloudWatchEvent = serde_json::from_str(EVENT)?;
        assert_eq!(event.source.as_str(), "aws.health");
        assert_eq!(event.detail.service.as_str(), "EC2");
        assert_eq!(event.detail.event_type_category.as_str(), "issue");
        assert_eq!(
            event.detail.latest_description(),
            "A description of the event will be provided here"
        );
        Ok(())
    }

    #[test]
    fn test_health_event_url() {
        let event = HealthEvent {
            event_arn: "arn:aws:health:us-east-1::event/X".into(),
            ..HealthEvent::default()
        };
        assert_eq!(
            event.health_event_url().as_str(),
            "https://phd.aws.amazon.com/phd/home#/dashboard/open-issues?eventID=arn:aws:health:us-east-1::event/X&eventTab=details&layout=horizontal"
        );
    }

    #[test]
    fn test_latest_description() {
        let mut event = HealthEvent::default();
        assert_eq!(event.latest_description(), "");
        event.event_description = vec![
            EventDescription {
                language: "fr_FR".into(),
                latest: "bonjour".into(),
            },
            EventDescription {
                language: "en_US".into(),
                latest: "hello".into(),
            },
        ];
        assert_eq!(event.latest_description(), "hello");
        event.event_description.pop();
        assert_eq!(event.latest_description(), "bonjour");
    }

    #[test]
    fn test_slack_message() -> Result<(), Error> {
        let event: CloudWatchEvent = serde_json::from_str(EVENT)?;
        let message = event.detail.slack_message("#ops", ":boom:");
        let value = serde_json::to_value(&message)?;
        assert_eq!(value["channel"], "#ops");
        assert_eq!(value["icon_emoji"], ":boom:");
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["title"], "AWS Health Notification");
        assert_eq!(attachment["color"], "danger");
        assert_eq!(attachment["title_link"], "https://phd.aws.amazon.com/phd/home");
        let titles: Vec<_> = attachment["fields"]
            .as_array()
            .map(|fields| fields.iter().map(|f| f["title"].clone()).collect())
            .unwrap_or_default();
        assert_eq!(
            titles,
            vec![
                json!("Service"),
                json!("Description"),
                json!("EventTypeCode"),
                json!("Link")
            ]
        );
        assert_eq!(attachment["fields"][3]["short"], false);
        assert_eq!(
            attachment["fields"][3]["value"],
            json!(event.detail.health_event_url().as_str())
        );
        Ok(())
    }
}
