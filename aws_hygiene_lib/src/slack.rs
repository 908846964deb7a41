use anyhow::{Error, format_err};
use log::info;
use reqwest::Client;
use serde::Serialize;
use stack_string::StackString;

use crate::ssm_instance::SsmInstance;

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct SlackField {
    pub title: StackString,
    pub value: StackString,
    pub short: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct SlackAttachment {
    pub title: StackString,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_link: Option<StackString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<StackString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<StackString>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SlackField>,
}

/// Incoming-webhook payload
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct SlackMessage {
    pub channel: StackString,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<StackString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_emoji: Option<StackString>,
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Clone, Debug, Default)]
pub struct SlackClient {
    client: Client,
}

impl SlackClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns error if the webhook request fails or returns a non-success status
    pub async fn send(&self, webhook_url: &str, message: &SlackMessage) -> Result<(), Error> {
        self.client
            .post(webhook_url)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        info!("sent slack message channel={}", message.channel);
        Ok(())
    }
}

/// Use the webhook url given directly, otherwise decrypt it from parameter store
/// # Errors
/// Returns error if neither source yields a url
pub async fn resolve_webhook_url(
    webhook_url: Option<&str>,
    ssm_parameter: Option<&str>,
    ssm: &SsmInstance,
) -> Result<StackString, Error> {
    if let Some(url) = webhook_url.filter(|u| !u.is_empty()) {
        return Ok(url.into());
    }
    if let Some(parameter) = ssm_parameter.filter(|p| !p.is_empty()) {
        let url = ssm.decrypt_value(parameter).await?;
        if !url.is_empty() {
            return Ok(url);
        }
    }
    Err(format_err!(
        "slack webhook url must be set directly or via a parameter store name"
    ))
}
