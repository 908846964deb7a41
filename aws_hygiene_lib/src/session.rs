use anyhow::{Error, format_err};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::{Credentials, provider::SharedCredentialsProvider};
use aws_sdk_sts::types::Credentials as StsCredentials;
use clap::Args;
use log::debug;
use stack_string::StackString;

/// Region and profile flags shared by every tool
#[derive(Args, Debug, Clone, Default)]
pub struct AwsOpts {
    #[clap(short, long, env = "AWS_PROFILE")]
    /// AWS credentials profile to use
    pub profile: Option<StackString>,
    #[clap(long, env = "AWS_REGION")]
    /// AWS region to use
    pub region: Option<StackString>,
}

impl AwsOpts {
    /// Fill unset fields from the bare `REGION` / `PROFILE` variables some
    /// deployments still export
    #[must_use]
    pub fn with_fallback_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .map(StackString::from)
        };
        if self.region.is_none() {
            self.region = get("REGION");
        }
        if self.profile.is_none() {
            self.profile = get("PROFILE");
        }
        self
    }

    pub async fn sdk_config(&self) -> SdkConfig {
        let opts = self
            .clone()
            .with_fallback_env(|name| std::env::var(name).ok());
        get_sdk_config(opts.region.as_deref(), opts.profile.as_deref()).await
    }
}

/// Load shared credentials/config, honoring an explicit region and profile
pub async fn get_sdk_config(region: Option<&str>, profile: Option<&str>) -> SdkConfig {
    debug!("loading sdk config region={region:?} profile={profile:?}");
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// Same config with the region replaced
#[must_use]
pub fn sdk_config_for_region(sdk_config: &SdkConfig, region: &str) -> SdkConfig {
    sdk_config
        .to_builder()
        .region(Region::new(region.to_string()))
        .build()
}

/// Same config, but signing with temporary credentials from `AssumeRole`
/// # Errors
/// Returns error if the sts response has no credentials
pub fn sdk_config_with_credentials(
    sdk_config: &SdkConfig,
    credentials: Option<&StsCredentials>,
    provider_name: &'static str,
) -> Result<SdkConfig, Error> {
    let credentials =
        credentials.ok_or_else(|| format_err!("AssumeRole returned no credentials"))?;
    let credentials = Credentials::new(
        credentials.access_key_id(),
        credentials.secret_access_key(),
        Some(credentials.session_token().to_string()),
        None,
        provider_name,
    );
    Ok(sdk_config
        .to_builder()
        .credentials_provider(SharedCredentialsProvider::new(credentials))
        .build())
}

/// Offline config for unit tests: static region, no credential lookup
#[cfg(test)]
pub(crate) fn test_sdk_config() -> SdkConfig {
    SdkConfig::builder()
        .region(Region::new("us-east-1"))
        .behavior_version(BehaviorVersion::latest())
        .build()
}
