use anyhow::{Error, format_err};
use aws_config::SdkConfig;
use clap::Parser;
use log::{debug, error, info};
use stack_string::{StackString, format_sstr};
use std::future::Future;
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    ec2_instance::{AmiInfo, Ec2Instance, TagList},
    iso_8601_datetime::expiration_date,
    lambda_handler::run_lambda,
    session::get_sdk_config,
    sts_instance::StsInstance,
};

/// First image tag whose key is `key` (any tag when `key` is empty) decides
/// the match: it matches when `value` is empty or equal to the tag's value.
#[must_use]
pub fn match_tags(tags: &TagList, key: &str, value: &str) -> (bool, (StackString, StackString)) {
    for (tag_key, tag_value) in tags {
        if key.is_empty() || key == tag_key.as_str() {
            let matched = value.is_empty() || value == tag_value.as_str();
            return (matched, (tag_key.clone(), tag_value.clone()));
        }
    }
    (false, (key.into(), "not found".into()))
}

pub trait ImageUsage {
    /// Whether no instance was launched from the image
    fn image_unused(&self, image: &AmiInfo) -> impl Future<Output = Result<bool, Error>> + Send;
}

/// Looks for instances built from an image, in the owner account or, when
/// given a role, in every account the image is shared with
#[derive(Debug, Clone)]
pub struct UsageChecker {
    ec2: Ec2Instance,
    sts: StsInstance,
    role: Option<StackString>,
    session_name: StackString,
}

impl UsageChecker {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig, role: Option<StackString>, name_prefix: &str) -> Self {
        Self {
            ec2: Ec2Instance::new(sdk_config),
            sts: StsInstance::new(sdk_config),
            role,
            session_name: format_sstr!("ami-cleaner-{name_prefix}"),
        }
    }
}

impl ImageUsage for UsageChecker {
    async fn image_unused(&self, image: &AmiInfo) -> Result<bool, Error> {
        let Some(role) = self.role.as_deref().filter(|r| !r.is_empty()) else {
            return Ok(!self.ec2.image_has_instances(&image.id).await?);
        };
        let owner_id = image
            .owner_id
            .clone()
            .ok_or_else(|| format_err!("image {} has no owner", image.id))?;
        let mut accounts = vec![owner_id];
        accounts.extend(self.ec2.get_launch_permission_accounts(&image.id).await?);

        for account_id in &accounts {
            let config = self
                .sts
                .assume_role_config(account_id, role, &self.session_name)
                .await?;
            if Ec2Instance::new(&config).image_has_instances(&image.id).await? {
                info!(
                    "found image running instance in aws account account-id={account_id} \
                     ami-id={} ami-name={}",
                    image.id, image.name
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageCriteria {
    pub name_prefix: StackString,
    pub expiration: Option<OffsetDateTime>,
    pub tag_key: StackString,
    pub tag_value: StackString,
    pub invert: bool,
    pub unused: bool,
}

impl ImageCriteria {
    /// Whether the image should be purged
    pub async fn check_image<T: ImageUsage>(&self, usage: &T, image: &AmiInfo) -> bool {
        if !image.name.starts_with(self.name_prefix.as_str()) {
            return false;
        }
        let Some(creation_date) = image.creation_date else {
            debug!("ami {} has no creation date, skipping", image.id);
            return false;
        };
        if self.expiration.is_some_and(|exp| creation_date > exp) {
            return false;
        }
        let (matched, (tag_key, tag_value)) =
            match_tags(&image.tags, &self.tag_key, &self.tag_value);
        if self.invert == matched {
            return false;
        }
        if self.unused {
            match usage.image_unused(image).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    error!(
                        "could not check for image in use ami-id={} ami-name={} error={e}",
                        image.id, image.name
                    );
                    return false;
                }
            }
        }
        debug!(
            "ami matched selection criteria ami-id={} ami-name={} ami-tag-key={tag_key} \
             ami-tag-value={tag_value} ami-creation-date={creation_date}",
            image.id, image.name
        );
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    WouldPurge,
    NotEbs,
}

/// Deregister an EBS backed image and delete its snapshots. Without `delete`
/// only logs what would happen.
/// # Errors
/// Returns error if deregistering or a snapshot deletion fails
pub async fn purge_image(
    ec2: &Ec2Instance,
    image: &AmiInfo,
    delete: bool,
) -> Result<PurgeOutcome, Error> {
    if !image.ebs_backed {
        info!(
            "image root device not EBS; will not purge ami-id={} ami-name={}",
            image.id, image.name
        );
        return Ok(PurgeOutcome::NotEbs);
    }
    if delete {
        info!("deregistering ami ami-id={} ami-name={}", image.id, image.name);
        ec2.deregister_image(&image.id)
            .await
            .map_err(|e| format_err!("Failed to deregister image {}: {e}", image.id))?;
    } else {
        info!("would deregister ami ami-id={} ami-name={}", image.id, image.name);
    }
    for snapshot_id in &image.snapshot_ids {
        if delete {
            info!("deleting snapshot snapshot-id={snapshot_id}");
            ec2.delete_snapshot(snapshot_id)
                .await
                .map_err(|e| format_err!("Failed to delete snapshot {snapshot_id}: {e}"))?;
        } else {
            info!("would delete snapshot snapshot-id={snapshot_id}");
        }
    }
    Ok(if delete {
        PurgeOutcome::Purged
    } else {
        PurgeOutcome::WouldPurge
    })
}

#[derive(Parser, Debug, Clone)]
/// Deregister expired AMIs and delete their snapshots
pub struct AmiCleanerOpts {
    #[clap(short = 'D', long, env = "DELETE")]
    /// Actually purge AMIs (dry run by default)
    delete: bool,
    #[clap(long = "prefix", env = "NAME_PREFIX", default_value = "")]
    /// Name prefix to filter on (not affected by --invert)
    name_prefix: StackString,
    #[clap(long, env = "RETENTION_DAYS", default_value = "30")]
    /// Age of AMI in days before it is a candidate for removal
    days: u32,
    #[clap(long, env = "TAG_KEY", default_value = "")]
    /// Key of tag to operate on, requires --tag-value
    tag_key: StackString,
    #[clap(long, env = "TAG_VALUE", default_value = "")]
    /// Value of tag to operate on, requires --tag-key
    tag_value: StackString,
    #[clap(short, long, env = "INVERT")]
    /// Only purge AMIs that do NOT match the tag
    invert: bool,
    #[clap(long, env = "UNUSED")]
    /// Only purge AMIs no running instance was built from
    unused: bool,
    #[clap(long = "sts-role", env = "STS_ROLE")]
    /// IAM role name used for the cross-account unused check
    role: Option<StackString>,
    #[clap(short, long, env = "AWS_PROFILE")]
    /// AWS credentials profile to use
    profile: Option<StackString>,
    #[clap(short, long, env = "AWS_REGION")]
    /// AWS region to use
    region: Option<StackString>,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
}

#[derive(Debug, Clone)]
struct AmiCleaner {
    ec2: Ec2Instance,
    usage: UsageChecker,
    criteria: ImageCriteria,
    days: u32,
    delete: bool,
}

impl AmiCleaner {
    async fn clean_images(&self) -> Result<Vec<StackString>, Error> {
        let criteria = ImageCriteria {
            expiration: Some(expiration_date(OffsetDateTime::now_utc(), self.days)),
            ..self.criteria.clone()
        };
        let mut output = Vec::new();
        for image in self.ec2.get_own_images().await? {
            if !criteria.check_image(&self.usage, &image).await {
                continue;
            }
            let line = match purge_image(&self.ec2, &image, self.delete).await? {
                PurgeOutcome::Purged => format_sstr!("Purged image {} {}", image.id, image.name),
                PurgeOutcome::WouldPurge => {
                    format_sstr!("Would have purged image {} {}", image.id, image.name)
                }
                PurgeOutcome::NotEbs => continue,
            };
            info!("{line}");
            output.push(line);
        }
        Ok(output)
    }
}

impl AmiCleanerOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        if opts.tag_key.is_empty() != opts.tag_value.is_empty() {
            return Err(format_err!("must specify both a tag key and tag value"));
        }
        let sdk_config = get_sdk_config(opts.region.as_deref(), opts.profile.as_deref()).await;
        let cleaner = AmiCleaner {
            ec2: Ec2Instance::new(&sdk_config),
            usage: UsageChecker::new(&sdk_config, opts.role.clone(), &opts.name_prefix),
            criteria: ImageCriteria {
                name_prefix: opts.name_prefix,
                expiration: None,
                tag_key: opts.tag_key,
                tag_value: opts.tag_value,
                invert: opts.invert,
                unused: opts.unused,
            },
            days: opts.days,
            delete: opts.delete,
        };

        if opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let cleaner = cleaner.clone();
                async move { cleaner.clean_images().await }
            })
            .await;
        }

        let stdout = StdoutChannel::<StackString>::new();
        for line in cleaner.clean_images().await? {
            stdout.send(line);
        }
        stdout.close().await.map_err(Into::into)
    }
}
