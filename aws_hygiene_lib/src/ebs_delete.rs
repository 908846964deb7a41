use anyhow::Error;
use clap::{CommandFactory, Parser};
use log::info;
use stack_string::{StackString, format_sstr};
use stdout_channel::StdoutChannel;

use crate::{
    config::Config,
    ec2_instance::{Ec2Instance, TagList, VolumeInfo},
    session::AwsOpts,
};

const CLOUDFORMATION_STACK_TAG: &str = "aws:cloudformation:stack-name";

/// Stack name if the volume was created by CloudFormation
#[must_use]
pub fn is_cloud_formed(volume: &VolumeInfo) -> Option<&str> {
    volume
        .tags
        .iter()
        .find(|(k, _)| k.as_str() == CLOUDFORMATION_STACK_TAG)
        .map(|(_, v)| v.as_str())
}

/// AWS reserves the `aws:` prefix, so those keys are copied as `X-aws:...`
#[must_use]
pub fn copy_tags(tags: &TagList) -> TagList {
    tags.iter()
        .map(|(k, v)| {
            let key = if k.starts_with("aws:") {
                format_sstr!("X-{k}")
            } else {
                k.clone()
            };
            (key, v.clone())
        })
        .collect()
}

#[derive(Parser, Debug, Clone)]
/// Snapshot an EBS volume, then delete it
pub struct EbsDeleteOpts {
    #[clap(long)]
    /// The EBS volume id to delete
    volume_id: Option<StackString>,
    #[clap(long)]
    /// Don't make any changes, log what would have happened
    dry_run: bool,
    #[clap(long)]
    /// Delete the volume even if it's part of a CloudFormation stack
    force: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

impl EbsDeleteOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let Some(volume_id) = opts.volume_id.as_deref().filter(|v| !v.is_empty()) else {
            Self::command().print_help()?;
            return Ok(());
        };
        let config = Config::init_config()?;
        let sdk_config = opts.aws.sdk_config().await;
        let ec2 = Ec2Instance::new(&sdk_config);

        let volume = ec2.get_volume(volume_id).await?;
        if let Some(stack_name) = is_cloud_formed(&volume) {
            if !opts.force {
                info!("Volume is cloudformed. Delete stack: {stack_name}");
                return Ok(());
            }
        }
        if opts.dry_run {
            info!("Creating snapshot for volumeId: {}", volume.id);
            info!("Deleting volume: {}", volume.id);
            return Ok(());
        }

        let snapshot_id = ec2.create_snapshot(&volume.id, &volume.id).await?;
        ec2.create_tags(&snapshot_id, &copy_tags(&volume.tags)).await?;
        let snapshot = ec2
            .wait_for_snapshot_completed(
                &snapshot_id,
                config.waiter_max_attempts,
                config.waiter_poll_interval(),
            )
            .await?;
        ec2.delete_volume(&volume.id).await?;

        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!("{volume:?}"));
        stdout.send(format_sstr!("{snapshot:?}"));
        stdout.close().await.map_err(Into::into)
    }
}
