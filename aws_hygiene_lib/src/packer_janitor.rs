use anyhow::{Error, format_err};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use clap::Parser;
use log::{info, warn};
use stack_string::{StackString, format_sstr};
use std::{future::Future, time::Duration};
use stdout_channel::StdoutChannel;
use time::OffsetDateTime;

use crate::{
    config::Config,
    ec2_instance::{Ec2Instance, InstanceInfo},
    errors::is_dry_run_operation,
    lambda_handler::run_lambda,
    session::get_sdk_config,
};

/// Name tag packer puts on its builder instances
pub const PACKER_INSTANCE_NAME: &str = "Packer Builder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunOutcome {
    Done,
    WouldHave,
}

/// Map an EC2 call made with the `DryRun` flag: `DryRunOperation` means the
/// call would have succeeded
/// # Errors
/// Returns any other error unchanged
pub fn dry_run_outcome<E>(result: Result<(), E>) -> Result<DryRunOutcome, Error>
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match result {
        Ok(()) => Ok(DryRunOutcome::Done),
        Err(e) if is_dry_run_operation(&e) => Ok(DryRunOutcome::WouldHave),
        Err(e) => Err(e.into()),
    }
}

pub trait PackerResources {
    fn find_instances(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<InstanceInfo>, Error>> + Send;
    fn terminate(
        &self,
        instance_id: &str,
        dry_run: bool,
    ) -> impl Future<Output = Result<DryRunOutcome, Error>> + Send;
    fn wait_terminated(
        &self,
        instance_id: &str,
        attempts: usize,
        delay: Duration,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn remove_key_pair(
        &self,
        key_name: &str,
        dry_run: bool,
    ) -> impl Future<Output = Result<DryRunOutcome, Error>> + Send;
    fn remove_security_group(
        &self,
        group_id: &str,
        dry_run: bool,
    ) -> impl Future<Output = Result<DryRunOutcome, Error>> + Send;
}

impl PackerResources for Ec2Instance {
    async fn find_instances(&self, name: &str) -> Result<Vec<InstanceInfo>, Error> {
        self.get_instances_by_name(name).await
    }

    async fn terminate(&self, instance_id: &str, dry_run: bool) -> Result<DryRunOutcome, Error> {
        dry_run_outcome(self.terminate_instance(instance_id, dry_run).await)
    }

    async fn wait_terminated(
        &self,
        instance_id: &str,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), Error> {
        self.wait_for_instance_terminated(instance_id, attempts, delay)
            .await
    }

    async fn remove_key_pair(&self, key_name: &str, dry_run: bool) -> Result<DryRunOutcome, Error> {
        dry_run_outcome(self.delete_key_pair(key_name, dry_run).await)
    }

    async fn remove_security_group(
        &self,
        group_id: &str,
        dry_run: bool,
    ) -> Result<DryRunOutcome, Error> {
        dry_run_outcome(self.delete_security_group(group_id, dry_run).await)
    }
}

#[derive(Debug, Clone)]
pub struct PackerJanitor<T> {
    pub ec2: T,
    pub delete: bool,
    pub expiration: OffsetDateTime,
    pub waiter_attempts: usize,
    pub waiter_delay: Duration,
}

impl<T: PackerResources> PackerJanitor<T> {
    /// Packer builders launched before the expiration
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_packer_instances(&self) -> Result<Vec<InstanceInfo>, Error> {
        let instances = self.ec2.find_instances(PACKER_INSTANCE_NAME).await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.launch_time < self.expiration)
            .collect())
    }

    /// Terminate the instance, waiting for it to go away when deleting
    /// # Errors
    /// Returns error if aws api fails
    pub async fn clean_terminate_instance(&self, instance: &InstanceInfo) -> Result<(), Error> {
        if self.ec2.terminate(&instance.id, !self.delete).await? == DryRunOutcome::WouldHave {
            info!("would have terminated instance instance-id={}", instance.id);
        }
        if !self.delete {
            return Ok(());
        }
        self.ec2
            .wait_terminated(&instance.id, self.waiter_attempts, self.waiter_delay)
            .await
    }

    /// Terminate the instance, then delete its key pair and its (single)
    /// security group. Security groups can't be deleted while in use.
    /// # Errors
    /// Returns error if any step fails
    pub async fn purge_packer_resource(&self, instance: &InstanceInfo) -> Result<(), Error> {
        let dry_run = !self.delete;
        self.clean_terminate_instance(instance).await?;

        match instance.key_name.as_deref() {
            Some(key_name) => {
                if self.ec2.remove_key_pair(key_name, dry_run).await? == DryRunOutcome::WouldHave
                {
                    info!("would have deleted keypair keypair={key_name}");
                }
            }
            None => warn!("instance has no keypair instance-id={}", instance.id),
        }

        match instance.security_group_ids.first() {
            Some(group_id) => {
                if self.ec2.remove_security_group(group_id, dry_run).await?
                    == DryRunOutcome::WouldHave
                {
                    info!("would have deleted security group security-group={group_id}");
                }
            }
            None => warn!("instance has no security group instance-id={}", instance.id),
        }
        Ok(())
    }

    /// # Errors
    /// Returns error on the first instance that fails to purge
    pub async fn clean_packer_resources(&self) -> Result<Vec<StackString>, Error> {
        let instances = self.get_packer_instances().await?;
        if instances.is_empty() {
            info!("No abandoned Packer instances found.");
        }
        let mut output = Vec::new();
        for instance in &instances {
            self.purge_packer_resource(instance)
                .await
                .map_err(|e| format_err!("Failed to purge Packer instance {}: {e}", instance.id))?;
            let verb = if self.delete {
                "Purged"
            } else {
                "Would have purged"
            };
            let line = format_sstr!(
                "{verb} Packer instance {} keyname={} securitygroup-id={}",
                instance.id,
                instance.key_name.as_deref().unwrap_or(""),
                instance.security_group_ids.first().map_or("", |g| g.as_str()),
            );
            info!("{line}");
            output.push(line);
        }
        Ok(output)
    }
}

#[derive(Parser, Debug, Clone)]
/// Clean up abandoned Packer builder instances with their key pairs and
/// security groups
pub struct PackerJanitorOpts {
    #[clap(short = 'D', long, env = "DELETE")]
    /// Actually purge AWS resources (dry run by default)
    delete: bool,
    #[clap(short, long, env = "TIMELIMIT", default_value = "4")]
    /// Hours after which Packer resources are considered abandoned
    timelimit: u32,
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

impl PackerJanitorOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let config = Config::init_config()?;
        let sdk_config = get_sdk_config(opts.region.as_deref(), opts.profile.as_deref()).await;
        let ec2 = Ec2Instance::new(&sdk_config);
        let timelimit = time::Duration::hours(i64::from(opts.timelimit));
        let waiter_attempts = config.waiter_max_attempts;
        let waiter_delay = config.waiter_poll_interval();
        let delete = opts.delete;

        if opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let janitor = PackerJanitor {
                    ec2: ec2.clone(),
                    delete,
                    expiration: OffsetDateTime::now_utc() - timelimit,
                    waiter_attempts,
                    waiter_delay,
                };
                async move { janitor.clean_packer_resources().await }
            })
            .await;
        }

        let janitor = PackerJanitor {
            ec2,
            delete,
            expiration: OffsetDateTime::now_utc() - timelimit,
            waiter_attempts,
            waiter_delay,
        };
        let stdout = StdoutChannel::<StackString>::new();
        for line in janitor.clean_packer_resources().await? {
            stdout.send(line);
        }
        stdout.close().await.map_err(Into::into)
    }
}
