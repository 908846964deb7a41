use anyhow::{Error, format_err};
use aws_sdk_ecs::types::TaskDefinition;
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use std::{collections::HashMap, future::Future};
use stdout_channel::StdoutChannel;

use crate::{ecs_instance::EcsInstance, lambda_handler::run_lambda, session::AwsOpts};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
    pub service_arn: Option<StackString>,
    pub task_definition: Option<StackString>,
    pub status: Option<StackString>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub image: StackString,
}

/// New images keyed by container name:
/// `{"containers": {"web": {"image": "repo/web:tag"}}}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerImages {
    #[serde(default)]
    pub containers: HashMap<StackString, ContainerImage>,
}

impl ContainerImages {
    /// # Errors
    /// Returns error if the json is malformed
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }
}

pub trait EcsDeployApi {
    fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> impl Future<Output = Result<Option<ServiceInfo>, Error>> + Send;
    fn describe_task_definition(
        &self,
        arn: &str,
    ) -> impl Future<Output = Result<TaskDefinition, Error>> + Send;
    fn register_task_definition(
        &self,
        task_definition: &TaskDefinition,
    ) -> impl Future<Output = Result<TaskDefinition, Error>> + Send;
    fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> impl Future<Output = Result<ServiceInfo, Error>> + Send;
}

/// Replace the image of every container named in `images`, returning the
/// names that matched no container
#[must_use]
pub fn update_container_images(
    task_definition: &mut TaskDefinition,
    images: &ContainerImages,
) -> Vec<StackString> {
    let mut matched = Vec::new();
    if let Some(containers) = task_definition.container_definitions.as_mut() {
        for container in containers {
            let Some(name) = container.name.as_deref() else {
                continue;
            };
            if let Some(new_image) = images.containers.get(name) {
                info!(
                    "container {name} image {:?} -> {}",
                    container.image, new_image.image
                );
                container.image = Some(new_image.image.to_string());
                matched.push(StackString::from(name));
            }
        }
    }
    let mut unmatched: Vec<StackString> = images
        .containers
        .keys()
        .filter(|name| !matched.contains(name))
        .cloned()
        .collect();
    unmatched.sort();
    unmatched
}

#[derive(Debug, Clone)]
pub struct ServiceDeployer<T: EcsDeployApi> {
    api: T,
    cluster: StackString,
    service: StackString,
}

impl<T: EcsDeployApi> ServiceDeployer<T> {
    pub fn new(api: T, cluster: impl Into<StackString>, service: impl Into<StackString>) -> Self {
        Self {
            api,
            cluster: cluster.into(),
            service: service.into(),
        }
    }

    /// # Errors
    /// Returns error if the service doesn't exist or api call fails
    pub async fn get_service_task_definition(&self) -> Result<TaskDefinition, Error> {
        let service = self
            .api
            .describe_service(&self.cluster, &self.service)
            .await?
            .ok_or_else(|| {
                format_err!(
                    "No services found: service {} in cluster {}",
                    self.service,
                    self.cluster
                )
            })?;
        let arn = service.task_definition.ok_or_else(|| {
            format_err!("Service {} has no task definition", self.service)
        })?;
        self.api.describe_task_definition(&arn).await
    }

    /// Register a new revision of the service's task definition with the
    /// updated images
    /// # Errors
    /// Returns error if api call fails
    pub async fn register_updated_task_definition(
        &self,
        images: &ContainerImages,
    ) -> Result<TaskDefinition, Error> {
        let mut task_definition = self.get_service_task_definition().await?;
        let unmatched = update_container_images(&mut task_definition, images);
        for name in &unmatched {
            warn!("no container named {name} in service {}", self.service);
        }
        let registered = self.api.register_task_definition(&task_definition).await?;
        info!(
            "registered task definition {:?} revision {}",
            registered.task_definition_arn(),
            registered.revision()
        );
        Ok(registered)
    }

    /// # Errors
    /// Returns error if api call fails
    pub async fn deploy(&self, images: &ContainerImages) -> Result<ServiceInfo, Error> {
        let registered = self.register_updated_task_definition(images).await?;
        let arn = registered
            .task_definition_arn()
            .ok_or_else(|| format_err!("registered task definition has no arn"))?;
        let service = self
            .api
            .update_service(&self.cluster, &self.service, arn)
            .await?;
        info!(
            "updated service {} status {:?}",
            self.service, service.status
        );
        Ok(service)
    }
}

#[derive(Parser, Debug, Clone)]
/// Roll an ECS service onto new container images
pub struct EcsServiceDeployerOpts {
    #[clap(long = "ecs-cluster-identifier", env = "ECS_CLUSTER")]
    /// ECS cluster name
    cluster: StackString,
    #[clap(long = "ecs-service-identifier", env = "ECS_SERVICE")]
    /// ECS service name
    service: StackString,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(flatten)]
    aws: AwsOpts,
    /// Container images json, `{"containers":{"name":{"image":"..."}}}`
    container_json: StackString,
}

impl EcsServiceDeployerOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let sdk_config = opts.aws.sdk_config().await;
        let images = ContainerImages::from_json(&opts.container_json)?;
        let deployer =
            ServiceDeployer::new(EcsInstance::new(&sdk_config), opts.cluster, opts.service);

        if opts.lambda {
            return run_lambda(move |event: serde_json::Value| {
                let deployer = deployer.clone();
                let images = images.clone();
                async move {
                    // an event carrying its own container map overrides the cli one
                    let images = if event.get("containers").is_some() {
                        serde_json::from_value(event)?
                    } else {
                        images
                    };
                    let service = deployer.deploy(&images).await?;
                    Ok(service.status.unwrap_or_default())
                }
            })
            .await;
        }

        let service = deployer.deploy(&images).await?;
        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!(
            "{} {}",
            service.service_arn.unwrap_or_default(),
            service.status.unwrap_or_default()
        ));
        stdout.close().await.map_err(Into::into)
    }
}
