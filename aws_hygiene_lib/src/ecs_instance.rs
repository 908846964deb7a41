use anyhow::{Error, format_err};
use aws_config::SdkConfig;
use aws_sdk_ecs::{Client as EcsClient, types::TaskDefinition};
use log::debug;
use stack_string::StackString;
use std::fmt;

use crate::ecs_service_deployer::{EcsDeployApi, ServiceInfo};

#[derive(Clone)]
pub struct EcsInstance {
    ecs_client: EcsClient,
}

impl fmt::Debug for EcsInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("EcsInstance")
    }
}

impl EcsInstance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            ecs_client: EcsClient::from_conf(sdk_config.into()),
        }
    }
}

impl EcsDeployApi for EcsInstance {
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<Option<ServiceInfo>, Error> {
        let output = self
            .ecs_client
            .describe_services()
            .cluster(cluster)
            .services(service)
            .send()
            .await?;
        for failure in output.failures() {
            debug!(
                "describe service failure arn={:?} reason={:?}",
                failure.arn(),
                failure.reason()
            );
        }
        Ok(output.services().first().map(|s| ServiceInfo {
            service_arn: s.service_arn().map(Into::into),
            task_definition: s.task_definition().map(Into::into),
            status: s.status().map(Into::into),
        }))
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinition, Error> {
        let output = self
            .ecs_client
            .describe_task_definition()
            .task_definition(arn)
            .send()
            .await?;
        output
            .task_definition()
            .cloned()
            .ok_or_else(|| format_err!("No task definition found for {arn}"))
    }

    async fn register_task_definition(
        &self,
        task_definition: &TaskDefinition,
    ) -> Result<TaskDefinition, Error> {
        let family = task_definition
            .family()
            .ok_or_else(|| format_err!("task definition has no family"))?;
        let output = self
            .ecs_client
            .register_task_definition()
            .family(family)
            .set_container_definitions(Some(task_definition.container_definitions().to_vec()))
            .set_cpu(task_definition.cpu().map(Into::into))
            .set_memory(task_definition.memory().map(Into::into))
            .set_execution_role_arn(task_definition.execution_role_arn().map(Into::into))
            .set_task_role_arn(task_definition.task_role_arn().map(Into::into))
            .set_network_mode(task_definition.network_mode().cloned())
            .set_requires_compatibilities(Some(
                task_definition.requires_compatibilities().to_vec(),
            ))
            .set_volumes(Some(task_definition.volumes().to_vec()))
            .send()
            .await?;
        output
            .task_definition()
            .cloned()
            .ok_or_else(|| format_err!("RegisterTaskDefinition returned no task definition"))
    }

    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> Result<ServiceInfo, Error> {
        let output = self
            .ecs_client
            .update_service()
            .cluster(cluster)
            .service(service)
            .task_definition(task_definition_arn)
            .force_new_deployment(true)
            .send()
            .await?;
        let service = output
            .service()
            .ok_or_else(|| format_err!("UpdateService returned no service for {service}"))?;
        Ok(ServiceInfo {
            service_arn: service.service_arn().map(Into::into),
            task_definition: service.task_definition().map(Into::into),
            status: service.status().map(StackString::from),
        })
    }
}
