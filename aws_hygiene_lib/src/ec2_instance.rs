use anyhow::{Error, format_err};
use aws_config::SdkConfig;
use aws_sdk_ec2::{
    Client as Ec2Client,
    operation::{
        delete_key_pair::DeleteKeyPairError, delete_security_group::DeleteSecurityGroupError,
        delete_snapshot::DeleteSnapshotError, terminate_instances::TerminateInstancesError,
    },
    types::{
        DeviceType, Filter, Image, ImageAttributeName, Instance, InstanceStateName, Snapshot,
        SnapshotState, Tag, Volume,
    },
};
use log::debug;
use stack_string::{StackString, format_sstr};
use std::{fmt, time::Duration};
use time::OffsetDateTime;

use crate::{
    errors::AwsSdkError,
    iso_8601_datetime::{convert_str_to_datetime, from_aws_datetime},
    poll::{PollStatus, poll_with_fixed_delay},
};

pub type TagList = Vec<(StackString, StackString)>;

#[derive(Clone)]
pub struct Ec2Instance {
    ec2_client: Ec2Client,
}

impl fmt::Debug for Ec2Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Ec2Instance")
    }
}

fn get_tags(tags: &[Tag]) -> TagList {
    tags.iter()
        .filter_map(|t| Some((t.key()?.into(), t.value().unwrap_or("").into())))
        .collect()
}

impl Ec2Instance {
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            ec2_client: Ec2Client::from_conf(sdk_config.into()),
        }
    }

    /// AMIs owned by the calling account
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_own_images(&self) -> Result<Vec<AmiInfo>, Error> {
        let output = self
            .ec2_client
            .describe_images()
            .owners("self")
            .send()
            .await?;
        Ok(output.images().iter().filter_map(AmiInfo::from_image).collect())
    }

    /// Accounts allowed to launch the AMI
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_launch_permission_accounts(
        &self,
        image_id: &str,
    ) -> Result<Vec<StackString>, Error> {
        let output = self
            .ec2_client
            .describe_image_attribute()
            .image_id(image_id)
            .attribute(ImageAttributeName::LaunchPermission)
            .send()
            .await?;
        Ok(output
            .launch_permissions()
            .iter()
            .filter_map(|p| p.user_id().map(Into::into))
            .collect())
    }

    /// Whether any instance visible to this client was launched from `image_id`
    /// # Errors
    /// Returns error if aws api fails
    pub async fn image_has_instances(&self, image_id: &str) -> Result<bool, Error> {
        let output = self
            .ec2_client
            .describe_instances()
            .filters(Filter::builder().name("image-id").values(image_id).build())
            .send()
            .await?;
        Ok(output
            .reservations()
            .iter()
            .any(|r| !r.instances().is_empty()))
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn deregister_image(&self, image_id: &str) -> Result<(), Error> {
        self.ec2_client
            .deregister_image()
            .image_id(image_id)
            .send()
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns the raw sdk error so callers can inspect the error code
    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<(), AwsSdkError<DeleteSnapshotError>> {
        self.ec2_client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map(|_| ())
    }

    /// Snapshots owned by the calling account
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_own_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        let mut next_token: Option<String> = None;
        let mut snapshots = Vec::new();
        loop {
            let output = self
                .ec2_client
                .describe_snapshots()
                .owner_ids("self")
                .set_next_token(next_token.take())
                .send()
                .await?;
            snapshots.extend(output.snapshots().iter().filter_map(SnapshotInfo::from_snapshot));
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.into()),
                _ => break,
            }
        }
        Ok(snapshots)
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>, Error> {
        let output = self
            .ec2_client
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await?;
        Ok(output
            .snapshots()
            .iter()
            .find_map(SnapshotInfo::from_snapshot))
    }

    /// Exactly one volume must match. Looked up through a `volume-id` filter
    /// so an unknown id yields an empty list instead of `InvalidVolume.NotFound`
    /// # Errors
    /// Returns error if aws api fails or the volume is not found
    pub async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, Error> {
        let output = self
            .ec2_client
            .describe_volumes()
            .filters(Filter::builder().name("volume-id").values(volume_id).build())
            .send()
            .await?;
        let volumes = output
            .volumes()
            .iter()
            .filter_map(VolumeInfo::from_volume)
            .collect();
        single_volume(volume_id, volumes)
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<StackString, Error> {
        let output = self
            .ec2_client
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .send()
            .await?;
        output
            .snapshot_id()
            .map(Into::into)
            .ok_or_else(|| format_err!("CreateSnapshot returned no snapshot id for {volume_id}"))
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn create_tags(
        &self,
        resource_id: &str,
        tags: &[(StackString, StackString)],
    ) -> Result<(), Error> {
        if tags.is_empty() {
            return Ok(());
        }
        let tags = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k.as_str()).value(v.as_str()).build())
            .collect();
        self.ec2_client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(tags))
            .send()
            .await?;
        Ok(())
    }

    /// Poll until the snapshot reaches `completed`
    /// # Errors
    /// Returns error if the snapshot errors, disappears, or never completes
    pub async fn wait_for_snapshot_completed(
        &self,
        snapshot_id: &str,
        attempts: usize,
        delay: Duration,
    ) -> Result<SnapshotInfo, Error> {
        let what = format_sstr!("snapshot {snapshot_id} to complete");
        poll_with_fixed_delay(&what, attempts, delay, |_| async move {
            let snapshot = self
                .get_snapshot(snapshot_id)
                .await?
                .ok_or_else(|| format_err!("snapshot {snapshot_id} not found"))?;
            match snapshot.state {
                Some(SnapshotState::Completed) => Ok(PollStatus::Done(snapshot)),
                Some(SnapshotState::Error) => {
                    Err(format_err!("snapshot {snapshot_id} is in error state"))
                }
                _ => Ok(PollStatus::Pending),
            }
        })
        .await
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), Error> {
        self.ec2_client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await?;
        Ok(())
    }

    /// Instances carrying tag `Name=<name>`
    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_instances_by_name(&self, name: &str) -> Result<Vec<InstanceInfo>, Error> {
        let mut next_token: Option<String> = None;
        let mut instances = Vec::new();
        loop {
            let output = self
                .ec2_client
                .describe_instances()
                .filters(Filter::builder().name("tag:Name").values(name).build())
                .set_next_token(next_token.take())
                .send()
                .await?;
            instances.extend(
                output
                    .reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter_map(InstanceInfo::from_instance),
            );
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.into()),
                _ => break,
            }
        }
        Ok(instances)
    }

    /// # Errors
    /// Returns error if aws api fails
    pub async fn get_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStateName>, Error> {
        let output = self
            .ec2_client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(|i| i.state().and_then(|s| s.name()).cloned()))
    }

    /// # Errors
    /// Returns the raw sdk error so callers can detect `DryRunOperation`
    pub async fn terminate_instance(
        &self,
        instance_id: &str,
        dry_run: bool,
    ) -> Result<(), AwsSdkError<TerminateInstancesError>> {
        self.ec2_client
            .terminate_instances()
            .instance_ids(instance_id)
            .dry_run(dry_run)
            .send()
            .await
            .map(|_| ())
    }

    /// Poll until the instance reports `terminated`
    /// # Errors
    /// Returns error if aws api fails or the instance never terminates
    pub async fn wait_for_instance_terminated(
        &self,
        instance_id: &str,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), Error> {
        let what = format_sstr!("instance {instance_id} to terminate");
        poll_with_fixed_delay(&what, attempts, delay, |_| async move {
            let state = self.get_instance_state(instance_id).await?;
            debug!("instance {instance_id} state={state:?}");
            match state {
                None | Some(InstanceStateName::Terminated) => Ok(PollStatus::Done(())),
                _ => Ok(PollStatus::Pending),
            }
        })
        .await
    }

    /// # Errors
    /// Returns the raw sdk error so callers can detect `DryRunOperation`
    pub async fn delete_key_pair(
        &self,
        key_name: &str,
        dry_run: bool,
    ) -> Result<(), AwsSdkError<DeleteKeyPairError>> {
        self.ec2_client
            .delete_key_pair()
            .key_name(key_name)
            .dry_run(dry_run)
            .send()
            .await
            .map(|_| ())
    }

    /// # Errors
    /// Returns the raw sdk error so callers can detect `DryRunOperation`
    pub async fn delete_security_group(
        &self,
        group_id: &str,
        dry_run: bool,
    ) -> Result<(), AwsSdkError<DeleteSecurityGroupError>> {
        self.ec2_client
            .delete_security_group()
            .group_id(group_id)
            .dry_run(dry_run)
            .send()
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmiInfo {
    pub id: StackString,
    pub name: StackString,
    pub owner_id: Option<StackString>,
    pub creation_date: Option<OffsetDateTime>,
    pub ebs_backed: bool,
    pub tags: TagList,
    pub snapshot_ids: Vec<StackString>,
}

impl AmiInfo {
    fn from_image(image: &Image) -> Option<Self> {
        Some(Self {
            id: image.image_id()?.into(),
            name: image.name().unwrap_or("").into(),
            owner_id: image.owner_id().map(Into::into),
            creation_date: image
                .creation_date()
                .and_then(|d| convert_str_to_datetime(d).ok()),
            ebs_backed: image.root_device_type() == Some(&DeviceType::Ebs),
            tags: get_tags(image.tags()),
            snapshot_ids: image
                .block_device_mappings()
                .iter()
                .filter_map(|b| b.ebs().and_then(|e| e.snapshot_id()).map(Into::into))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub id: StackString,
    pub volume_id: Option<StackString>,
    pub start_time: Option<OffsetDateTime>,
    pub state: Option<SnapshotState>,
    pub tags: TagList,
}

impl SnapshotInfo {
    fn from_snapshot(snapshot: &Snapshot) -> Option<Self> {
        Some(Self {
            id: snapshot.snapshot_id()?.into(),
            volume_id: snapshot.volume_id().map(Into::into),
            start_time: snapshot
                .start_time()
                .and_then(|t| from_aws_datetime(t).ok()),
            state: snapshot.state().cloned(),
            tags: get_tags(snapshot.tags()),
        })
    }
}

/// # Errors
/// Returns error unless exactly one volume was found
pub fn single_volume(volume_id: &str, mut volumes: Vec<VolumeInfo>) -> Result<VolumeInfo, Error> {
    if volumes.len() > 1 {
        return Err(format_err!(
            "Expected one volume for {volume_id}, found {}",
            volumes.len()
        ));
    }
    volumes
        .pop()
        .ok_or_else(|| format_err!("No volumes found with volumeId: {volume_id}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub id: StackString,
    pub availability_zone: Option<StackString>,
    pub size: Option<i32>,
    pub tags: TagList,
}

impl VolumeInfo {
    fn from_volume(volume: &Volume) -> Option<Self> {
        Some(Self {
            id: volume.volume_id()?.into(),
            availability_zone: volume.availability_zone().map(Into::into),
            size: volume.size(),
            tags: get_tags(volume.tags()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub id: StackString,
    pub launch_time: OffsetDateTime,
    pub key_name: Option<StackString>,
    pub security_group_ids: Vec<StackString>,
    pub state: Option<InstanceStateName>,
}

impl InstanceInfo {
    fn from_instance(instance: &Instance) -> Option<Self> {
        Some(Self {
            id: instance.instance_id()?.into(),
            launch_time: from_aws_datetime(instance.launch_time()?).ok()?,
            key_name: instance.key_name().map(Into::into),
            security_group_ids: instance
                .security_groups()
                .iter()
                .filter_map(|g| g.group_id().map(Into::into))
                .collect(),
            state: instance.state().and_then(|s| s.name()).cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_ec2::types::{
        BlockDeviceMapping, DeviceType, EbsBlockDevice, GroupIdentifier, Image, Instance,
        InstanceState, InstanceStateName, Tag,
    };
    use aws_smithy_types::DateTime;
    use stack_string::StackString;
    use time::macros::datetime;

    use crate::ec2_instance::{AmiInfo, InstanceInfo, VolumeInfo, get_tags, single_volume};

    fn volume(id: &str) -> VolumeInfo {
        VolumeInfo {
            id: id.into(),
            availability_zone: None,
            size: Some(8),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_single_volume() {
        let err = single_volume("vol-missing", Vec::new()).expect_err("no volumes");
        assert_eq!(err.to_string(), "No volumes found with volumeId: vol-missing");

        let found = single_volume("vol-1", vec![volume("vol-1")]).expect("one volume");
        assert_eq!(found.id.as_str(), "vol-1");

        assert!(single_volume("vol-1", vec![volume("vol-1"), volume("vol-2")]).is_err());
    }

    #[test]
    fn test_get_tags_keeps_order() {
        let tags = [
            Tag::builder().key("Name").value("web").build(),
            Tag::builder().key("Env").build(),
            Tag::builder().value("orphan").build(),
        ];
        let tags = get_tags(&tags);
        assert_eq!(
            tags,
            vec![("Name".into(), "web".into()), ("Env".into(), "".into())]
        );
    }

    #[test]
    fn test_ami_info_from_image() {
        let image = Image::builder()
            .image_id("ami-123")
            .name("base-2017")
            .creation_date("2017-03-01T12:00:00.000Z")
            .root_device_type(DeviceType::Ebs)
            .tags(Tag::builder().key("Role").value("base").build())
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sda1")
                    .ebs(EbsBlockDevice::builder().snapshot_id("snap-1").build())
                    .build(),
            )
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sdb")
                    .virtual_name("ephemeral0")
                    .build(),
            )
            .build();
        let ami = AmiInfo::from_image(&image).expect("image has an id");
        assert_eq!(ami.id.as_str(), "ami-123");
        assert!(ami.ebs_backed);
        assert_eq!(ami.creation_date, Some(datetime!(2017-03-01 12:00:00 UTC)));
        assert_eq!(ami.snapshot_ids, vec![StackString::from("snap-1")]);

        assert!(AmiInfo::from_image(&Image::builder().name("no-id").build()).is_none());
    }

    #[test]
    fn test_instance_info_from_instance() {
        let instance = Instance::builder()
            .instance_id("i-123")
            .key_name("packer_5a7b")
            .launch_time(DateTime::from_secs(1_500_000_000))
            .security_groups(GroupIdentifier::builder().group_id("sg-1").build())
            .state(
                InstanceState::builder()
                    .name(InstanceStateName::Running)
                    .build(),
            )
            .build();
        let info = InstanceInfo::from_instance(&instance).expect("instance has an id");
        assert_eq!(info.key_name.as_deref(), Some("packer_5a7b"));
        assert_eq!(info.security_group_ids, vec![StackString::from("sg-1")]);
        assert_eq!(info.launch_time.unix_timestamp(), 1_500_000_000);
        assert_eq!(info.state, Some(InstanceStateName::Running));

        let no_launch = Instance::builder().instance_id("i-456").build();
        assert!(InstanceInfo::from_instance(&no_launch).is_none());
    }
}
