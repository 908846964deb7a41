#![allow(clippy::must_use_candidate)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cognitive_complexity)]

pub mod config;
pub mod errors;
pub mod iso_8601_datetime;
pub mod lambda_handler;
pub mod poll;
pub mod session;
pub mod slack;

pub mod cloudwatch_instance;
pub mod cloudwatch_logs_instance;
pub mod ec2_instance;
pub mod ecr_instance;
pub mod ecs_instance;
pub mod iam_instance;
pub mod rds_instance;
pub mod s3_instance;
pub mod ssm_instance;
pub mod sts_instance;
pub mod support_instance;

pub mod ami_cleaner;
pub mod aws_health_notifier;
pub mod ebs_delete;
pub mod ebs_snapshot_cleaner;
pub mod ecr_scan;
pub mod ecs_service_deployer;
pub mod iam_keys_check;
pub mod packer_janitor;
pub mod rds_cloudwatch_logs;
pub mod rds_snapshot_cleaner;
pub mod s3_bucket_size;
pub mod trusted_advisor_refresh;
