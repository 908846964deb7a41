use anyhow::{Error, format_err};
use clap::Parser;
use log::{error, info, warn};
use stack_string::{StackString, format_sstr};
use std::{fmt, future::Future, str::FromStr};
use stdout_channel::StdoutChannel;
use time::{Duration, OffsetDateTime};

use crate::{
    cloudwatch_logs_instance::CloudWatchLogsInstance,
    config::Config,
    lambda_handler::run_lambda,
    rds_instance::{DbLogFileInfo, RdsInstance},
    session::AwsOpts,
};

/// `PutLogEvents` limits
const MAX_BATCH_EVENTS: usize = 10_000;
const MAX_BATCH_BYTES: usize = 1_048_576;
const EVENT_OVERHEAD_BYTES: usize = 26;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilePortion {
    pub data: Option<StackString>,
    pub marker: Option<StackString>,
    pub additional_data_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// milliseconds since the epoch
    pub timestamp: i64,
    pub message: StackString,
}

pub trait RdsLogApi {
    fn get_log_files_since(
        &self,
        db_instance_identifier: &str,
        since_ms: i64,
    ) -> impl Future<Output = Result<Vec<DbLogFileInfo>, Error>> + Send;
    fn download_log_file_portion(
        &self,
        db_instance_identifier: &str,
        log_file_name: &str,
        marker: &str,
        number_of_lines: i32,
    ) -> impl Future<Output = Result<LogFilePortion, Error>> + Send;
}

pub trait LogStreamApi {
    /// Returns false if the stream already exists
    fn create_log_stream(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;
    fn put_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        events: &[LogEvent],
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    OneHour,
    OneDay,
}

impl FromStr for StartTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            _ => Err(format_err!("start time must be 1h or 1d, got {s}")),
        }
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OneHour => f.write_str("1h"),
            Self::OneDay => f.write_str("1d"),
        }
    }
}

impl StartTime {
    /// Start of the window in milliseconds since the epoch
    #[must_use]
    pub fn since_ms(self, now: OffsetDateTime) -> i64 {
        let window = match self {
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::days(1),
        };
        (now - window).unix_timestamp() * 1000
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// One event per non-empty line
#[must_use]
pub fn log_events_from_data(data: &str, timestamp: i64) -> Vec<LogEvent> {
    data.lines()
        .filter(|line| !line.is_empty())
        .map(|line| LogEvent {
            timestamp,
            message: line.into(),
        })
        .collect()
}

/// Split events into batches that fit a single `PutLogEvents` call
#[must_use]
pub fn batch_log_events(events: Vec<LogEvent>) -> Vec<Vec<LogEvent>> {
    let mut batches = Vec::new();
    let mut batch = Vec::new();
    let mut batch_bytes = 0;
    for event in events {
        let event_bytes = event.message.len() + EVENT_OVERHEAD_BYTES;
        if !batch.is_empty()
            && (batch.len() >= MAX_BATCH_EVENTS || batch_bytes + event_bytes > MAX_BATCH_BYTES)
        {
            batches.push(std::mem::take(&mut batch));
            batch_bytes = 0;
        }
        batch_bytes += event_bytes;
        batch.push(event);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShipSummary {
    pub files_sent: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub events_sent: usize,
}

#[derive(Debug, Clone)]
pub struct RdsLogShipper<R: RdsLogApi, L: LogStreamApi> {
    rds: R,
    logs: L,
    db_instance_identifier: StackString,
    log_group: StackString,
    portion_lines: i32,
}

impl<R: RdsLogApi, L: LogStreamApi> RdsLogShipper<R, L> {
    pub fn new(
        rds: R,
        logs: L,
        db_instance_identifier: impl Into<StackString>,
        log_group: impl Into<StackString>,
        portion_lines: i32,
    ) -> Self {
        Self {
            rds,
            logs,
            db_instance_identifier: db_instance_identifier.into(),
            log_group: log_group.into(),
            portion_lines,
        }
    }

    /// # Errors
    /// Returns error if api call fails
    pub async fn get_log_files_since(&self, since_ms: i64) -> Result<Vec<DbLogFileInfo>, Error> {
        self.rds
            .get_log_files_since(&self.db_instance_identifier, since_ms)
            .await
    }

    /// The file the instance is currently writing to
    /// # Errors
    /// Returns error if api call fails or there are no log files
    pub async fn get_most_recent_log_file(&self) -> Result<DbLogFileInfo, Error> {
        self.get_log_files_since(0)
            .await?
            .into_iter()
            .max_by_key(|f| f.last_written)
            .ok_or_else(|| format_err!("no log files found"))
    }

    /// Download `log_file_name` portion by portion, putting each portion's
    /// lines to the stream. Returns the number of events sent.
    /// # Errors
    /// Returns error if api call fails
    pub async fn download_db_log_file(
        &self,
        log_file_name: &str,
        log_stream: &str,
    ) -> Result<usize, Error> {
        let mut marker = StackString::from("0");
        let mut events_sent = 0;
        loop {
            let portion = self
                .rds
                .download_log_file_portion(
                    &self.db_instance_identifier,
                    log_file_name,
                    &marker,
                    self.portion_lines,
                )
                .await?;
            if let Some(data) = portion.data.as_deref().filter(|d| !d.is_empty()) {
                for batch in batch_log_events(log_events_from_data(data, now_ms())) {
                    self.logs
                        .put_log_events(&self.log_group, log_stream, &batch)
                        .await?;
                    events_sent += batch.len();
                }
            }
            if !portion.additional_data_pending {
                return Ok(events_sent);
            }
            marker = portion
                .marker
                .ok_or_else(|| format_err!("missing marker for {log_file_name}"))?;
        }
    }

    /// Stream one log file into a new log stream named after the file.
    /// Returns `None` if the stream already exists.
    /// # Errors
    /// Returns error if api call fails
    pub async fn send_rds_log_file(&self, log_file_name: &str) -> Result<Option<usize>, Error> {
        if !self
            .logs
            .create_log_stream(&self.log_group, log_file_name)
            .await?
        {
            warn!("cloudwatch log stream already exists cloudwatch_logs_stream={log_file_name}");
            return Ok(None);
        }
        info!(
            "creating new cloudwatch log stream cloudwatch_logs_group={} \
             cloudwatch_logs_stream={log_file_name}",
            self.log_group
        );
        info!(
            "downloading rds log file db_instance_identifier={} rds_log_file={log_file_name}",
            self.db_instance_identifier
        );
        let events_sent = self.download_db_log_file(log_file_name, log_file_name).await?;
        info!(
            "wrote logs to cloudwatch logs cloudwatch_logs_group={} \
             cloudwatch_logs_stream={log_file_name} events={events_sent}",
            self.log_group
        );
        Ok(Some(events_sent))
    }

    /// Send every file written since `since_ms` except the one still being
    /// written. Per-file failures are logged and counted.
    /// # Errors
    /// Returns error if the log files can't be listed
    pub async fn send_logs_since(&self, since_ms: i64) -> Result<ShipSummary, Error> {
        let most_recent = self.get_most_recent_log_file().await?;
        let log_files = self.get_log_files_since(since_ms).await?;
        let mut summary = ShipSummary::default();
        for log_file in &log_files {
            if log_file.name == most_recent.name {
                info!("skipping most recent db log file db_log_file_name={}", most_recent.name);
                continue;
            }
            match self.send_rds_log_file(&log_file.name).await {
                Ok(Some(events)) => {
                    summary.files_sent += 1;
                    summary.events_sent += events;
                }
                Ok(None) => summary.files_skipped += 1,
                Err(e) => {
                    error!(
                        "unable to send rds log file to cloudwatch logs file={} error={e}",
                        log_file.name
                    );
                    summary.files_failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[derive(Parser, Debug, Clone)]
/// Stream RDS log files into CloudWatch Logs
pub struct RdsCloudwatchLogsOpts {
    #[clap(long, env = "CLOUDWATCH_LOGS_GROUP")]
    /// CloudWatch Logs group name
    cloudwatch_logs_group: StackString,
    #[clap(long, env = "DB_INSTANCE_IDENTIFIER")]
    /// RDS database instance identifier
    db_instance_identifier: StackString,
    #[clap(long, env = "START_TIME")]
    /// Log file start time, 1h or 1d
    start_time: StartTime,
    #[clap(long, env = "LAMBDA")]
    /// Run as Lambda function
    lambda: bool,
    #[clap(flatten)]
    aws: AwsOpts,
}

impl RdsCloudwatchLogsOpts {
    /// # Errors
    /// Returns error if api call fails
    pub async fn process_args() -> Result<(), Error> {
        let opts = Self::parse();
        let config = Config::init_config()?;
        let sdk_config = opts.aws.sdk_config().await;
        let shipper = RdsLogShipper::new(
            RdsInstance::new(&sdk_config),
            CloudWatchLogsInstance::new(&sdk_config),
            opts.db_instance_identifier,
            opts.cloudwatch_logs_group,
            config.log_portion_lines,
        );
        let start_time = opts.start_time;

        if opts.lambda {
            return run_lambda(move |_: serde_json::Value| {
                let shipper = shipper.clone();
                async move {
                    let since_ms = start_time.since_ms(OffsetDateTime::now_utc());
                    let summary = shipper.send_logs_since(since_ms).await?;
                    Ok(format_sstr!("{summary:?}"))
                }
            })
            .await;
        }

        let since_ms = start_time.since_ms(OffsetDateTime::now_utc());
        let summary = shipper.send_logs_since(since_ms).await?;
        let stdout = StdoutChannel::<StackString>::new();
        stdout.send(format_sstr!(
            "sent={} skipped={} failed={} events={}",
            summary.files_sent,
            summary.files_skipped,
            summary.files_failed,
            summary.events_sent
        ));
        stdout.close().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Error, format_err};
    use maplit::hashmap;
    use stack_string::StackString;
    use std::{collections::HashMap, sync::Mutex};
    use time::macros::datetime;

    use crate::{
        rds_cloudwatch_logs::{
            LogEvent, LogFilePortion, LogStreamApi, RdsLogApi, RdsLogShipper, ShipSummary,
            StartTime, batch_log_events, log_events_from_data,
        },
        rds_instance::DbLogFileInfo,
    };

    /// Log files keyed by name, each a list of portions
    struct FakeRds {
        files: Vec<DbLogFileInfo>,
        portions: HashMap<&'static str, Vec<&'static str>>,
    }

    impl RdsLogApi for FakeRds {
        async fn get_log_files_since(
            &self,
            _: &str,
            since_ms: i64,
        ) -> Result<Vec<DbLogFileInfo>, Error> {
            Ok(self
                .files
                .iter()
                .filter(|f| f.last_written >= since_ms)
                .cloned()
                .collect())
        }

        async fn download_log_file_portion(
            &self,
            _: &str,
            log_file_name: &str,
            marker: &str,
            _: i32,
        ) -> Result<LogFilePortion, Error> {
            let portions = self
                .portions
                .get(log_file_name)
                .ok_or_else(|| format_err!("no such file {log_file_name}"))?;
            let idx: usize = marker.parse()?;
            let additional_data_pending = idx + 1 < portions.len();
            Ok(LogFilePortion {
                data: portions.get(idx).map(|d| StackString::from(*d)),
                marker: Some(StackString::from(format!("{}", idx + 1).as_str())),
                additional_data_pending,
            })
        }
    }

    #[derive(Default)]
    struct FakeLogs {
        existing: Vec<&'static str>,
        streams: Mutex<Vec<String>>,
        events: Mutex<HashMap<String, Vec<String>>>,
    }

    impl LogStreamApi for FakeLogs {
        async fn create_log_stream(&self, _: &str, log_stream: &str) -> Result<bool, Error> {
            if self.existing.iter().any(|s| *s == log_stream) {
                return Ok(false);
            }
            self.streams.lock().expect("lock").push(log_stream.into());
            Ok(true)
        }

        async fn put_log_events(
            &self,
            _: &str,
            log_stream: &str,
            events: &[LogEvent],
        ) -> Result<(), Error> {
            self.events
                .lock()
                .expect("lock")
                .entry(log_stream.into())
                .or_default()
                .extend(events.iter().map(|e| e.message.to_string()));
            Ok(())
        }
    }

    fn log_file(name: &str, last_written: i64) -> DbLogFileInfo {
        DbLogFileInfo {
            name: name.into(),
            last_written,
            size: 100,
        }
    }

    fn fake_rds() -> FakeRds {
        FakeRds {
            files: vec![
                log_file("error/postgres.log.00", 1000),
                log_file("error/postgres.log.01", 2000),
                log_file("error/postgres.log.02", 3000),
                log_file("error/postgres.log.03", 4000),
            ],
            portions: hashmap! {
                "error/postgres.log.01" => vec!["a\nb\n", "", "c\n"],
                "error/postgres.log.02" => vec!["d\n\ne\n"],
                "error/postgres.log.03" => vec!["current\n"],
            },
        }
    }

    #[test]
    fn test_start_time() -> Result<(), Error> {
        let now = datetime!(2018-01-02 00:00:00 UTC);
        assert_eq!("1h".parse::<StartTime>()?, StartTime::OneHour);
        assert_eq!("1d".parse::<StartTime>()?, StartTime::OneDay);
        assert!("2w".parse::<StartTime>().is_err());
        assert_eq!(
            StartTime::OneHour.since_ms(now),
            datetime!(2018-01-01 23:00:00 UTC).unix_timestamp() * 1000
        );
        assert_eq!(
            StartTime::OneDay.since_ms(now),
            datetime!(2018-01-01 00:00:00 UTC).unix_timestamp() * 1000
        );
        Ok(())
    }

    #[test]
    fn test_log_events_from_data() {
        let events = log_events_from_data("first\n\nsecond\r\nthird", 42);
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert!(events.iter().all(|e| e.timestamp == 42));
    }

    #[test]
    fn test_batch_log_events_by_count() {
        let events = (0..25_000)
            .map(|i| LogEvent {
                timestamp: 0,
                message: format!("line {i}").as_str().into(),
            })
            .collect();
        let batches = batch_log_events(events);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10_000, 10_000, 5_000]);
    }

    #[test]
    fn test_batch_log_events_by_size() {
        let line = "x".repeat(100_000);
        let events = (0..25)
            .map(|_| LogEvent {
                timestamp: 0,
                message: line.as_str().into(),
            })
            .collect();
        let batches = batch_log_events(events);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(batch_log_events(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_get_most_recent_log_file() -> Result<(), Error> {
        let shipper = RdsLogShipper::new(fake_rds(), FakeLogs::default(), "db", "group", 10);
        let recent = shipper.get_most_recent_log_file().await?;
        assert_eq!(recent.name.as_str(), "error/postgres.log.03");

        let empty = FakeRds {
            files: Vec::new(),
            portions: HashMap::new(),
        };
        let shipper = RdsLogShipper::new(empty, FakeLogs::default(), "db", "group", 10);
        let err = shipper
            .get_most_recent_log_file()
            .await
            .expect_err("no files");
        assert_eq!(err.to_string(), "no log files found");
        Ok(())
    }

    #[tokio::test]
    async fn test_send_logs_since() -> Result<(), Error> {
        let logs = FakeLogs {
            existing: vec!["error/postgres.log.02"],
            ..FakeLogs::default()
        };
        let shipper = RdsLogShipper::new(fake_rds(), logs, "db", "group", 10);
        let summary = shipper.send_logs_since(1500).await?;
        assert_eq!(
            summary,
            ShipSummary {
                files_sent: 1,
                files_skipped: 1,
                files_failed: 0,
                events_sent: 3,
            }
        );
        let events = shipper.logs.events.lock().expect("lock");
        assert_eq!(
            events.get("error/postgres.log.01"),
            Some(&vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(!events.contains_key("error/postgres.log.03"));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_logs_since_failure_is_not_fatal() -> Result<(), Error> {
        let shipper = RdsLogShipper::new(fake_rds(), FakeLogs::default(), "db", "group", 10);
        let summary = shipper.send_logs_since(0).await?;
        // log.00 has no portions in the fake, so its download fails
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.files_sent, 2);
        assert_eq!(summary.events_sent, 5);
        Ok(())
    }
}
