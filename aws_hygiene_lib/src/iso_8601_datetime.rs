use anyhow::Error;
use aws_smithy_types::DateTime as AwsDateTime;
use stack_string::StackString;
use time::{
    Duration, OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339,
    macros::format_description,
};

/// # Errors
/// Return error if formatting fails
pub fn convert_datetime_to_str(datetime: OffsetDateTime) -> Result<StackString, Error> {
    datetime
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .map_err(Into::into)
        .map(Into::into)
}

/// Parse the timestamps aws hands back as strings, e.g. AMI creation dates
/// (`2017-03-01T12:00:00.000Z`) and credential report columns
/// (`2018-07-11T19:19:08+00:00`).
/// # Errors
/// Return error if the string isn't valid rfc3339
pub fn convert_str_to_datetime(s: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map(|x| x.to_offset(UtcOffset::UTC))
        .map_err(Into::into)
}

/// # Errors
/// Return error if the timestamp is out of range
pub fn from_aws_datetime(datetime: &AwsDateTime) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(datetime.as_nanos()).map_err(Into::into)
}

#[must_use]
pub fn to_aws_datetime(datetime: OffsetDateTime) -> AwsDateTime {
    AwsDateTime::from_secs(datetime.unix_timestamp())
}

/// Cutoff for retention checks: resources created before this are expired
#[must_use]
pub fn expiration_date(now: OffsetDateTime, days: u32) -> OffsetDateTime {
    now - Duration::days(i64::from(days))
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use aws_smithy_types::DateTime as AwsDateTime;
    use time::macros::datetime;

    use crate::iso_8601_datetime::{
        convert_datetime_to_str, convert_str_to_datetime, expiration_date, from_aws_datetime,
        to_aws_datetime,
    };

    #[test]
    fn test_convert_str_to_datetime() -> Result<(), Error> {
        let dt = convert_str_to_datetime("2017-03-01T12:30:00.000Z")?;
        assert_eq!(dt, datetime!(2017-03-01 12:30:00 UTC));
        let dt = convert_str_to_datetime("2018-07-11T19:19:08+00:00")?;
        assert_eq!(dt, datetime!(2018-07-11 19:19:08 UTC));
        assert!(convert_str_to_datetime("N/A").is_err());
        assert_eq!(
            convert_datetime_to_str(dt)?.as_str(),
            "2018-07-11T19:19:08Z"
        );
        Ok(())
    }

    #[test]
    fn test_aws_datetime() -> Result<(), Error> {
        let dt = datetime!(2019-02-03 04:05:06 UTC);
        let aws = to_aws_datetime(dt);
        assert_eq!(aws, AwsDateTime::from_secs(dt.unix_timestamp()));
        assert_eq!(from_aws_datetime(&aws)?, dt);
        Ok(())
    }

    #[test]
    fn test_expiration_date() {
        let now = datetime!(2017-03-31 00:00:00 UTC);
        assert_eq!(expiration_date(now, 30), datetime!(2017-03-01 00:00:00 UTC));
    }
}
