use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, de};

/// Deserialize a `u64` milliseconds value as a `DateTime<Utc>`.
pub fn de_u64_epoch_ms_as_datetime_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .ok_or_else(|| de::Error::custom(format!("out of range epoch ms: {millis}")))
}

/// Deserialize a `&str` containing a milliseconds value as a `DateTime<Utc>`.
///
/// eg/ OKX encodes all timestamps as strings: `"ts":"1597026383085"`.
pub fn de_str_epoch_ms_as_datetime_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let input = <&str as Deserialize>::deserialize(deserializer)?;
    let millis = input
        .parse::<i64>()
        .map_err(|error| de::Error::custom(format!("invalid epoch ms {input}: {error}")))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| de::Error::custom(format!("out of range epoch ms: {input}")))
}

/// Deserialize an optional `&str` milliseconds value as an `Option<DateTime<Utc>>`, mapping
/// absent or empty strings to `None`.
pub fn de_opt_str_epoch_ms_as_datetime_utc<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let input = Option::<&str>::deserialize(deserializer)?;
    match input {
        None | Some("") => Ok(None),
        Some(value) => {
            let millis = value.parse::<i64>().map_err(|error| {
                de::Error::custom(format!("invalid epoch ms {value}: {error}"))
            })?;
            DateTime::<Utc>::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("out of range epoch ms: {value}")))
        }
    }
}
