use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::ValidationError;

/// Instant at which an entity is valued, stored and compared in UTC.
///
/// Always within years 0000..=9999 so the RFC3339 rendering cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Parses an RFC3339 string. Offsets other than `Z`/`+00:00` are rejected, not converted.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let not_utc = || ValidationError::TimestampNotUtc {
            value: input.to_owned(),
        };
        let parsed = OffsetDateTime::parse(input, &Rfc3339).map_err(|_| not_utc())?;
        if parsed.offset() != UtcOffset::UTC {
            return Err(not_utc());
        }
        Ok(Self(parsed))
    }

    pub fn from_unix(seconds: i64) -> Result<Self, ValidationError> {
        match OffsetDateTime::from_unix_timestamp(seconds) {
            Ok(value) if (0..=9999).contains(&value.year()) => Ok(Self(value)),
            _ => Err(ValidationError::TimestampOutOfRange { value: seconds }),
        }
    }

    pub fn unix_timestamp(self) -> i64 {
        self.0.unix_timestamp()
    }

    /// Start of the `bucket_secs`-wide window containing this instant, as unix seconds.
    pub fn floor_to(self, bucket_secs: u64) -> i64 {
        let width = i64::try_from(bucket_secs).unwrap_or(i64::MAX).max(1);
        self.unix_timestamp().div_euclid(width) * width
    }

    /// Signed seconds from `earlier` to `self`.
    pub fn seconds_since(self, earlier: UtcDateTime) -> i64 {
        self.unix_timestamp() - earlier.unix_timestamp()
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .expect("four-digit UTC years always format as RFC3339")
    }
}

impl fmt::Display for UtcDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl TryFrom<String> for UtcDateTime {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UtcDateTime> for String {
    fn from(value: UtcDateTime) -> Self {
        value.format_rfc3339()
    }
}
