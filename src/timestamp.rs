use std::fmt::{self, Debug, Display};

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};

// <timestamp>2003-12-05T06:41:50Z</timestamp>
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp `{text}`, expected YYYY-MM-DDTHH:MM:SSZ")]
pub struct FormatError {
    pub text: String,
    #[source]
    source: Option<chrono::ParseError>,
}

/// Point in time of a revision, always UTC with second precision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Unpadded fields are accepted, a signed year is not.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        // chrono's %Y takes an optional sign
        if !text.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(FormatError {
                text: text.to_owned(),
                source: None,
            });
        }

        NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
            .map(|dt| Timestamp(DateTime::from_naive_utc_and_offset(dt, Utc)))
            .map_err(|source| FormatError {
                text: text.to_owned(),
                source: Some(source),
            })
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt)
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Calendar date of the timestamp, computed from the parsed value so that
    /// sloppy server formatting still yields canonical path components.
    pub fn year_month_day(&self) -> DatePath {
        DatePath {
            year: self.0.year(),
            month: self.0.month(),
            day: self.0.day(),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

/// Year, month (1-12) and day (1-31) as used for the storage hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatePath {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DatePath {
    // directory names are fixed width, which keeps lexicographic order == chronological order
    pub fn year_component(&self) -> String {
        format!("{:04}", self.year)
    }

    pub fn month_component(&self) -> String {
        format!("{:02}", self.month)
    }

    pub fn day_component(&self) -> String {
        format!("{:02}", self.day)
    }
}

impl Display for DatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}
