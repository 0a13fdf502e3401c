//! Timestamp helpers. Timestamps are stored as RFC 3339 text.

use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};

pub(crate) fn to_sql(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn to_sql_opt(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(to_sql)
}

pub(crate) fn parse(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field: "timestamp",
            value: value.to_string(),
        })
}

pub(crate) fn parse_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse).transpose()
}
