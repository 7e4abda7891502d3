//! Time helpers for chat records and message timestamps.

use chrono::{SecondsFormat, Utc};

/// Current time as RFC 3339 with millisecond precision, the format stored in
/// `createdAt` / `updatedAt`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
