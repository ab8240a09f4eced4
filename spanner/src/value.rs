use std::time::Duration;

use time::OffsetDateTime;

/// TimestampBound defines how Cloud Spanner will choose a timestamp for a
/// single read/query or read-only transaction.
///
/// Strong reads are guaranteed to see the effects of all transactions that
/// have committed before the start of the read. Bounded and exact staleness
/// reads trade that for lower latency and may be served by any replica.
#[derive(Clone, Debug, PartialEq)]
pub enum TimestampBound {
    Strong,
    ExactStaleness(Duration),
    MaxStaleness(Duration),
    MinReadTimestamp(OffsetDateTime),
    ReadTimestamp(OffsetDateTime),
}

impl TimestampBound {
    pub fn strong_read() -> Self {
        TimestampBound::Strong
    }
    pub fn exact_staleness(d: Duration) -> Self {
        TimestampBound::ExactStaleness(d)
    }
    pub fn max_staleness(d: Duration) -> Self {
        TimestampBound::MaxStaleness(d)
    }
    pub fn min_read_timestamp(t: OffsetDateTime) -> Self {
        TimestampBound::MinReadTimestamp(t)
    }
    pub fn read_timestamp(t: OffsetDateTime) -> Self {
        TimestampBound::ReadTimestamp(t)
    }
}

impl Default for TimestampBound {
    fn default() -> Self {
        TimestampBound::Strong
    }
}

/// Result of a successful commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitResult {
    pub timestamp: Option<OffsetDateTime>,
    /// Only set when commit stats were requested.
    pub mutation_count: Option<i64>,
}

impl From<crate::apiv1::rpc::CommitResponse> for CommitResult {
    fn from(response: crate::apiv1::rpc::CommitResponse) -> Self {
        CommitResult {
            timestamp: response.commit_timestamp.and_then(to_offset_date_time),
            mutation_count: response.commit_stats.map(|s| s.mutation_count),
        }
    }
}

pub(crate) fn to_offset_date_time(ts: prost_types::Timestamp) -> Option<OffsetDateTime> {
    let nanos = ts.seconds as i128 * 1_000_000_000 + ts.nanos as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

pub(crate) fn to_timestamp(dt: OffsetDateTime) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.unix_timestamp(),
        nanos: dt.nanosecond() as i32,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::apiv1::rpc::{CommitResponse, CommitStats};
    use crate::value::{to_offset_date_time, to_timestamp, CommitResult, TimestampBound};

    #[test]
    fn test_timestamp_conversion() {
        let dt = datetime!(2024-03-01 12:30:45.123456789 UTC);
        let ts = to_timestamp(dt);
        assert_eq!(ts.seconds, dt.unix_timestamp());
        assert_eq!(ts.nanos, 123456789);
        assert_eq!(to_offset_date_time(ts), Some(dt));
    }

    #[test]
    fn test_commit_result_from_response() {
        let response = CommitResponse {
            commit_timestamp: Some(prost_types::Timestamp { seconds: 10, nanos: 5 }),
            commit_stats: Some(CommitStats { mutation_count: 3 }),
        };
        let result = CommitResult::from(response);
        assert_eq!(result.mutation_count, Some(3));
        assert_eq!(result.timestamp.map(|t| t.unix_timestamp()), Some(10));

        let empty = CommitResult::from(CommitResponse::default());
        assert!(empty.timestamp.is_none());
        assert!(empty.mutation_count.is_none());
    }

    #[test]
    fn test_default_bound_is_strong() {
        assert_eq!(TimestampBound::default(), TimestampBound::strong_read());
    }
}
