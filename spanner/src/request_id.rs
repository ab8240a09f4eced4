//! Structured request ids sent with every RPC as `x-goog-spanner-request-id`.
//!
//! An id is `version.process_id.client_id.channel_id.request_number.attempt`. The
//! process id and the client/channel counters are shared by every client in the
//! process. The request number is per client and the attempt counts retries of one
//! logical request.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{const_mutex, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cloud_gax::grpc::metadata::{Ascii, MetadataValue};
use cloud_gax::grpc::Status;

pub const REQUEST_ID_HEADER: &str = "x-goog-spanner-request-id";
pub const REQUEST_ID_VERSION: u32 = 1;

static PROCESS_ID: Mutex<Option<String>> = const_mutex(None);
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

fn format_process_id(value: u64) -> String {
    format!("{value:016x}")
}

/// Returns the process id, generating a random one on first use.
pub fn process_id() -> String {
    PROCESS_ID
        .lock()
        .get_or_insert_with(|| format_process_id(rand::random()))
        .clone()
}

/// Initializes the process id from a seeded generator so that ids are reproducible.
/// Has no effect once the process id exists; the effective id is returned.
pub fn init_process_id(seed: u64) -> String {
    PROCESS_ID
        .lock()
        .get_or_insert_with(|| format_process_id(StdRng::seed_from_u64(seed).gen()))
        .clone()
}

pub(crate) fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst) + 1
}

pub(crate) fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// Clears the process id and the client/channel counters.
#[doc(hidden)]
pub fn reset_for_testing() {
    *PROCESS_ID.lock() = None;
    NEXT_CLIENT_ID.store(0, Ordering::SeqCst);
    NEXT_CHANNEL_ID.store(0, Ordering::SeqCst);
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    version: u32,
    process_id: String,
    client_id: u64,
    channel_id: u64,
    request_number: u64,
    attempt: u32,
}

impl RequestId {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn request_number(&self) -> u64 {
        self.request_number
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    /// The same logical request, one attempt later.
    pub fn next_attempt(mut self) -> Self {
        self.increment_attempt();
        self
    }

    /// The same logical request sent on another channel.
    pub fn on_channel(mut self, channel_id: u64) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Reads the request id attached to an error returned by this crate.
    pub fn from_status(status: &Status) -> Option<RequestId> {
        status
            .metadata()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub(crate) fn attach_to(&self, mut status: Status) -> Status {
        if let Ok(value) = MetadataValue::<Ascii>::try_from(self.to_string()) {
            status.metadata_mut().insert(REQUEST_ID_HEADER, value);
        }
        status
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.version, self.process_id, self.client_id, self.channel_id, self.request_number, self.attempt
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid request id: {0}")]
pub struct ParseRequestIdError(String);

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRequestIdError(s.to_string());
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 6 || parts[1].is_empty() {
            return Err(err());
        }
        Ok(RequestId {
            version: parts[0].parse().map_err(|_| err())?,
            process_id: parts[1].to_string(),
            client_id: parts[2].parse().map_err(|_| err())?,
            channel_id: parts[3].parse().map_err(|_| err())?,
            request_number: parts[4].parse().map_err(|_| err())?,
            attempt: parts[5].parse().map_err(|_| err())?,
        })
    }
}

/// Hands out request ids for one client.
#[derive(Debug)]
pub struct RequestIdGenerator {
    process_id: String,
    client_id: u64,
    next_request_number: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            process_id: process_id(),
            client_id: next_client_id(),
            next_request_number: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Returns the id of a new logical request sent on `channel_id`.
    pub fn next(&self, channel_id: u64) -> RequestId {
        RequestId {
            version: REQUEST_ID_VERSION,
            process_id: self.process_id.clone(),
            client_id: self.client_id,
            channel_id,
            request_number: self.next_request_number.fetch_add(1, Ordering::SeqCst) + 1,
            attempt: 1,
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
