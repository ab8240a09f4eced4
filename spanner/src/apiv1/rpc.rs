//! Messages and the transport seam of the Spanner data API.
//!
//! The structs below mirror the service messages one to one. Encoding them on the wire
//! is the job of the [`SpannerRpc`] implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use prost_types::{ListValue, Timestamp, Value};

use cloud_gax::grpc::{Request, Status};

use crate::value::TimestampBound;

pub type TransactionId = Vec<u8>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub creator_role: String,
    pub create_time: Option<Timestamp>,
}

#[derive(Clone, Debug, Default)]
pub struct CreateSessionRequest {
    pub database: String,
    pub session: Option<Session>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchCreateSessionsRequest {
    pub database: String,
    pub session_template: Option<Session>,
    pub session_count: i32,
}

#[derive(Clone, Debug, Default)]
pub struct BatchCreateSessionsResponse {
    pub session: Vec<Session>,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteSessionRequest {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Unspecified,
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub priority: Priority,
    pub request_tag: String,
    pub transaction_tag: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransactionMode {
    ReadWrite,
    PartitionedDml,
    ReadOnly {
        timestamp_bound: TimestampBound,
        return_read_timestamp: bool,
    },
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionOptions {
    pub mode: TransactionMode,
}

impl TransactionOptions {
    pub fn read_write() -> Self {
        Self {
            mode: TransactionMode::ReadWrite,
        }
    }

    pub fn partitioned_dml() -> Self {
        Self {
            mode: TransactionMode::PartitionedDml,
        }
    }

    pub fn read_only(timestamp_bound: TimestampBound, return_read_timestamp: bool) -> Self {
        Self {
            mode: TransactionMode::ReadOnly {
                timestamp_bound,
                return_read_timestamp,
            },
        }
    }
}

/// Selects the transaction a read, query or DML statement runs in.
#[derive(Clone, Debug, PartialEq)]
pub enum TransactionSelector {
    /// Run in a temporary transaction that ends with the request.
    SingleUse(TransactionOptions),
    /// Begin a new transaction with the request. The id is returned in the
    /// result set metadata.
    Begin(TransactionOptions),
    /// Run in a previously begun transaction. `mode` is the mode it was begun with;
    /// only the id goes on the wire.
    Id(TransactionId, TransactionMode),
}

impl TransactionSelector {
    pub fn mode(&self) -> &TransactionMode {
        match self {
            TransactionSelector::SingleUse(options) | TransactionSelector::Begin(options) => &options.mode,
            TransactionSelector::Id(_, mode) => mode,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub read_timestamp: Option<Timestamp>,
}

#[derive(Clone, Debug)]
pub struct BeginTransactionRequest {
    pub session: String,
    pub options: TransactionOptions,
    pub request_options: Option<RequestOptions>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Field {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetMetadata {
    pub row_type: Vec<Field>,
    /// Set when the request began a transaction inline.
    pub transaction: Option<Transaction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowCount {
    Exact(i64),
    LowerBound(i64),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetStats {
    pub row_count: Option<RowCount>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub metadata: Option<ResultSetMetadata>,
    pub rows: Vec<ListValue>,
    pub stats: Option<ResultSetStats>,
}

/// A chunk of a streamed result. `metadata` is only sent with the first chunk and
/// `stats` only with the last one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialResultSet {
    pub metadata: Option<ResultSetMetadata>,
    pub rows: Vec<ListValue>,
    pub stats: Option<ResultSetStats>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteSqlRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub sql: String,
    pub params: BTreeMap<String, Value>,
    pub seqno: i64,
    pub request_options: Option<RequestOptions>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchStatement {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteBatchDmlRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub statements: Vec<BatchStatement>,
    pub seqno: i64,
    pub request_options: Option<RequestOptions>,
}

/// Error status embedded in a batch DML response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteBatchDmlResponse {
    pub result_sets: Vec<ResultSet>,
    pub status: Option<RpcStatus>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyRangeStart {
    Closed(ListValue),
    Open(ListValue),
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyRangeEnd {
    Closed(ListValue),
    Open(ListValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyRange {
    pub start: KeyRangeStart,
    pub end: KeyRangeEnd,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeySet {
    pub keys: Vec<ListValue>,
    pub ranges: Vec<KeyRange>,
    pub all: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ReadRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub key_set: KeySet,
    pub limit: i64,
    pub request_options: Option<RequestOptions>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Write {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<ListValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Insert(Write),
    Update(Write),
    InsertOrUpdate(Write),
    Replace(Write),
    Delete { table: String, key_set: KeySet },
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommitTransaction {
    TransactionId(TransactionId),
    SingleUse(TransactionOptions),
}

#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub session: String,
    pub transaction: CommitTransaction,
    pub mutations: Vec<Mutation>,
    pub return_commit_stats: bool,
    pub request_options: Option<RequestOptions>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitStats {
    pub mutation_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitResponse {
    pub commit_timestamp: Option<Timestamp>,
    pub commit_stats: Option<CommitStats>,
}

#[derive(Clone, Debug, Default)]
pub struct RollbackRequest {
    pub session: String,
    pub transaction_id: TransactionId,
}

/// Server stream of partial result sets.
#[async_trait]
pub trait PartialResultSetStream: Send {
    /// Returns the next chunk, or `None` once the stream is exhausted.
    async fn message(&mut self) -> Result<Option<PartialResultSet>, Status>;
}

pub type Streaming = Box<dyn PartialResultSetStream>;

/// The RPC surface of the data API.
///
/// Every request carries its routing and request-id headers in the request
/// metadata. Implementations are shared between tasks, so all methods take `&self`.
#[async_trait]
pub trait SpannerRpc: Send + Sync {
    async fn create_session(&self, req: Request<CreateSessionRequest>) -> Result<Session, Status>;

    async fn batch_create_sessions(
        &self,
        req: Request<BatchCreateSessionsRequest>,
    ) -> Result<BatchCreateSessionsResponse, Status>;

    async fn delete_session(&self, req: Request<DeleteSessionRequest>) -> Result<(), Status>;

    async fn execute_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<ResultSet, Status>;

    async fn execute_streaming_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<Streaming, Status>;

    async fn execute_batch_dml(&self, req: Request<ExecuteBatchDmlRequest>) -> Result<ExecuteBatchDmlResponse, Status>;

    async fn streaming_read(&self, req: Request<ReadRequest>) -> Result<Streaming, Status>;

    async fn begin_transaction(&self, req: Request<BeginTransactionRequest>) -> Result<Transaction, Status>;

    async fn commit(&self, req: Request<CommitRequest>) -> Result<CommitResponse, Status>;

    async fn rollback(&self, req: Request<RollbackRequest>) -> Result<(), Status>;
}
