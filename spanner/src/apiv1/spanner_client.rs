use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloud_gax::grpc::metadata::{Ascii, MetadataMap, MetadataValue};
use cloud_gax::grpc::{Code, Request, Status};
use cloud_gax::retry::{CodePredicate, Predicate, RetrySetting};

use crate::apiv1::rpc::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BeginTransactionRequest, CommitRequest, CommitResponse,
    CreateSessionRequest, DeleteSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest,
    ReadRequest, ResultSet, RollbackRequest, Session, SpannerRpc, Streaming, Transaction, TransactionSelector,
};
use crate::request_id::{RequestId, RequestIdGenerator, REQUEST_ID_HEADER};
use crate::routing::{LeaderRoutingPolicy, OperationKind};

pub(crate) fn ping_query_request(session_name: impl Into<String>) -> ExecuteSqlRequest {
    ExecuteSqlRequest {
        session: session_name.into(),
        transaction: None,
        sql: "SELECT 1".to_string(),
        params: Default::default(),
        seqno: 0,
        request_options: None,
    }
}

fn default_setting() -> RetrySetting {
    RetrySetting {
        from_millis: 50,
        max_delay: Some(Duration::from_secs(10)),
        factor: 1u64,
        take: 20,
        jitter: false,
        codes: vec![Code::Unavailable, Code::Unknown],
    }
}

/// A channel to the data API.
///
/// Every call gets the resource prefix, the leader routing header and a request id.
/// Transient `Unavailable`/`Unknown` failures are retried here with the same request
/// number and an increasing attempt.
#[derive(Clone)]
pub struct Client {
    inner: Arc<dyn SpannerRpc>,
    channel_id: u64,
    request_ids: Arc<RequestIdGenerator>,
    routing: LeaderRoutingPolicy,
    metadata: MetadataMap,
}

impl Client {
    /// create new spanner client
    pub fn new(
        inner: Arc<dyn SpannerRpc>,
        channel_id: u64,
        request_ids: Arc<RequestIdGenerator>,
        routing: LeaderRoutingPolicy,
    ) -> Client {
        Client {
            inner,
            channel_id,
            request_ids,
            routing,
            metadata: MetadataMap::new(),
        }
    }

    /// set metadata for request
    pub fn with_metadata(self, metadata: MetadataMap) -> Client {
        Client {
            inner: self.inner,
            channel_id: self.channel_id,
            request_ids: self.request_ids,
            routing: self.routing,
            metadata,
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Allocates the id of a new logical request on this channel.
    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next(self.channel_id)
    }

    fn create_request<T>(
        &self,
        message: T,
        kind: OperationKind,
        selector: Option<&TransactionSelector>,
        request_id: &RequestId,
    ) -> Request<T> {
        let mut request = Request::new(message);
        let target = request.metadata_mut();
        *target = self.metadata.clone();
        self.routing.apply(kind, selector, target);
        match MetadataValue::<Ascii>::try_from(request_id.to_string()) {
            Ok(value) => {
                target.insert(REQUEST_ID_HEADER, value);
            }
            Err(e) => tracing::warn!("invalid request id {}: {:?}", request_id, e),
        }
        request
    }

    async fn invoke<T, R, F, Fut>(
        &self,
        kind: OperationKind,
        selector: Option<TransactionSelector>,
        message: T,
        retry: Option<RetrySetting>,
        request_id: Option<&mut RequestId>,
        call: F,
    ) -> Result<R, Status>
    where
        T: Clone,
        F: Fn(Arc<dyn SpannerRpc>, Request<T>) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        let setting = retry.unwrap_or_else(default_setting);
        let mut strategy = setting.backoff();
        let mut predicate = CodePredicate::new(setting.codes.clone());
        let mut allocated;
        let request_id = match request_id {
            Some(id) => id,
            None => {
                allocated = self.next_request_id();
                &mut allocated
            }
        };
        loop {
            let request = self.create_request(message.clone(), kind, selector.as_ref(), request_id);
            let status = match call(self.inner.clone(), request).await {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };
            if !predicate.should_retry(&status) {
                return Err(request_id.attach_to(status));
            }
            match strategy.next() {
                None => return Err(request_id.attach_to(status)),
                Some(duration) => {
                    tracing::debug!(
                        request_id = %request_id,
                        "retrying {:?} after {:?}: {}",
                        kind,
                        duration,
                        status.message()
                    );
                    tokio::time::sleep(duration).await;
                    request_id.increment_attempt();
                }
            }
        }
    }

    /// create_session creates a new session. A session can be used to perform
    /// transactions that read and/or modify data in a Cloud Spanner database.
    /// Sessions are meant to be reused for many consecutive
    /// transactions.
    ///
    /// Active sessions use additional server resources, so it is a good idea to
    /// delete idle and unneeded sessions. Idle sessions can be kept alive by sending
    /// a trivial SQL query periodically, e.g., "SELECT 1".
    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Session, Status> {
        self.invoke(OperationKind::CreateSession, None, req, retry, None, |rpc, request| async move {
            rpc.create_session(request).await
        })
        .await
    }

    /// batch_create_sessions creates multiple new sessions. The server may return
    /// fewer sessions than requested.
    pub async fn batch_create_sessions(
        &self,
        req: BatchCreateSessionsRequest,
        retry: Option<RetrySetting>,
    ) -> Result<BatchCreateSessionsResponse, Status> {
        self.invoke(
            OperationKind::BatchCreateSessions,
            None,
            req,
            retry,
            None,
            |rpc, request| async move { rpc.batch_create_sessions(request).await },
        )
        .await
    }

    /// delete_session ends a session, releasing server resources associated with it.
    pub async fn delete_session(&self, req: DeleteSessionRequest, retry: Option<RetrySetting>) -> Result<(), Status> {
        self.invoke(OperationKind::DeleteSession, None, req, retry, None, |rpc, request| async move {
            rpc.delete_session(request).await
        })
        .await
    }

    /// execute_sql executes an SQL statement, returning all results in a single reply.
    /// Used for DML and the keepalive query.
    pub async fn execute_sql(&self, req: ExecuteSqlRequest, retry: Option<RetrySetting>) -> Result<ResultSet, Status> {
        let selector = req.transaction.clone();
        self.invoke(OperationKind::ExecuteSql, selector, req, retry, None, |rpc, request| async move {
            rpc.execute_sql(request).await
        })
        .await
    }

    /// execute_streaming_sql is like execute_sql, except it returns the result
    /// set as a stream.
    pub async fn execute_streaming_sql(
        &self,
        req: ExecuteSqlRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Streaming, Status> {
        let selector = req.transaction.clone();
        self.invoke(OperationKind::ExecuteSql, selector, req, retry, None, |rpc, request| async move {
            rpc.execute_streaming_sql(request).await
        })
        .await
    }

    /// execute_batch_dml executes a batch of SQL DML statements. Statements are
    /// executed in sequential order. Execution stops after the first failed
    /// statement; the remaining statements are not executed and the failure is
    /// returned as an error.
    pub async fn execute_batch_dml(
        &self,
        req: ExecuteBatchDmlRequest,
        retry: Option<RetrySetting>,
    ) -> Result<ExecuteBatchDmlResponse, Status> {
        let selector = req.transaction.clone();
        self.invoke(
            OperationKind::ExecuteBatchDml,
            selector,
            req,
            retry,
            None,
            |rpc, request| async move {
                let response = rpc.execute_batch_dml(request).await?;
                match &response.status {
                    Some(status) if status.code != Code::Ok as i32 => {
                        Err(Status::new(Code::from(status.code), status.message.clone()))
                    }
                    _ => Ok(response),
                }
            },
        )
        .await
    }

    /// streaming_read reads rows from the database using key lookups and scans, as a
    /// simple key/value style alternative to execute_streaming_sql.
    pub async fn streaming_read(&self, req: ReadRequest, retry: Option<RetrySetting>) -> Result<Streaming, Status> {
        let selector = req.transaction.clone();
        self.invoke(OperationKind::Read, selector, req, retry, None, |rpc, request| async move {
            rpc.streaming_read(request).await
        })
        .await
    }

    /// begin_transaction begins a new transaction.
    pub async fn begin_transaction(
        &self,
        req: BeginTransactionRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Transaction, Status> {
        let selector = Some(TransactionSelector::Begin(req.options.clone()));
        self.invoke(
            OperationKind::BeginTransaction,
            selector,
            req,
            retry,
            None,
            |rpc, request| async move { rpc.begin_transaction(request).await },
        )
        .await
    }

    /// commit commits a transaction. The request includes the mutations to be
    /// applied to rows in the database.
    ///
    /// `request_id` identifies the logical commit. Pass the same id for every
    /// attempt of one transaction so the server can recognize retries.
    pub async fn commit(
        &self,
        req: CommitRequest,
        retry: Option<RetrySetting>,
        request_id: Option<&mut RequestId>,
    ) -> Result<CommitResponse, Status> {
        self.invoke(OperationKind::Commit, None, req, retry, request_id, |rpc, request| async move {
            rpc.commit(request).await
        })
        .await
    }

    /// rollback rolls back a transaction, releasing any locks it holds.
    pub async fn rollback(&self, req: RollbackRequest, retry: Option<RetrySetting>) -> Result<(), Status> {
        self.invoke(OperationKind::Rollback, None, req, retry, None, |rpc, request| async move {
            rpc.rollback(request).await
        })
        .await
    }
}
