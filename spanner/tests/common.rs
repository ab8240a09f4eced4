#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost_types::value::Kind;
use prost_types::{ListValue, Value};

use cloud_gax::grpc::{Request, Status};
use cloud_spanner::apiv1::rpc::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BeginTransactionRequest, CommitRequest, CommitResponse,
    CreateSessionRequest, DeleteSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest,
    Field, PartialResultSet, PartialResultSetStream, ReadRequest, ResultSet, ResultSetMetadata, ResultSetStats,
    RollbackRequest, RowCount, Session, SpannerRpc, Streaming, Transaction, TransactionSelector,
};
use cloud_spanner::client::{Client, ClientConfig};
use cloud_spanner::request_id::{RequestId, REQUEST_ID_HEADER};
use cloud_spanner::routing::ROUTE_TO_LEADER_HEADER;
use cloud_spanner::session::SessionConfig;

pub const DATABASE: &str = "projects/local-project/instances/test-instance/databases/local-database";

#[derive(Clone, Debug)]
pub struct Call {
    pub method: &'static str,
    pub session: String,
    pub route_to_leader: Option<String>,
    pub request_id: Option<RequestId>,
}

#[derive(Default)]
pub struct State {
    next_id: u64,
    pub alive: BTreeSet<String>,
    pub deleted: Vec<String>,
    pub pinged: Vec<String>,
    pub calls: Vec<Call>,
    pub commits: Vec<CommitRequest>,
    failures: HashMap<&'static str, VecDeque<Status>>,
}

/// In-memory Spanner that creates sessions and transactions on demand and can be
/// told to fail the next calls of a method.
#[derive(Default)]
pub struct FakeSpanner {
    pub state: Mutex<State>,
}

impl FakeSpanner {
    pub fn new() -> Arc<FakeSpanner> {
        Arc::new(FakeSpanner::default())
    }

    pub fn fail_next(&self, method: &'static str, status: Status) {
        self.state.lock().failures.entry(method).or_default().push_back(status);
    }

    pub fn calls(&self, method: &str) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn commits(&self) -> Vec<CommitRequest> {
        self.state.lock().commits.clone()
    }

    pub fn alive(&self) -> usize {
        self.state.lock().alive.len()
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().deleted.len()
    }

    /// Forgets the session on the server side.
    pub fn expire(&self, name: &str) {
        self.state.lock().alive.remove(name);
    }

    fn enter<T>(&self, method: &'static str, session: &str, req: &Request<T>) -> Result<(), Status> {
        let metadata = req.metadata();
        let call = Call {
            method,
            session: session.to_string(),
            route_to_leader: metadata
                .get(ROUTE_TO_LEADER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
            request_id: metadata
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        };
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(status) = state.failures.get_mut(method).and_then(|q| q.pop_front()) {
            return Err(status);
        }
        if !session.is_empty() && method != "batch_create_sessions" && !state.alive.contains(session) {
            return Err(Status::not_found(format!("Session not found: {session}")));
        }
        Ok(())
    }

    fn new_session(&self, database: &str) -> Session {
        let mut state = self.state.lock();
        state.next_id += 1;
        let name = format!("{}/sessions/{}", database, state.next_id);
        state.alive.insert(name.clone());
        Session {
            name,
            ..Default::default()
        }
    }

    fn new_transaction(&self) -> Transaction {
        let mut state = self.state.lock();
        state.next_id += 1;
        Transaction {
            id: format!("tx-{}", state.next_id).into_bytes(),
            read_timestamp: Some(prost_types::Timestamp {
                seconds: 1_600_000_000,
                nanos: 0,
            }),
        }
    }

    fn began(&self, selector: &Option<TransactionSelector>) -> Option<Transaction> {
        match selector {
            Some(TransactionSelector::Begin(_)) => Some(self.new_transaction()),
            _ => None,
        }
    }

    fn metadata(&self, selector: &Option<TransactionSelector>, columns: Vec<String>) -> ResultSetMetadata {
        ResultSetMetadata {
            row_type: columns.into_iter().map(|name| Field { name }).collect(),
            transaction: self.began(selector),
        }
    }
}

fn row(value: &str) -> ListValue {
    ListValue {
        values: vec![Value {
            kind: Some(Kind::StringValue(value.to_string())),
        }],
    }
}

struct Chunks(VecDeque<PartialResultSet>);

#[async_trait]
impl PartialResultSetStream for Chunks {
    async fn message(&mut self) -> Result<Option<PartialResultSet>, Status> {
        Ok(self.0.pop_front())
    }
}

#[async_trait]
impl SpannerRpc for FakeSpanner {
    async fn create_session(&self, req: Request<CreateSessionRequest>) -> Result<Session, Status> {
        self.enter("create_session", "", &req)?;
        Ok(self.new_session(&req.get_ref().database))
    }

    async fn batch_create_sessions(
        &self,
        req: Request<BatchCreateSessionsRequest>,
    ) -> Result<BatchCreateSessionsResponse, Status> {
        self.enter("batch_create_sessions", "", &req)?;
        let req = req.into_inner();
        Ok(BatchCreateSessionsResponse {
            session: (0..req.session_count)
                .map(|_| self.new_session(&req.database))
                .collect(),
        })
    }

    async fn delete_session(&self, req: Request<DeleteSessionRequest>) -> Result<(), Status> {
        let name = req.get_ref().name.clone();
        self.enter("delete_session", &name, &req)?;
        let mut state = self.state.lock();
        state.alive.remove(&name);
        state.deleted.push(name);
        Ok(())
    }

    async fn execute_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<ResultSet, Status> {
        let session = req.get_ref().session.clone();
        self.enter("execute_sql", &session, &req)?;
        let req = req.into_inner();
        if req.sql == "SELECT 1" {
            self.state.lock().pinged.push(session);
        }
        Ok(ResultSet {
            metadata: Some(self.metadata(&req.transaction, vec![])),
            rows: vec![],
            stats: Some(ResultSetStats {
                row_count: Some(RowCount::Exact(1)),
            }),
        })
    }

    async fn execute_streaming_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<Streaming, Status> {
        let session = req.get_ref().session.clone();
        self.enter("execute_streaming_sql", &session, &req)?;
        let req = req.into_inner();
        Ok(Box::new(Chunks(VecDeque::from(vec![
            PartialResultSet {
                metadata: Some(self.metadata(&req.transaction, vec!["Value".to_string()])),
                rows: vec![row("a")],
                stats: None,
            },
            PartialResultSet {
                metadata: None,
                rows: vec![row("b")],
                stats: None,
            },
        ]))))
    }

    async fn execute_batch_dml(&self, req: Request<ExecuteBatchDmlRequest>) -> Result<ExecuteBatchDmlResponse, Status> {
        let session = req.get_ref().session.clone();
        self.enter("execute_batch_dml", &session, &req)?;
        let req = req.into_inner();
        let mut metadata = Some(self.metadata(&req.transaction, vec![]));
        let result_sets = req
            .statements
            .iter()
            .map(|_| ResultSet {
                metadata: metadata.take(),
                rows: vec![],
                stats: Some(ResultSetStats {
                    row_count: Some(RowCount::Exact(2)),
                }),
            })
            .collect();
        Ok(ExecuteBatchDmlResponse {
            result_sets,
            status: None,
        })
    }

    async fn streaming_read(&self, req: Request<ReadRequest>) -> Result<Streaming, Status> {
        let session = req.get_ref().session.clone();
        self.enter("streaming_read", &session, &req)?;
        let req = req.into_inner();
        Ok(Box::new(Chunks(VecDeque::from(vec![PartialResultSet {
            metadata: Some(self.metadata(&req.transaction, req.columns.clone())),
            rows: vec![row("a")],
            stats: None,
        }]))))
    }

    async fn begin_transaction(&self, req: Request<BeginTransactionRequest>) -> Result<Transaction, Status> {
        let session = req.get_ref().session.clone();
        self.enter("begin_transaction", &session, &req)?;
        Ok(self.new_transaction())
    }

    async fn commit(&self, req: Request<CommitRequest>) -> Result<CommitResponse, Status> {
        let session = req.get_ref().session.clone();
        self.state.lock().commits.push(req.get_ref().clone());
        self.enter("commit", &session, &req)?;
        let req = req.into_inner();
        Ok(CommitResponse {
            commit_timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            commit_stats: if req.return_commit_stats {
                Some(cloud_spanner::apiv1::rpc::CommitStats {
                    mutation_count: req.mutations.len() as i64,
                })
            } else {
                None
            },
        })
    }

    async fn rollback(&self, req: Request<RollbackRequest>) -> Result<(), Status> {
        let session = req.get_ref().session.clone();
        self.enter("rollback", &session, &req)
    }
}

pub fn session_config(min_opened: usize, max_opened: usize) -> SessionConfig {
    SessionConfig {
        min_opened,
        max_opened,
        ..Default::default()
    }
}

pub async fn create_client(rpc: &Arc<FakeSpanner>, config: ClientConfig) -> Client {
    let channels: Vec<Arc<dyn SpannerRpc>> = vec![rpc.clone()];
    Client::new(DATABASE, channels, config).await.unwrap()
}
