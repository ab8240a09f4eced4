//! In-memory `SpannerRpc` used by the unit tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost_types::value::Kind;
use prost_types::{ListValue, Value};

use cloud_gax::grpc::{Request, Status};

use crate::apiv1::rpc::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BeginTransactionRequest, CommitRequest, CommitResponse,
    CreateSessionRequest, DeleteSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest,
    Field, PartialResultSet, PartialResultSetStream, ReadRequest, ResultSet, ResultSetMetadata, ResultSetStats,
    RollbackRequest, RowCount, RpcStatus, Session, SpannerRpc, Streaming, Transaction, TransactionSelector,
};
use crate::request_id::{RequestId, REQUEST_ID_HEADER};
use crate::routing::ROUTE_TO_LEADER_HEADER;

#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub method: &'static str,
    pub route_to_leader: Option<String>,
    pub request_id: Option<RequestId>,
}

#[derive(Default)]
pub(crate) struct State {
    pub next_id: u64,
    pub alive: BTreeSet<String>,
    pub deleted: Vec<String>,
    pub pinged: Vec<String>,
    pub calls: Vec<Call>,
    pub failures: HashMap<&'static str, VecDeque<Status>>,
    /// caps the sessions returned by one BatchCreateSessions call
    pub max_batch: Option<usize>,
    /// sessions the fake is still willing to create in total
    pub session_budget: Option<usize>,
    /// status embedded in the next batch DML response
    pub batch_dml_status: Option<RpcStatus>,
    /// how long a keepalive `SELECT 1` takes
    pub ping_delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct FakeRpc {
    pub state: Mutex<State>,
}

impl FakeRpc {
    pub fn new() -> Arc<FakeRpc> {
        Arc::new(FakeRpc::default())
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

    fn enter<T>(&self, method: &'static str, req: &Request<T>) -> Result<(), Status> {
        let metadata = req.metadata();
        let call = Call {
            method,
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
        match state.failures.get_mut(method).and_then(|q| q.pop_front()) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn check_session(&self, name: &str) -> Result<(), Status> {
        if self.state.lock().alive.contains(name) {
            Ok(())
        } else {
            Err(Status::not_found(format!("Session not found: {name}")))
        }
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

    fn began(&self, selector: &Option<TransactionSelector>) -> Option<Transaction> {
        match selector {
            Some(TransactionSelector::Begin(_)) => {
                let mut state = self.state.lock();
                state.next_id += 1;
                Some(Transaction {
                    id: state.next_id.to_be_bytes().to_vec(),
                    read_timestamp: None,
                })
            }
            _ => None,
        }
    }
}

fn one_row() -> ListValue {
    ListValue {
        values: vec![Value {
            kind: Some(Kind::StringValue("1".to_string())),
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
impl SpannerRpc for FakeRpc {
    async fn create_session(&self, req: Request<CreateSessionRequest>) -> Result<Session, Status> {
        self.enter("create_session", &req)?;
        Ok(self.new_session(&req.get_ref().database))
    }

    async fn batch_create_sessions(
        &self,
        req: Request<BatchCreateSessionsRequest>,
    ) -> Result<BatchCreateSessionsResponse, Status> {
        self.enter("batch_create_sessions", &req)?;
        let req = req.into_inner();
        let mut count = req.session_count as usize;
        {
            let mut state = self.state.lock();
            if let Some(max) = state.max_batch {
                count = count.min(max);
            }
            if let Some(budget) = state.session_budget.as_mut() {
                count = count.min(*budget);
                *budget -= count;
            }
        }
        Ok(BatchCreateSessionsResponse {
            session: (0..count).map(|_| self.new_session(&req.database)).collect(),
        })
    }

    async fn delete_session(&self, req: Request<DeleteSessionRequest>) -> Result<(), Status> {
        self.enter("delete_session", &req)?;
        let name = req.into_inner().name;
        let mut state = self.state.lock();
        if !state.alive.remove(&name) {
            return Err(Status::not_found(format!("Session not found: {name}")));
        }
        state.deleted.push(name);
        Ok(())
    }

    async fn execute_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<ResultSet, Status> {
        self.enter("execute_sql", &req)?;
        let req = req.into_inner();
        self.check_session(&req.session)?;
        if req.sql == "SELECT 1" {
            let delay = self.state.lock().ping_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.state.lock().pinged.push(req.session.clone());
        }
        Ok(ResultSet {
            metadata: Some(ResultSetMetadata {
                row_type: vec![Field { name: "c".to_string() }],
                transaction: self.began(&req.transaction),
            }),
            rows: vec![one_row()],
            stats: Some(ResultSetStats {
                row_count: Some(RowCount::Exact(1)),
            }),
        })
    }

    async fn execute_streaming_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<Streaming, Status> {
        self.enter("execute_streaming_sql", &req)?;
        let req = req.into_inner();
        self.check_session(&req.session)?;
        Ok(Box::new(Chunks(VecDeque::from(vec![PartialResultSet {
            metadata: Some(ResultSetMetadata {
                row_type: vec![Field { name: "c".to_string() }],
                transaction: self.began(&req.transaction),
            }),
            rows: vec![one_row()],
            stats: None,
        }]))))
    }

    async fn execute_batch_dml(&self, req: Request<ExecuteBatchDmlRequest>) -> Result<ExecuteBatchDmlResponse, Status> {
        self.enter("execute_batch_dml", &req)?;
        let req = req.into_inner();
        self.check_session(&req.session)?;
        let began = self.began(&req.transaction);
        let result_sets = req
            .statements
            .iter()
            .enumerate()
            .map(|(i, _)| ResultSet {
                metadata: if i == 0 {
                    Some(ResultSetMetadata {
                        row_type: vec![],
                        transaction: began.clone(),
                    })
                } else {
                    None
                },
                rows: vec![],
                stats: Some(ResultSetStats {
                    row_count: Some(RowCount::Exact(1)),
                }),
            })
            .collect();
        Ok(ExecuteBatchDmlResponse {
            result_sets,
            status: self.state.lock().batch_dml_status.take(),
        })
    }

    async fn streaming_read(&self, req: Request<ReadRequest>) -> Result<Streaming, Status> {
        self.enter("streaming_read", &req)?;
        let req = req.into_inner();
        self.check_session(&req.session)?;
        Ok(Box::new(Chunks(VecDeque::from(vec![PartialResultSet {
            metadata: Some(ResultSetMetadata {
                row_type: req.columns.into_iter().map(|name| Field { name }).collect(),
                transaction: self.began(&req.transaction),
            }),
            rows: vec![one_row()],
            stats: None,
        }]))))
    }

    async fn begin_transaction(&self, req: Request<BeginTransactionRequest>) -> Result<Transaction, Status> {
        self.enter("begin_transaction", &req)?;
        let req = req.into_inner();
        self.check_session(&req.session)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        Ok(Transaction {
            id: state.next_id.to_be_bytes().to_vec(),
            read_timestamp: None,
        })
    }

    async fn commit(&self, req: Request<CommitRequest>) -> Result<CommitResponse, Status> {
        self.enter("commit", &req)?;
        self.check_session(&req.get_ref().session)?;
        Ok(CommitResponse {
            commit_timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            commit_stats: None,
        })
    }

    async fn rollback(&self, req: Request<RollbackRequest>) -> Result<(), Status> {
        self.enter("rollback", &req)?;
        self.check_session(&req.get_ref().session)
    }
}
