use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;

use cloud_gax::grpc::{Code, Status};
use cloud_gax::retry::{RetrySetting, TryAs};

use crate::apiv1::rpc::{
    BatchStatement, BeginTransactionRequest, CommitRequest, CommitResponse, CommitTransaction, ExecuteBatchDmlRequest,
    ExecuteSqlRequest, Mutation, ResultSetStats, RollbackRequest, RowCount, TransactionOptions,
};
use crate::request_id::RequestId;
use crate::session::ManagedSession;
use crate::statement::Statement;
use crate::transaction::{CallOptions, QueryOptions, Transaction, TransactionState};
use crate::value::CommitResult;

#[derive(Clone, Default, Debug)]
pub struct CommitOptions {
    pub return_commit_stats: bool,
    pub call_options: CallOptions,
}

/// ReadWriteTransaction provides a locking read-write transaction.
///
/// This type of transaction is the only way to write data into Cloud Spanner;
/// Client::apply, Client::apply_at_least_once, Client::partitioned_update use
/// transactions internally. These transactions rely on pessimistic locking and,
/// if necessary, two-phase commit. Locking read-write transactions may abort,
/// requiring the application to retry. However, the interface exposed by
/// Client::read_write_transaction eliminates the need for applications to write
/// retry loops explicitly.
///
/// Reads performed within a transaction acquire locks on the data being
/// read. Writes can only be done at commit time, after all reads have been
/// completed. Conceptually, a read-write transaction consists of zero or more
/// reads or SQL queries followed by a commit.
///
/// Semantics
///
/// Cloud Spanner can commit the transaction if all read locks it acquired are
/// still valid at commit time, and it is able to acquire write locks for all
/// writes. Cloud Spanner can abort the transaction for any reason. If a commit
/// attempt returns ABORTED, Cloud Spanner guarantees that the transaction has
/// not modified any user data in Cloud Spanner.
///
/// Aborted transactions
///
/// Application code does not need to retry explicitly; read_write_transaction
/// will automatically retry a transaction if an attempt results in an abort.
/// Every attempt runs on the same session, so the lock priority earned by the
/// aborted attempts carries over to the next one.
pub struct ReadWriteTransaction {
    base_tx: Transaction,
    wb: Vec<Mutation>,
}

impl Deref for ReadWriteTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.base_tx
    }
}

impl DerefMut for ReadWriteTransaction {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.base_tx
    }
}

pub struct BeginError {
    pub status: Status,
    pub session: ManagedSession,
}

impl ReadWriteTransaction {
    /// Begins the transaction with an explicit BeginTransaction call.
    pub async fn begin(
        session: ManagedSession,
        options: CallOptions,
        transaction_tag: Option<String>,
    ) -> Result<ReadWriteTransaction, BeginError> {
        ReadWriteTransaction::begin_internal(session, TransactionOptions::read_write(), options, transaction_tag).await
    }

    pub async fn begin_partitioned_dml(
        session: ManagedSession,
        options: CallOptions,
        transaction_tag: Option<String>,
    ) -> Result<ReadWriteTransaction, BeginError> {
        ReadWriteTransaction::begin_internal(session, TransactionOptions::partitioned_dml(), options, transaction_tag)
            .await
    }

    /// The transaction is begun by the first query, read or DML statement.
    /// When only mutations are buffered the commit runs in a single-use transaction.
    pub fn begin_inline(session: ManagedSession, transaction_tag: Option<String>) -> ReadWriteTransaction {
        ReadWriteTransaction {
            base_tx: Transaction::new(
                session,
                TransactionState::Pending(TransactionOptions::read_write()),
                transaction_tag,
            ),
            wb: vec![],
        }
    }

    async fn begin_internal(
        mut session: ManagedSession,
        tx_options: TransactionOptions,
        options: CallOptions,
        transaction_tag: Option<String>,
    ) -> Result<ReadWriteTransaction, BeginError> {
        let request = BeginTransactionRequest {
            session: session.session.name.to_string(),
            options: tx_options.clone(),
            request_options: Transaction::create_request_options(options.priority, None, transaction_tag.clone()),
        };
        let result = session.spanner_client.begin_transaction(request, options.retry).await;
        let tx = match session.invalidate_if_needed(result).await {
            Ok(tx) => tx,
            Err(err) => {
                return Err(BeginError { status: err, session });
            }
        };
        Ok(ReadWriteTransaction {
            base_tx: Transaction::new(session, TransactionState::Active(tx.id, tx_options.mode), transaction_tag),
            wb: vec![],
        })
    }

    /// Buffers the mutations; they are sent with the commit.
    pub fn buffer_write(&mut self, ms: Vec<Mutation>) {
        self.wb.extend(ms)
    }

    pub async fn update(&mut self, stmt: Statement) -> Result<i64, Status> {
        self.update_with_option(stmt, QueryOptions::default()).await
    }

    pub async fn update_with_option(&mut self, stmt: Statement, options: QueryOptions) -> Result<i64, Status> {
        let request = ExecuteSqlRequest {
            session: self.get_session_name(),
            transaction: Some(self.state.selector()),
            sql: stmt.sql,
            params: stmt.params,
            seqno: self.sequence_number.fetch_add(1, Ordering::Relaxed),
            request_options: Transaction::create_request_options(
                options.call_options.priority,
                options.request_tag,
                self.transaction_tag.clone(),
            ),
        };

        let session = self.as_mut_session()?;
        let result = session
            .spanner_client
            .execute_sql(request, options.call_options.retry)
            .await;
        let response = session.invalidate_if_needed(result).await?;
        self.state.resolve_metadata(response.metadata.as_ref());
        Ok(extract_row_count(response.stats))
    }

    pub async fn batch_update(&mut self, stmt: Vec<Statement>) -> Result<Vec<i64>, Status> {
        self.batch_update_with_option(stmt, QueryOptions::default()).await
    }

    pub async fn batch_update_with_option(
        &mut self,
        stmt: Vec<Statement>,
        options: QueryOptions,
    ) -> Result<Vec<i64>, Status> {
        let request = ExecuteBatchDmlRequest {
            session: self.get_session_name(),
            transaction: Some(self.state.selector()),
            seqno: self.sequence_number.fetch_add(1, Ordering::Relaxed),
            request_options: Transaction::create_request_options(
                options.call_options.priority,
                options.request_tag,
                self.transaction_tag.clone(),
            ),
            statements: stmt.into_iter().map(BatchStatement::from).collect(),
        };

        let session = self.as_mut_session()?;
        let result = session
            .spanner_client
            .execute_batch_dml(request, options.call_options.retry)
            .await;
        let response = session.invalidate_if_needed(result).await?;
        if let Some(first) = response.result_sets.first() {
            self.state.resolve_metadata(first.metadata.as_ref());
        }
        Ok(response
            .result_sets
            .into_iter()
            .map(|x| extract_row_count(x.stats))
            .collect())
    }

    /// Commits on success and rolls back on failure. An aborted transaction is
    /// not rolled back; the caller is expected to retry it.
    pub async fn end<S, E>(&mut self, result: Result<S, E>, options: Option<CommitOptions>) -> Result<(CommitResult, S), E>
    where
        E: TryAs<Status> + From<Status>,
    {
        let opt = options.unwrap_or_default();
        match result {
            Ok(success) => {
                let cr = self.commit(opt, None).await?;
                Ok((cr.into(), success))
            }
            Err(err) => {
                if let Some(status) = err.try_as() {
                    // can't rollback. should retry
                    if status.code() == Code::Aborted {
                        return Err(err);
                    }
                }
                let _ = self.rollback(opt.call_options.retry).await;
                Err(err)
            }
        }
    }

    pub(crate) async fn finish<T, E>(
        &mut self,
        result: Result<T, E>,
        options: Option<CommitOptions>,
        request_id: Option<&mut RequestId>,
    ) -> Result<(CommitResult, T), (E, Option<ManagedSession>)>
    where
        E: TryAs<Status> + From<Status>,
    {
        let opt = options.unwrap_or_default();

        match result {
            Ok(s) => match self.commit(opt, request_id).await {
                Ok(c) => Ok((c.into(), s)),
                // Retry the transaction using the same session on ABORT error.
                // Cloud Spanner will create the new transaction with the previous
                // one's wound-wait priority.
                Err(e) => Err((E::from(e), self.take_session())),
            },

            // Rollback the transaction unless the error occurred during the
            // commit. Executing a rollback after a commit has failed will
            // otherwise cause an error. Note that transient errors, such as
            // UNAVAILABLE, are already handled in the gRPC layer and do not show
            // up here.
            Err(err) => {
                let aborted = matches!(err.try_as(), Some(status) if status.code() == Code::Aborted);
                if !aborted {
                    let _ = self.rollback(opt.call_options.retry).await;
                }
                Err((err, self.take_session()))
            }
        }
    }

    pub(crate) async fn commit(
        &mut self,
        options: CommitOptions,
        request_id: Option<&mut RequestId>,
    ) -> Result<CommitResponse, Status> {
        let tx = match self.state.transaction_id() {
            Some(id) => CommitTransaction::TransactionId(id.clone()),
            // never begun: nothing was read, only mutations are sent
            None => CommitTransaction::SingleUse(TransactionOptions::read_write()),
        };
        let mutations = std::mem::take(&mut self.wb);
        let transaction_tag = self.transaction_tag.clone();
        let session = self.as_mut_session()?;
        commit(session, mutations, tx, options, request_id, transaction_tag).await
    }

    pub(crate) async fn rollback(&mut self, retry: Option<RetrySetting>) -> Result<(), Status> {
        let transaction_id = match self.state.transaction_id() {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let request = RollbackRequest {
            transaction_id,
            session: self.get_session_name(),
        };
        let session = self.as_mut_session()?;
        let result = session.spanner_client.rollback(request, retry).await;
        session.invalidate_if_needed(result).await
    }
}

pub(crate) async fn commit(
    session: &mut ManagedSession,
    ms: Vec<Mutation>,
    tx: CommitTransaction,
    commit_options: CommitOptions,
    request_id: Option<&mut RequestId>,
    transaction_tag: Option<String>,
) -> Result<CommitResponse, Status> {
    let request = CommitRequest {
        session: session.session.name.to_string(),
        mutations: ms,
        transaction: tx,
        request_options: Transaction::create_request_options(
            commit_options.call_options.priority,
            None,
            transaction_tag,
        ),
        return_commit_stats: commit_options.return_commit_stats,
    };
    let result = session
        .spanner_client
        .commit(request, commit_options.call_options.retry, request_id)
        .await;
    session.invalidate_if_needed(result).await
}

fn extract_row_count(rs: Option<ResultSetStats>) -> i64 {
    match rs.and_then(|o| o.row_count) {
        Some(RowCount::Exact(v)) => v,
        Some(RowCount::LowerBound(v)) => v,
        None => 0,
    }
}
