use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cloud_gax::grpc::{Code, Status};
use cloud_gax::retry::{invoke_fn, TryAs};

use crate::apiv1::conn_pool::ConnectionManager;
use crate::apiv1::rpc::{CommitTransaction, Mutation, SpannerRpc, TransactionOptions};
use crate::request_id::{RequestId, RequestIdGenerator};
use crate::retry::TransactionRetrySetting;
use crate::routing::LeaderRoutingPolicy;
use crate::session::{ManagedSession, PoolStatus, SessionConfig, SessionError, SessionManager};
use crate::statement::Statement;
use crate::transaction::{CallOptions, QueryOptions};
use crate::transaction_manager::TransactionManager;
use crate::transaction_ro::ReadOnlyTransaction;
use crate::transaction_rw::{commit, CommitOptions, ReadWriteTransaction};
use crate::value::{CommitResult, TimestampBound};

#[derive(Clone, Default)]
pub struct PartitionedUpdateOption {
    pub begin_options: CallOptions,
    pub query_options: Option<QueryOptions>,
    pub transaction_retry_setting: Option<TransactionRetrySetting>,
}

#[derive(Clone)]
pub struct ReadOnlyTransactionOption {
    pub timestamp_bound: TimestampBound,
    pub call_options: CallOptions,
}

impl Default for ReadOnlyTransactionOption {
    fn default() -> Self {
        ReadOnlyTransactionOption {
            timestamp_bound: TimestampBound::strong_read(),
            call_options: CallOptions::default(),
        }
    }
}

#[derive(Clone)]
pub struct ReadWriteTransactionOption {
    /// Begin the transaction with the first statement instead of a separate
    /// BeginTransaction call.
    pub begin_inline: bool,
    pub begin_options: CallOptions,
    pub commit_options: CommitOptions,
    pub transaction_retry_setting: Option<TransactionRetrySetting>,
    pub transaction_tag: Option<String>,
}

impl Default for ReadWriteTransactionOption {
    fn default() -> Self {
        ReadWriteTransactionOption {
            begin_inline: true,
            begin_options: CallOptions::default(),
            commit_options: CommitOptions::default(),
            transaction_retry_setting: None,
            transaction_tag: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub transaction_retry_setting: Option<TransactionRetrySetting>,
    pub commit_options: CommitOptions,
    pub transaction_tag: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Session config
    pub session_config: SessionConfig,
    /// Stop sending the leader routing header
    pub disable_route_to_leader: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    GRPC(#[from] Status),

    #[error(transparent)]
    InvalidSession(#[from] SessionError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl TryAs<Status> for Error {
    fn try_as(&self) -> Option<&Status> {
        match self {
            Error::GRPC(e) => Some(e),
            Error::InvalidSession(e) => e.try_as(),
            _ => None,
        }
    }
}

/// A unit of work run inside a read-write transaction.
pub type TxFuture<'tx, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'tx>>;

/// Client is a client for reading and writing data to a Cloud Spanner database.
/// A client is safe to use concurrently, except for its close method.
#[derive(Clone)]
pub struct Client {
    sessions: Arc<SessionManager>,
}

impl Client {
    /// Creates a client on top of the given channels and fills the session pool up to
    /// min_opened.
    pub async fn new(
        database: impl Into<String>,
        channels: Vec<Arc<dyn SpannerRpc>>,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        config.session_config.validate().map_err(Error::InvalidConfig)?;

        let routing = LeaderRoutingPolicy::new(!config.disable_route_to_leader);
        let request_ids = Arc::new(RequestIdGenerator::new());
        let conn_pool =
            ConnectionManager::new(channels, request_ids, routing).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let sessions = SessionManager::new(database, conn_pool, config.session_config).await?;
        Ok(Client { sessions })
    }

    /// Deletes every session. The client must not be used afterwards.
    pub async fn close(self) {
        self.sessions.close().await;
    }

    pub fn session_status(&self) -> PoolStatus {
        self.sessions.status()
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// single provides a read-only snapshot transaction optimized for the case
    /// where only a single read or query is needed. This is more efficient than
    /// using read_only_transaction for a single read or query.
    pub async fn single(&self) -> Result<ReadOnlyTransaction, Error> {
        self.single_with_timestamp_bound(TimestampBound::strong_read()).await
    }

    pub async fn single_with_timestamp_bound(&self, tb: TimestampBound) -> Result<ReadOnlyTransaction, Error> {
        let session = self.get_session().await?;
        Ok(ReadOnlyTransaction::single(session, tb))
    }

    /// read_only_transaction returns a ReadOnlyTransaction that can be used for
    /// multiple reads from the database.
    pub async fn read_only_transaction(&self) -> Result<ReadOnlyTransaction, Error> {
        self.read_only_transaction_with_option(ReadOnlyTransactionOption::default())
            .await
    }

    pub async fn read_only_transaction_with_option(
        &self,
        options: ReadOnlyTransactionOption,
    ) -> Result<ReadOnlyTransaction, Error> {
        let session = self.get_session().await?;
        let result = ReadOnlyTransaction::begin(session, options.timestamp_bound, options.call_options).await?;
        Ok(result)
    }

    /// partitioned_update executes a DML statement in parallel across the database,
    /// using separate, internal transactions that commit independently. The DML
    /// statement must be fully partitionable: it must be expressible as the union
    /// of many statements each of which accesses only a single row of the table.
    /// The statement should also be idempotent, because it may be applied more
    /// than once.
    ///
    /// Returns a lower bound of the number of modified rows.
    pub async fn partitioned_update(&self, stmt: Statement) -> Result<i64, Error> {
        self.partitioned_update_with_option(stmt, PartitionedUpdateOption::default())
            .await
    }

    pub async fn partitioned_update_with_option(
        &self,
        stmt: Statement,
        options: PartitionedUpdateOption,
    ) -> Result<i64, Error> {
        let ro = options
            .transaction_retry_setting
            .unwrap_or_else(|| TransactionRetrySetting::new(vec![Code::Aborted, Code::Internal]));
        let bo = &options.begin_options;
        let qo = &options.query_options.unwrap_or_default();
        let stmt = &stmt;

        invoke_fn(
            None,
            Some(ro),
            move |session: Option<ManagedSession>| async move {
                let session = self
                    .renew_session(session)
                    .await
                    .map_err(|e| (Error::from(e), None))?;
                let mut tx = ReadWriteTransaction::begin_partitioned_dml(session, bo.clone(), None)
                    .await
                    .map_err(|e| (Error::from(e.status), Some(e.session)))?;
                match tx.update_with_option(stmt.clone(), qo.clone()).await {
                    Ok(count) => Ok(count),
                    Err(e) => Err((Error::from(e), tx.take_session())),
                }
            },
            None,
        )
        .await
    }

    /// apply_at_least_once may attempt to apply mutations more than once; if
    /// the mutations are not idempotent, this may lead to a failure being reported
    /// when the mutation was applied more than once. For example, an insert may
    /// fail with ALREADY_EXISTS even though the row did not exist before Apply was
    /// called. For this reason, most users of the library will prefer not to use
    /// this option. However, apply_at_least_once requires only a single RPC, whereas
    /// apply's default replay protection may require an additional RPC. So this
    /// option may be appropriate for latency sensitive and/or high throughput blind
    /// writing.
    pub async fn apply_at_least_once(&self, ms: Vec<Mutation>) -> Result<CommitResult, Error> {
        self.apply_at_least_once_with_option(ms, ApplyOptions::default())
            .await
    }

    pub async fn apply_at_least_once_with_option(
        &self,
        ms: Vec<Mutation>,
        options: ApplyOptions,
    ) -> Result<CommitResult, Error> {
        let ro = options.transaction_retry_setting.unwrap_or_default();
        let co = &options.commit_options;
        let tag = &options.transaction_tag;
        let ms = &ms;

        invoke_fn(
            None,
            Some(ro),
            move |session: Option<ManagedSession>| async move {
                let mut session = self
                    .renew_session(session)
                    .await
                    .map_err(|e| (Error::from(e), None))?;
                let tx = CommitTransaction::SingleUse(TransactionOptions::read_write());
                match commit(&mut session, ms.clone(), tx, co.clone(), None, tag.clone()).await {
                    Ok(response) => Ok(CommitResult::from(response)),
                    Err(e) => Err((Error::from(e), Some(session))),
                }
            },
            None,
        )
        .await
    }

    /// apply applies a list of mutations atomically to the database.
    pub async fn apply(&self, ms: Vec<Mutation>) -> Result<CommitResult, Error> {
        self.apply_with_option(ms, ReadWriteTransactionOption::default())
            .await
    }

    pub async fn apply_with_option(
        &self,
        ms: Vec<Mutation>,
        options: ReadWriteTransactionOption,
    ) -> Result<CommitResult, Error> {
        let result: Result<(CommitResult, ()), Error> = self
            .read_write_transaction_with_option(
                |tx| {
                    tx.buffer_write(ms.to_vec());
                    Box::pin(async { Ok::<(), Error>(()) })
                },
                options,
            )
            .await;
        Ok(result?.0)
    }

    /// Begins a read-write transaction that the caller ends with
    /// ReadWriteTransaction::end. Nothing is retried automatically.
    pub async fn begin_read_write_transaction(&self) -> Result<ReadWriteTransaction, Error> {
        let session = self.get_session().await?;
        ReadWriteTransaction::begin(session, CallOptions::default(), None)
            .await
            .map_err(|e| e.status.into())
    }

    /// Checks out a session that is kept across the transactions begun on the
    /// returned manager.
    pub async fn transaction_manager(&self) -> Result<TransactionManager, Error> {
        let session = self.get_session().await?;
        Ok(TransactionManager::new(self.sessions.clone(), session))
    }

    /// read_write_transaction executes a read-write transaction, with retries as
    /// necessary.
    ///
    /// The function f will be called one or more times. It must not maintain
    /// any state between calls.
    ///
    /// If the transaction cannot be committed or if f returns an ABORTED error,
    /// read_write_transaction will call f again. It will continue to call f until the
    /// transaction can be committed or the retries are exhausted. Every attempt
    /// runs on the same session.
    ///
    /// ```rust,ignore
    /// let (commit_result, count) = client
    ///     .read_write_transaction(|tx| {
    ///         Box::pin(async move {
    ///             let count = tx.update(Statement::new("UPDATE Guild SET Level = 2 WHERE TRUE")).await?;
    ///             tx.buffer_write(vec![insert("Guild", &["GuildId"], &[&"g1"])]);
    ///             Ok::<_, Error>(count)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn read_write_transaction<T, E, F>(&self, f: F) -> Result<(CommitResult, T), E>
    where
        E: TryAs<Status> + From<SessionError> + From<Status>,
        F: for<'tx> Fn(&'tx mut ReadWriteTransaction) -> TxFuture<'tx, T, E>,
    {
        self.read_write_transaction_with_option(f, ReadWriteTransactionOption::default())
            .await
    }

    pub async fn read_write_transaction_with_option<T, E, F>(
        &self,
        f: F,
        options: ReadWriteTransactionOption,
    ) -> Result<(CommitResult, T), E>
    where
        E: TryAs<Status> + From<SessionError> + From<Status>,
        F: for<'tx> Fn(&'tx mut ReadWriteTransaction) -> TxFuture<'tx, T, E>,
    {
        let ro = options.transaction_retry_setting.unwrap_or_default();
        let bo = &options.begin_options;
        let co = &options.commit_options;
        let tag = &options.transaction_tag;
        let begin_inline = options.begin_inline;
        let f = &f;

        let session = self.get_session().await?;
        let request_id = session.spanner_client.next_request_id();

        invoke_fn(
            None,
            Some(ro),
            move |(session, request_id): (Option<ManagedSession>, RequestId)| async move {
                let mut tx = match self
                    .create_read_write_transaction::<E>(session, bo.clone(), tag.clone(), begin_inline)
                    .await
                {
                    Ok(tx) => tx,
                    Err((e, session)) => return Err((e, (session, request_id.next_attempt()))),
                };
                // a renewed session may live on another channel
                let mut request_id = match tx.session.as_ref() {
                    Some(session) => request_id.on_channel(session.spanner_client.channel_id()),
                    None => request_id,
                };
                let result = f(&mut tx).await;
                let finished = tx.finish(result, Some(co.clone()), Some(&mut request_id)).await;
                match finished {
                    Ok(v) => Ok(v),
                    Err((e, session)) => Err((e, (session, request_id.next_attempt()))),
                }
            },
            (Some(session), request_id),
        )
        .await
    }

    async fn get_session(&self) -> Result<ManagedSession, SessionError> {
        self.sessions.get().await
    }

    /// Keeps the session of the previous attempt unless the server dropped it.
    async fn renew_session(&self, session: Option<ManagedSession>) -> Result<ManagedSession, SessionError> {
        match session {
            Some(session) if session.is_valid() => Ok(session),
            other => {
                drop(other);
                self.get_session().await
            }
        }
    }

    async fn create_read_write_transaction<E>(
        &self,
        session: Option<ManagedSession>,
        options: CallOptions,
        transaction_tag: Option<String>,
        begin_inline: bool,
    ) -> Result<ReadWriteTransaction, (E, Option<ManagedSession>)>
    where
        E: TryAs<Status> + From<SessionError> + From<Status>,
    {
        let session = self
            .renew_session(session)
            .await
            .map_err(|e| (E::from(e), None))?;
        if begin_inline {
            return Ok(ReadWriteTransaction::begin_inline(session, transaction_tag));
        }
        ReadWriteTransaction::begin(session, options, transaction_tag)
            .await
            .map_err(|e| (E::from(e.status), Some(e.session)))
    }
}
