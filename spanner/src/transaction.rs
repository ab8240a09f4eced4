use std::sync::atomic::AtomicI64;

use cloud_gax::grpc::Status;
use cloud_gax::retry::RetrySetting;

use crate::apiv1::rpc::{
    ExecuteSqlRequest, Priority, ReadRequest, RequestOptions, ResultSetMetadata, TransactionId, TransactionMode,
    TransactionOptions, TransactionSelector,
};
use crate::key::{Key, KeySet};
use crate::reader::RowIterator;
use crate::row::Row;
use crate::session::ManagedSession;
use crate::statement::Statement;

#[derive(Clone, Default, Debug)]
pub struct CallOptions {
    /// Priority is the RPC priority to use for the operation.
    pub priority: Option<Priority>,
    pub retry: Option<RetrySetting>,
}

#[derive(Clone, Default, Debug)]
pub struct ReadOptions {
    /// The index to use for reading. If non-empty, you can only read columns
    /// that are part of the index key, part of the primary key, or stored in the
    /// index due to a STORING clause in the index definition.
    pub index: String,

    /// The maximum number of rows to read. A limit value less than 1 means no limit.
    pub limit: i64,

    pub call_options: CallOptions,
}

#[derive(Clone, Default, Debug)]
pub struct QueryOptions {
    pub request_tag: Option<String>,
    pub call_options: CallOptions,
}

/// Where a transaction stands with the server.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionState {
    /// Every request runs in its own temporary transaction.
    SingleUse(TransactionOptions),
    /// Not begun yet. The next request begins it inline.
    Pending(TransactionOptions),
    Active(TransactionId, TransactionMode),
}

impl TransactionState {
    pub(crate) fn selector(&self) -> TransactionSelector {
        match self {
            TransactionState::SingleUse(options) => TransactionSelector::SingleUse(options.clone()),
            TransactionState::Pending(options) => TransactionSelector::Begin(options.clone()),
            TransactionState::Active(id, mode) => TransactionSelector::Id(id.clone(), mode.clone()),
        }
    }

    /// Picks up the id of a transaction begun inline.
    pub(crate) fn resolve(&mut self, transaction: Option<&crate::apiv1::rpc::Transaction>) {
        if let TransactionState::Pending(options) = self {
            if let Some(tx) = transaction {
                tracing::trace!("transaction begun inline");
                let mode = options.mode.clone();
                *self = TransactionState::Active(tx.id.clone(), mode);
            }
        }
    }

    pub(crate) fn resolve_metadata(&mut self, metadata: Option<&ResultSetMetadata>) {
        self.resolve(metadata.and_then(|m| m.transaction.as_ref()));
    }

    pub(crate) fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            TransactionState::Active(id, _) => Some(id),
            _ => None,
        }
    }
}

pub struct Transaction {
    pub(crate) session: Option<ManagedSession>,
    pub(crate) sequence_number: AtomicI64,
    pub(crate) state: TransactionState,
    pub(crate) transaction_tag: Option<String>,
}

impl Transaction {
    pub(crate) fn new(session: ManagedSession, state: TransactionState, transaction_tag: Option<String>) -> Self {
        Transaction {
            session: Some(session),
            sequence_number: AtomicI64::new(0),
            state,
            transaction_tag,
        }
    }

    pub(crate) fn create_request_options(
        priority: Option<Priority>,
        request_tag: Option<String>,
        transaction_tag: Option<String>,
    ) -> Option<RequestOptions> {
        if priority.is_none() && request_tag.is_none() && transaction_tag.is_none() {
            return None;
        }
        Some(RequestOptions {
            priority: priority.unwrap_or_default(),
            request_tag: request_tag.unwrap_or_default(),
            transaction_tag: transaction_tag.unwrap_or_default(),
        })
    }

    /// The id of the transaction once it was begun on the server.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.state.transaction_id()
    }

    /// query executes a query against the database. It returns a RowIterator for
    /// retrieving the resulting rows.
    pub async fn query(&mut self, statement: Statement) -> Result<RowIterator, Status> {
        self.query_with_option(statement, QueryOptions::default()).await
    }

    pub async fn query_with_option(&mut self, statement: Statement, options: QueryOptions) -> Result<RowIterator, Status> {
        let request = ExecuteSqlRequest {
            session: self.get_session_name(),
            transaction: Some(self.state.selector()),
            sql: statement.sql,
            params: statement.params,
            seqno: 0,
            request_options: Transaction::create_request_options(
                options.call_options.priority,
                options.request_tag,
                self.transaction_tag.clone(),
            ),
        };
        let session = self.as_mut_session()?;
        let result = session
            .spanner_client
            .execute_streaming_sql(request, options.call_options.retry)
            .await;
        let streaming = session.invalidate_if_needed(result).await?;
        let result = RowIterator::new(streaming).await;
        let reader = session.invalidate_if_needed(result).await?;
        self.state.resolve(reader.transaction());
        Ok(reader)
    }

    /// read returns a RowIterator for reading multiple rows from the database.
    pub async fn read<T, C, K>(&mut self, table: T, columns: &[C], key_set: K) -> Result<RowIterator, Status>
    where
        T: Into<String>,
        C: AsRef<str>,
        K: Into<KeySet>,
    {
        self.read_with_option(table, columns, key_set, ReadOptions::default())
            .await
    }

    pub async fn read_with_option<T, C, K>(
        &mut self,
        table: T,
        columns: &[C],
        key_set: K,
        options: ReadOptions,
    ) -> Result<RowIterator, Status>
    where
        T: Into<String>,
        C: AsRef<str>,
        K: Into<KeySet>,
    {
        let request = ReadRequest {
            session: self.get_session_name(),
            transaction: Some(self.state.selector()),
            table: table.into(),
            index: options.index,
            columns: columns.iter().map(|x| x.as_ref().to_string()).collect(),
            key_set: key_set.into().inner,
            limit: options.limit,
            request_options: Transaction::create_request_options(
                options.call_options.priority,
                None,
                self.transaction_tag.clone(),
            ),
        };

        let session = self.as_mut_session()?;
        let result = session
            .spanner_client
            .streaming_read(request, options.call_options.retry)
            .await;
        let streaming = session.invalidate_if_needed(result).await?;
        let result = RowIterator::new(streaming).await;
        let reader = session.invalidate_if_needed(result).await?;
        self.state.resolve(reader.transaction());
        Ok(reader)
    }

    /// read_row reads a single row from the database.
    pub async fn read_row<T, C>(&mut self, table: T, columns: &[C], key: Key) -> Result<Option<Row>, Status>
    where
        T: Into<String>,
        C: AsRef<str>,
    {
        self.read_row_with_option(table, columns, key, ReadOptions::default())
            .await
    }

    pub async fn read_row_with_option<T, C>(
        &mut self,
        table: T,
        columns: &[C],
        key: Key,
        options: ReadOptions,
    ) -> Result<Option<Row>, Status>
    where
        T: Into<String>,
        C: AsRef<str>,
    {
        let mut reader = self.read_with_option(table, columns, key, options).await?;
        reader.next().await
    }

    pub(crate) fn get_session_name(&self) -> String {
        match self.session.as_ref() {
            Some(session) => session.session.name.to_string(),
            None => String::new(),
        }
    }

    pub(crate) fn as_mut_session(&mut self) -> Result<&mut ManagedSession, Status> {
        self.session
            .as_mut()
            .ok_or_else(|| Status::failed_precondition("transaction has already ended"))
    }

    pub(crate) fn take_session(&mut self) -> Option<ManagedSession> {
        self.session.take()
    }
}

#[cfg(test)]
mod tests {
    use crate::apiv1::rpc::{Transaction, TransactionMode, TransactionOptions, TransactionSelector};
    use crate::transaction::TransactionState;

    #[test]
    fn test_inline_begin_resolves_once() {
        let mut state = TransactionState::Pending(TransactionOptions::read_write());
        assert_eq!(
            state.selector(),
            TransactionSelector::Begin(TransactionOptions::read_write())
        );
        assert!(state.transaction_id().is_none());

        state.resolve(None);
        assert!(state.transaction_id().is_none());

        let first = Transaction {
            id: vec![1],
            read_timestamp: None,
        };
        state.resolve(Some(&first));
        assert_eq!(state.selector(), TransactionSelector::Id(vec![1], TransactionMode::ReadWrite));

        let second = Transaction {
            id: vec![2],
            read_timestamp: None,
        };
        state.resolve(Some(&second));
        assert_eq!(state.transaction_id(), Some(&vec![1]));
    }

    #[test]
    fn test_single_use_never_resolves() {
        let options = TransactionOptions::read_write();
        let mut state = TransactionState::SingleUse(options.clone());
        state.resolve(Some(&Transaction {
            id: vec![1],
            read_timestamp: None,
        }));
        assert_eq!(state, TransactionState::SingleUse(options));
    }
}
