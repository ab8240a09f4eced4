use std::sync::Arc;

use crate::client::Error;
use crate::session::{ManagedSession, SessionManager};
use crate::transaction::CallOptions;
use crate::transaction_rw::ReadWriteTransaction;

/// TransactionManager keeps one session for a series of read-write transactions,
/// so that a hand written retry loop keeps the lock priority earned by the
/// aborted attempts.
///
/// # Example
///
/// ```rust,ignore
/// use cloud_spanner::client::{Client, Error};
/// use cloud_spanner::retry::TransactionRetry;
///
/// async fn example(client: Client) -> Result<i64, Error> {
///     let mut tm = client.transaction_manager().await?;
///     let mut retry = TransactionRetry::new();
///     loop {
///         let tx = tm.begin_read_write_transaction().await?;
///         let result = tx.update(Statement::new("UPDATE Guild SET Level = 2 WHERE TRUE")).await;
///         match tx.end(result.map_err(Error::from), None).await {
///             Ok((_, count)) => return Ok(count),
///             Err(err) => retry.next(err).await?,
///         }
///     }
/// }
/// ```
pub struct TransactionManager {
    sessions: Arc<SessionManager>,
    session: Option<ManagedSession>,
    transaction: Option<ReadWriteTransaction>,
}

impl TransactionManager {
    pub(crate) fn new(sessions: Arc<SessionManager>, session: ManagedSession) -> Self {
        Self {
            sessions,
            session: Some(session),
            transaction: None,
        }
    }

    /// The transaction begun last, if any.
    pub fn transaction(&mut self) -> Option<&mut ReadWriteTransaction> {
        self.transaction.as_mut()
    }

    pub async fn begin_read_write_transaction(&mut self) -> Result<&mut ReadWriteTransaction, Error> {
        self.begin_read_write_transaction_with_options(CallOptions::default(), None)
            .await
    }

    /// Begins a new transaction on the session of the previous one. The session is
    /// replaced when the server no longer knows it.
    pub async fn begin_read_write_transaction_with_options(
        &mut self,
        options: CallOptions,
        transaction_tag: Option<String>,
    ) -> Result<&mut ReadWriteTransaction, Error> {
        let previous = match self.transaction.take() {
            Some(mut tx) => tx.take_session(),
            None => None,
        };
        let session = match previous.or_else(|| self.session.take()) {
            Some(session) if session.is_valid() => session,
            other => {
                drop(other);
                self.sessions.get().await?
            }
        };

        match ReadWriteTransaction::begin(session, options, transaction_tag).await {
            Ok(tx) => Ok(self.transaction.insert(tx)),
            Err(e) => {
                // kept for the next attempt
                self.session = Some(e.session);
                Err(e.status.into())
            }
        }
    }
}
