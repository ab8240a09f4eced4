use std::ops::{Deref, DerefMut};

use time::OffsetDateTime;

use cloud_gax::grpc::Status;

use crate::apiv1::rpc::{BeginTransactionRequest, TransactionOptions};
use crate::session::ManagedSession;
use crate::transaction::{CallOptions, Transaction, TransactionState};
use crate::value::{to_offset_date_time, TimestampBound};

/// ReadOnlyTransaction provides a snapshot transaction with guaranteed
/// consistency across reads, but does not allow writes. Read-only transactions
/// can be configured to read at timestamps in the past.
///
/// Read-only transactions do not take locks. Instead, they work by choosing a
/// Cloud Spanner timestamp, then executing all reads at that timestamp. Since
/// they do not acquire locks, they do not block concurrent read-write
/// transactions.
///
/// Unlike locking read-write transactions, read-only transactions never abort.
/// They can fail if the chosen read timestamp is garbage collected; however, the
/// default garbage collection policy is generous enough that most applications
/// do not need to worry about this in practice.
pub struct ReadOnlyTransaction {
    base_tx: Transaction,
    pub rts: Option<OffsetDateTime>,
}

impl Deref for ReadOnlyTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.base_tx
    }
}

impl DerefMut for ReadOnlyTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base_tx
    }
}

impl ReadOnlyTransaction {
    /// Every read or query runs in its own single-use transaction.
    pub fn single(session: ManagedSession, tb: TimestampBound) -> ReadOnlyTransaction {
        ReadOnlyTransaction {
            base_tx: Transaction::new(
                session,
                TransactionState::SingleUse(TransactionOptions::read_only(tb, false)),
                None,
            ),
            rts: None,
        }
    }

    /// begin starts a snapshot read-only Transaction on Cloud Spanner.
    pub async fn begin(
        mut session: ManagedSession,
        tb: TimestampBound,
        options: CallOptions,
    ) -> Result<ReadOnlyTransaction, Status> {
        let tx_options = TransactionOptions::read_only(tb, true);
        let request = BeginTransactionRequest {
            session: session.session.name.to_string(),
            options: tx_options.clone(),
            request_options: Transaction::create_request_options(options.priority, None, None),
        };

        let result = session.spanner_client.begin_transaction(request, options.retry).await;
        let tx = session.invalidate_if_needed(result).await?;
        let rts = tx.read_timestamp.and_then(to_offset_date_time);
        Ok(ReadOnlyTransaction {
            base_tx: Transaction::new(session, TransactionState::Active(tx.id, tx_options.mode), None),
            rts,
        })
    }

    /// The timestamp the snapshot is read at, for transactions begun explicitly.
    pub fn read_timestamp(&self) -> Option<OffsetDateTime> {
        self.rts
    }
}
