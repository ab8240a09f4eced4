use cloud_gax::grpc::metadata::{MetadataMap, MetadataValue};

use crate::apiv1::rpc::{TransactionMode, TransactionSelector};

pub const ROUTE_TO_LEADER_HEADER: &str = "x-goog-spanner-route-to-leader";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    CreateSession,
    BatchCreateSessions,
    DeleteSession,
    BeginTransaction,
    Commit,
    Rollback,
    ExecuteSql,
    ExecuteBatchDml,
    Read,
}

/// Decides whether a request should be served by the leader replica.
///
/// Writes and anything inside a read-write or partitioned DML transaction go to the
/// leader. Read-only work may be served by the nearest replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaderRoutingPolicy {
    enabled: bool,
}

impl LeaderRoutingPolicy {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `None` means the header is not sent at all.
    pub fn route_to_leader(&self, kind: OperationKind, selector: Option<&TransactionSelector>) -> Option<bool> {
        if !self.enabled {
            return None;
        }
        let leader = match kind {
            OperationKind::CreateSession
            | OperationKind::BatchCreateSessions
            | OperationKind::Commit
            | OperationKind::Rollback
            | OperationKind::ExecuteBatchDml => true,
            OperationKind::DeleteSession => false,
            OperationKind::BeginTransaction | OperationKind::ExecuteSql | OperationKind::Read => match selector {
                // no selector is a single use strong read
                None => false,
                Some(selector) => match selector.mode() {
                    TransactionMode::ReadWrite | TransactionMode::PartitionedDml => true,
                    TransactionMode::ReadOnly { .. } => false,
                },
            },
        };
        Some(leader)
    }

    pub(crate) fn apply(&self, kind: OperationKind, selector: Option<&TransactionSelector>, metadata: &mut MetadataMap) {
        if let Some(leader) = self.route_to_leader(kind, selector) {
            let value = if leader { "true" } else { "false" };
            metadata.insert(ROUTE_TO_LEADER_HEADER, MetadataValue::from_static(value));
        }
    }
}

impl Default for LeaderRoutingPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}
