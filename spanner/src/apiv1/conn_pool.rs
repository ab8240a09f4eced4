use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::apiv1::rpc::SpannerRpc;
use crate::apiv1::spanner_client::Client;
use crate::request_id::{next_channel_id, RequestIdGenerator};
use crate::routing::LeaderRoutingPolicy;

struct Channel {
    id: u64,
    rpc: Arc<dyn SpannerRpc>,
}

/// Round-robin ring of RPC channels belonging to one client.
pub struct ConnectionManager {
    index: AtomicUsize,
    conns: Vec<Channel>,
    request_ids: Arc<RequestIdGenerator>,
    routing: LeaderRoutingPolicy,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("at least one channel is required")]
    NoChannel,
}

impl ConnectionManager {
    /// Registers every channel under a process-wide channel id.
    pub fn new(
        channels: Vec<Arc<dyn SpannerRpc>>,
        request_ids: Arc<RequestIdGenerator>,
        routing: LeaderRoutingPolicy,
    ) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::NoChannel);
        }
        let conns = channels
            .into_iter()
            .map(|rpc| Channel {
                id: next_channel_id(),
                rpc,
            })
            .collect();
        Ok(ConnectionManager {
            index: AtomicUsize::new(0),
            conns,
            request_ids,
            routing,
        })
    }

    pub fn num(&self) -> usize {
        self.conns.len()
    }

    pub fn request_ids(&self) -> &Arc<RequestIdGenerator> {
        &self.request_ids
    }

    pub fn conn(&self) -> Client {
        let current = self.index.fetch_add(1, Ordering::SeqCst);
        let channel = &self.conns[current % self.conns.len()];
        Client::new(channel.rpc.clone(), channel.id, self.request_ids.clone(), self.routing)
    }
}
