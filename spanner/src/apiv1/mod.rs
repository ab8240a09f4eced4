pub mod conn_pool;
pub mod rpc;
pub mod spanner_client;

#[cfg(test)]
pub(crate) mod fake;
