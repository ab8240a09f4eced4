//! # cloud-spanner
//!
//! Client core for Cloud Spanner: a session pool, leader aware request routing,
//! per request ids and read-write transactions that retry on `Aborted`.
//!
//! The transport is anything implementing [`apiv1::rpc::SpannerRpc`], one instance
//! per channel.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cloud_spanner::client::{Client, ClientConfig, Error};
//! use cloud_spanner::mutation::insert;
//! use cloud_spanner::statement::Statement;
//!
//! async fn run(channels: Vec<Arc<dyn SpannerRpc>>) -> Result<(), Error> {
//!     const DATABASE: &str = "projects/local-project/instances/test-instance/databases/local-database";
//!     let client = Client::new(DATABASE, channels, ClientConfig::default()).await?;
//!
//!     let mutation = insert("Guild", &["GuildId", "OwnerUserID"], &[&"guildId", &"ownerId"]);
//!     let commit_result = client.apply(vec![mutation]).await?;
//!
//!     let mut tx = client.single().await?;
//!     let mut iter = tx.query(Statement::new("SELECT GuildId FROM Guild")).await?;
//!     while let Some(row) = iter.next().await? {
//!         let guild_id = row.column_by_name::<String>("GuildId");
//!     }
//!
//!     let (commit_result, updated) = client
//!         .read_write_transaction(|tx| {
//!             Box::pin(async move {
//!                 let updated = tx.update(Statement::new("UPDATE Guild SET OwnerUserID = 'x' WHERE TRUE")).await?;
//!                 Ok::<_, Error>(updated)
//!             })
//!         })
//!         .await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
pub mod apiv1;
pub mod client;
pub mod key;
pub mod mutation;
pub mod reader;
pub mod request_id;
pub mod retry;
pub mod routing;
pub mod row;
pub mod session;
pub mod statement;
pub mod transaction;
pub mod transaction_manager;
pub mod transaction_ro;
pub mod transaction_rw;
pub mod value;
