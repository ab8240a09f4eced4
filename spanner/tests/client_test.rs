use std::time::Duration;

use serial_test::serial;

use cloud_gax::grpc::{Code, Status};
use cloud_spanner::apiv1::rpc::{CommitTransaction, TransactionOptions};
use cloud_spanner::client::{ApplyOptions, ClientConfig, Error, ReadOnlyTransactionOption};
use cloud_spanner::key::Key;
use cloud_spanner::mutation::insert;
use cloud_spanner::retry::TransactionRetry;
use cloud_spanner::session::SessionError;
use cloud_spanner::statement::Statement;
use cloud_spanner::transaction_rw::CommitOptions;
use cloud_spanner::value::TimestampBound;

mod common;
use common::*;

#[ctor::ctor]
fn init() {
    let filter = tracing_subscriber::filter::EnvFilter::from_default_env()
        .add_directive("cloud_spanner=trace".parse().unwrap());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn config(min_opened: usize, max_opened: usize) -> ClientConfig {
    ClientConfig {
        session_config: session_config(min_opened, max_opened),
        ..Default::default()
    }
}

fn route(call: &Call) -> Option<&str> {
    call.route_to_leader.as_deref()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_leader_routing_headers() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;
    assert_eq!(route(&rpc.calls("batch_create_sessions")[0]), Some("true"));

    let mut tx = client.single().await.unwrap();
    let mut iter = tx.query(Statement::new("SELECT Value FROM Guild")).await.unwrap();
    while iter.next().await.unwrap().is_some() {}
    drop(tx);
    assert_eq!(route(&rpc.calls("execute_streaming_sql")[0]), Some("false"));

    client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                tx.update(Statement::new("UPDATE Guild SET Level = 1 WHERE TRUE"))
                    .await?;
                Ok::<(), Error>(())
            })
        })
        .await
        .unwrap();
    assert_eq!(route(&rpc.calls("execute_sql")[0]), Some("true"));
    assert_eq!(route(&rpc.calls("commit")[0]), Some("true"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_leader_routing_disabled() {
    let rpc = FakeSpanner::new();
    let config = ClientConfig {
        disable_route_to_leader: true,
        ..config(1, 4)
    };
    let client = create_client(&rpc, config).await;
    client
        .apply(vec![insert("Guild", &["GuildId"], &[&"g1"])])
        .await
        .unwrap();

    let calls = rpc.state.lock().calls.clone();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|c| c.route_to_leader.is_none()));
    assert!(calls.iter().all(|c| c.request_id.is_some()));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_single_read_with_staleness() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;

    let mut tx = client
        .single_with_timestamp_bound(TimestampBound::exact_staleness(Duration::from_secs(10)))
        .await
        .unwrap();
    let row = tx
        .read_row("Guild", &["GuildId"], Key::one("g1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.column_by_name::<String>("GuildId").unwrap(), "a");
    assert!(tx.transaction_id().is_none());
    assert_eq!(client.session_status().in_use, 1);
    drop(tx);
    assert_eq!(client.session_status().in_use, 0);

    let reads = rpc.calls("streaming_read");
    assert_eq!(reads.len(), 1);
    assert_eq!(route(&reads[0]), Some("false"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_read_only_transaction() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;

    let option = ReadOnlyTransactionOption {
        timestamp_bound: TimestampBound::max_staleness(Duration::from_secs(5)),
        ..Default::default()
    };
    let mut tx = client.read_only_transaction_with_option(option).await.unwrap();
    assert!(tx.read_timestamp().is_some());
    let id = tx.transaction_id().cloned().unwrap();

    for _ in 0..2 {
        let mut iter = tx.query(Statement::new("SELECT Value FROM Guild")).await.unwrap();
        let mut count = 0;
        while iter.next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
    assert_eq!(tx.transaction_id(), Some(&id));

    let begins = rpc.calls("begin_transaction");
    assert_eq!(begins.len(), 1);
    assert_eq!(route(&begins[0]), Some("false"));
    assert!(rpc
        .calls("execute_streaming_sql")
        .iter()
        .all(|c| route(c) == Some("false")));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_apply_at_least_once() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;
    rpc.fail_next("commit", Status::aborted("transaction was aborted"));

    let option = ApplyOptions {
        commit_options: CommitOptions {
            return_commit_stats: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = client
        .apply_at_least_once_with_option(
            vec![insert("Guild", &["GuildId"], &[&"g1"]), insert("Guild", &["GuildId"], &[&"g2"])],
            option,
        )
        .await
        .unwrap();
    assert!(result.timestamp.is_some());
    assert_eq!(result.mutation_count, Some(2));

    let commits = rpc.commits();
    assert_eq!(commits.len(), 2);
    assert!(commits
        .iter()
        .all(|c| c.transaction == CommitTransaction::SingleUse(TransactionOptions::read_write())));
    assert_eq!(commits[0].session, commits[1].session);
    assert_eq!(client.session_status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_partitioned_update() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;
    rpc.fail_next("execute_sql", Status::aborted("transaction was aborted"));

    let count = client
        .partitioned_update(Statement::new("UPDATE Guild SET Level = 1 WHERE TRUE"))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let begins = rpc.calls("begin_transaction");
    assert_eq!(begins.len(), 2);
    assert!(begins.iter().all(|c| route(c) == Some("true")));
    assert!(rpc.commits().is_empty());
    assert_eq!(client.session_status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_transaction_manager() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;
    rpc.fail_next("commit", Status::aborted("transaction was aborted"));

    let mut tm = client.transaction_manager().await.unwrap();
    assert!(tm.transaction().is_none());
    let mut retry = TransactionRetry::new();
    let mut attempts = 0;
    let count = loop {
        attempts += 1;
        let tx = tm.begin_read_write_transaction().await.unwrap();
        let result = tx
            .update(Statement::new("UPDATE Guild SET Level = 1 WHERE TRUE"))
            .await
            .map_err(Error::from);
        match tx.end(result, None).await {
            Ok((_, count)) => break count,
            Err(err) => retry.next(err).await.unwrap(),
        }
    };
    assert_eq!(count, 1);
    assert_eq!(attempts, 2);
    assert!(tm.transaction().is_some());

    let commits = rpc.commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].session, commits[1].session);
    assert_ne!(commits[0].transaction, commits[1].transaction);
    assert_eq!(rpc.calls("begin_transaction").len(), 2);
    assert!(rpc.calls("rollback").is_empty());

    drop(tm);
    assert_eq!(client.session_status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_begin_read_write_transaction_rollback() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(1, 4)).await;

    let mut tx = client.begin_read_write_transaction().await.unwrap();
    assert!(tx.transaction_id().is_some());
    let result: Result<(), Error> = Err(Status::failed_precondition("row is missing").into());
    match tx.end(result, None).await {
        Err(Error::GRPC(status)) => assert_eq!(status.code(), Code::FailedPrecondition),
        other => panic!("unexpected result {:?}", other.map(|r| r.0)),
    }
    assert_eq!(rpc.calls("rollback").len(), 1);
    assert!(rpc.commits().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_invalid_config() {
    let rpc = FakeSpanner::new();
    let channels: Vec<std::sync::Arc<dyn cloud_spanner::apiv1::rpc::SpannerRpc>> = vec![rpc.clone()];
    match cloud_spanner::client::Client::new(DATABASE, channels, config(5, 4)).await {
        Err(Error::InvalidConfig(_)) => {}
        Err(e) => panic!("unexpected error {e:?}"),
        Ok(_) => panic!("must be rejected"),
    }
    match cloud_spanner::client::Client::new(DATABASE, vec![], config(1, 4)).await {
        Err(Error::InvalidConfig(_)) => {}
        Err(e) => panic!("unexpected error {e:?}"),
        Ok(_) => panic!("must be rejected"),
    }
    assert!(rpc.state.lock().calls.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_close() {
    let rpc = FakeSpanner::new();
    let client = create_client(&rpc, config(2, 4)).await;
    let sessions = client.session_manager().clone();
    client.close().await;
    assert!(sessions.is_closed());
    assert_eq!(rpc.deleted(), 2);
    assert!(matches!(sessions.get().await, Err(SessionError::PoolClosed)));
}
