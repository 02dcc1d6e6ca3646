//! Router scenario tests.
//!
//! Routing and aggregation are checked against recording mock backends here; `sqlite` repeats the
//! important ones against real pools.


use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{IsolationLevel, TxOptions};
use crate::config::PoolSettings;
use crate::driver::Driver;
use crate::errors::{Error, Target};
use crate::pools::Router;
use mock::{FAILING_DSN_PREFIX, MockBackend, MockCall};

fn mock_router() -> Router<MockBackend> {
    Router::from_backends(MockBackend::new(), MockBackend::new())
}

#[tokio::test]
async fn test_reads_go_to_replica() {
    let router = mock_router();
    router.replica().set_rows(vec![json!({"id": 1})]);

    let rows = router.read("SELECT * FROM users", vec![]).await.unwrap();
    assert_eq!(rows, vec![json!({"id": 1})]);

    let row = router.read_one("SELECT * FROM users WHERE id = ?", vec![json!(1)]).await;
    assert_eq!(row.target(), Target::Replica);
    assert_eq!(row.into_inner().unwrap(), json!({"id": 1}));

    assert_eq!(
        router.replica().get_calls(),
        vec![
            MockCall::FetchAll("SELECT * FROM users".into()),
            MockCall::FetchOptional("SELECT * FROM users WHERE id = ?".into()),
        ]
    );
    assert!(router.primary().get_calls().is_empty());
}

#[tokio::test]
async fn test_writes_prepares_and_transactions_go_to_primary() {
    let router = mock_router();

    let result = router
        .write("UPDATE users SET name = ? WHERE id = ?", vec![json!("bob"), json!(7)])
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    let statement = router.prepare("SELECT 1").await.unwrap();
    assert_eq!(statement, "SELECT 1");

    let options = TxOptions {
        isolation: IsolationLevel::Serializable,
        read_only: false,
    };
    router.begin().await.unwrap();
    router.begin_with(options).await.unwrap();

    assert_eq!(
        router.primary().get_calls(),
        vec![
            MockCall::Execute("UPDATE users SET name = ? WHERE id = ?".into(), vec![json!("bob"), json!(7)]),
            MockCall::Prepare("SELECT 1".into()),
            MockCall::Begin(TxOptions::default()),
            MockCall::Begin(options),
        ]
    );
    assert!(router.replica().get_calls().is_empty());
}

#[tokio::test]
async fn test_primary_reads_go_to_primary() {
    let router = mock_router();
    router.primary().set_rows(vec![json!("fresh")]);

    let rows = router.read_from_primary("SELECT name FROM users", vec![]).await.unwrap();
    assert_eq!(rows, vec![json!("fresh")]);

    let row = router.read_one_from_primary("SELECT name FROM users", vec![]).await;
    assert_eq!(row.target(), Target::Primary);
    assert_eq!(row.into_inner().unwrap(), json!("fresh"));

    assert!(router.replica().get_calls().is_empty());
}

#[tokio::test]
async fn test_read_one_without_rows_defers_error() {
    let router = mock_router();

    let row = router.read_one("SELECT * FROM users WHERE id = ?", vec![json!(404)]).await;

    let err = row.into_inner().unwrap_err();
    assert!(err.is_row_not_found());
    assert_eq!(err.target(), Some(Target::Replica));
}

#[tokio::test]
async fn test_close_attempts_both_after_primary_failure() {
    let router = mock_router();
    router.primary().fail_close("primary close failed");

    let err = router.close().await.unwrap_err();

    assert_eq!(err.target(), Some(Target::Primary));
    assert!(err.to_string().contains("primary close failed"));
    assert_eq!(router.primary().get_calls(), vec![MockCall::Close]);
    assert_eq!(router.replica().get_calls(), vec![MockCall::Close]);
}

#[tokio::test]
async fn test_close_reports_both_failures() {
    let router = mock_router();
    router.primary().fail_close("primary gone");
    router.replica().fail_close("replica gone");

    let err = router.close().await.unwrap_err();
    match err {
        Error::Both { primary, replica } => {
            assert!(primary.to_string().contains("primary gone"));
            assert!(replica.to_string().contains("replica gone"));
        }
        other => panic!("expected both targets to fail, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_ok_only_when_both_ok() {
    let router = mock_router();
    router.ping().await.unwrap();
    assert_eq!(router.primary().get_calls(), vec![MockCall::Ping]);
    assert_eq!(router.replica().get_calls(), vec![MockCall::Ping]);
}

#[tokio::test]
async fn test_ping_tags_failing_target() {
    let router = mock_router();
    router.primary().fail_ping("primary down");
    let err = router.ping().await.unwrap_err();
    assert_eq!(err.target(), Some(Target::Primary));
    // The replica is still checked
    assert_eq!(router.replica().get_calls(), vec![MockCall::Ping]);

    let router = mock_router();
    router.replica().fail_ping("replica down");
    let err = router.ping().await.unwrap_err();
    assert_eq!(err.target(), Some(Target::Replica));
    assert!(err.to_string().starts_with("replica database: "));

    let router = mock_router();
    router.primary().fail_ping("primary down");
    router.replica().fail_ping("replica down");
    assert!(matches!(router.ping().await.unwrap_err(), Error::Both { .. }));
}

#[tokio::test]
async fn test_setters_apply_to_both() {
    let router = mock_router();

    router.set_max_open_connections(10);
    router.set_max_idle_connections(20);
    router.set_max_connection_lifetime(Duration::from_secs(300));

    let settings = router.settings();
    assert_eq!(settings.primary, settings.replica);
    assert_eq!(settings.primary.max_open_connections, 10);
    // Idle is clamped to the open limit
    assert_eq!(settings.primary.max_idle_connections, 10);
    assert_eq!(settings.primary.max_lifetime, Duration::from_secs(300));

    // Lowering the open limit drags the idle limit along
    router.set_max_open_connections(4);
    let settings = router.settings();
    assert_eq!(settings.primary.max_idle_connections, 4);
    assert_eq!(settings.replica.max_idle_connections, 4);

    let stats = router.stats();
    assert_eq!(stats.primary.max_open_connections, 4);
    assert_eq!(stats.replica.max_open_connections, 4);

    assert_eq!(router.primary().get_calls(), router.replica().get_calls());
}

#[test_log::test(tokio::test)]
async fn test_open_rolls_back_primary_when_replica_fails() {
    let primary_dsn = "mock://rollback-primary";
    let replica_dsn = format!("{FAILING_DSN_PREFIX}-rollback-replica");

    let result = Router::<MockBackend>::open_backends(Driver::MySql, primary_dsn, &replica_dsn, &PoolSettings::default()).await;

    let err = result.err().expect("open should fail");
    assert_eq!(err.target(), Some(Target::Replica));

    let primary = MockBackend::opened(primary_dsn).expect("primary should have been opened");
    assert_eq!(primary.get_calls(), vec![MockCall::Close]);
}

#[tokio::test]
async fn test_open_stops_at_primary_failure() {
    let primary_dsn = format!("{FAILING_DSN_PREFIX}-stop-primary");
    let replica_dsn = "mock://stop-replica";

    let result = Router::<MockBackend>::open_backends(Driver::MySql, &primary_dsn, replica_dsn, &PoolSettings::default()).await;

    let err = result.err().expect("open should fail");
    assert_eq!(err.target(), Some(Target::Primary));
    assert!(MockBackend::opened(replica_dsn).is_none(), "replica must not be opened");
}

#[tokio::test]
async fn test_open_passes_driver_and_settings_to_both() {
    let settings = PoolSettings {
        max_open_connections: 3,
        max_idle_connections: 9,
        ..Default::default()
    };

    let router = Router::<MockBackend>::open_backends(Driver::Postgres, "mock://pass-primary", "mock://pass-replica", &settings)
        .await
        .unwrap();

    assert_eq!(router.primary().driver, Driver::Postgres);
    assert_eq!(router.replica().driver, Driver::Postgres);
    assert_eq!(router.settings().primary.max_idle_connections, 3);
    assert_eq!(router.settings().replica.max_idle_connections, 3);
}

#[tokio::test]
async fn test_begin_cancellable_with_fired_token() {
    let router = mock_router();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = router.begin_cancellable(cancel, TxOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Canceled));
    assert!(router.primary().get_calls().is_empty());
}

#[tokio::test]
async fn test_begin_cancellable_hands_token_to_primary() {
    let router = mock_router();
    let cancel = CancellationToken::new();

    let tx = router.begin_cancellable(cancel.clone(), TxOptions::default()).await.unwrap();
    cancel.cancel();
    assert!(tx.cancel.is_cancelled());
}
