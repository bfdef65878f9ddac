// Backend registry integration tests

use anyhow::Result;
use std::sync::Arc;

use shardxa::backend::fakedb::{FakeDb, FakeRule};
use shardxa::backend::{BackendsFile, BACKEND_CONFIG_FILE};
use shardxa::{BackendConfig, BackendError, BackendRegistry, BackendRole, ResultSet, TransactionError, TxnConfig};

#[path = "../common/mod.rs"]
mod common;
use common::{address, create_cluster, writes};

#[test]
fn test_topology_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(BACKEND_CONFIG_FILE);
    let config = TxnConfig::default();
    let db = FakeDb::new();

    let registry = BackendRegistry::load(Arc::new(db.clone()), &config, &path)?;
    assert!(registry.names().is_empty());
    registry.add(BackendConfig::new("backend0", address(0)))?;
    registry.add(
        BackendConfig::new("backend1", address(1))
            .with_role(BackendRole::Attached)
            .with_max_connections(8),
    )?;
    registry.flush_config()?;

    let on_disk = BackendsFile::load(&path)?;
    assert_eq!(on_disk.backends.len(), 2);

    let reloaded = BackendRegistry::load(Arc::new(db), &config, &path)?;
    assert_eq!(reloaded.configs(), registry.configs());
    assert_eq!(reloaded.get("backend1")?.config().role, BackendRole::Attached);
    assert_eq!(reloaded.get("backend1")?.pool().stats().max, 8);
    Ok(())
}

#[test]
fn test_malformed_topology_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(BACKEND_CONFIG_FILE);
    std::fs::write(&path, r#"{"backends": [{"name": "backend0"}]}"#)?;

    assert!(matches!(
        BackendRegistry::load(Arc::new(FakeDb::new()), &TxnConfig::default(), &path),
        Err(BackendError::ConfigFormat { .. })
    ));
    Ok(())
}

#[test]
fn test_execute_on_backend() -> Result<()> {
    let cluster = create_cluster(2)?;
    cluster
        .db
        .add_rule(FakeRule::exact("select 1").on(address(1)).result(ResultSet::affected(1)));

    assert_eq!(cluster.registry.execute_on("backend1", "select 1")?.rows_affected, 1);
    assert!(matches!(
        cluster.registry.execute_on("backend9", "select 1"),
        Err(BackendError::UnknownBackend(_))
    ));
    cluster.db.add_rule(FakeRule::exact("select 2").error(1146, "no such table"));
    assert!(matches!(
        cluster.registry.execute_on("backend0", "select 2"),
        Err(BackendError::Connection { .. })
    ));
    Ok(())
}

#[test]
fn test_pool_bound_applies_to_transactions() -> Result<()> {
    let cluster = create_cluster(0)?;
    cluster
        .registry
        .add(BackendConfig::new("backend0", address(0)).with_max_connections(1))?;
    let tm = cluster.manager()?;

    let mut first = tm.create_transaction();
    first.begin()?;
    first.execute(&writes(&[0]))?;

    let mut second = tm.create_transaction();
    second.begin()?;
    assert!(matches!(
        second.execute(&writes(&[0])),
        Err(TransactionError::Registry(BackendError::PoolExhausted(_)))
    ));

    first.commit()?;
    first.finish();
    second.execute(&writes(&[0]))?;
    second.commit()?;
    Ok(())
}

#[test]
fn test_removed_backend_rejects_new_work() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;

    let mut txn = tm.create_transaction();
    txn.begin()?;
    txn.execute(&writes(&[0, 1]))?;
    txn.commit()?;
    txn.finish();

    cluster.registry.remove("backend1")?;
    assert!(matches!(
        cluster.registry.remove("backend1"),
        Err(BackendError::UnknownBackend(_))
    ));

    let mut txn = tm.create_transaction();
    txn.begin()?;
    assert!(matches!(
        txn.execute(&writes(&[1])),
        Err(TransactionError::Registry(BackendError::UnknownBackend(_)))
    ));
    Ok(())
}
