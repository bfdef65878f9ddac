// Two-phase commit integration tests

use anyhow::Result;

use shardxa::backend::fakedb::{recover_result, FakeRule};
use shardxa::{Outcome, ResolveState, TransactionError, TransactionState};

#[path = "../common/mod.rs"]
mod common;
use common::{address, create_cluster, writes};

#[test]
fn test_commit_failure_on_one_backend_is_recovered() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;
    cluster.db.add_rule(
        FakeRule::prefix("XA COMMIT")
            .on(address(1))
            .error(1397, "XAER_NOTA: Unknown XID")
            .once(),
    );

    let mut txn = tm.create_transaction();
    txn.begin()?;
    let xid = txn.xid().to_string();
    txn.execute(&writes(&[0, 1]))?;

    // The client sees success; the failure is parked in the recovery log
    txn.commit()?;
    assert_eq!(txn.outcome(), Some(Outcome::Indeterminate));
    txn.finish();

    let entries = tm.recovery_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].xaid, xid);
    assert_eq!(entries[0].state, ResolveState::Commit);
    assert!(std::fs::read_to_string(tm.recovery_log_path())?.contains(&xid));

    // backend1 still holds the branch prepared
    let xid_ref = xid.as_str();
    cluster
        .db
        .add_rule(FakeRule::exact("XA RECOVER").on(address(1)).result(recover_result(&[xid_ref])));
    cluster.db.clear_journal();

    let report = tm.checker().run_once();
    assert_eq!(report.resolved, vec![xid.clone()]);
    assert!(tm.recovery_entries().is_empty());
    assert_eq!(cluster.db.queries_with_prefix(&address(1), "XA COMMIT"), vec![format!("XA COMMIT '{}'", xid)]);
    assert!(cluster.db.queries_with_prefix(&address(0), "XA COMMIT").is_empty());

    tm.close();
    Ok(())
}

#[test]
fn test_entry_absent_everywhere_is_discarded() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;
    cluster
        .db
        .add_rule(FakeRule::prefix("XA COMMIT").on(address(1)).timeout().once());

    let mut txn = tm.create_transaction();
    txn.begin()?;
    txn.execute(&writes(&[0, 1]))?;
    txn.commit()?;
    let xid = txn.xid().to_string();
    drop(txn);

    // The commit actually landed; no backend lists the xid any more
    cluster.db.clear_journal();
    let report = tm.checker().run_once();
    assert_eq!(report.discarded, vec![xid]);
    assert!(tm.recovery_entries().is_empty());
    for i in 0..2 {
        assert_eq!(cluster.db.queries(&address(i)), vec!["XA RECOVER".to_string()]);
    }
    Ok(())
}

#[test]
fn test_zero_and_one_participant_never_log() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;
    cluster.db.add_rule(FakeRule::prefix("XA COMMIT").timeout());

    let mut empty = tm.create_transaction();
    empty.begin()?;
    empty.commit()?;
    assert_eq!(empty.outcome(), Some(Outcome::Committed));

    let mut single = tm.create_transaction();
    single.begin()?;
    single.execute(&writes(&[1]))?;
    assert!(matches!(single.commit(), Err(TransactionError::Backend { .. })));

    assert!(tm.recovery_entries().is_empty());
    assert!(cluster.db.queries_with_prefix(&address(1), "XA PREPARE").is_empty());
    Ok(())
}

#[test]
fn test_prepare_failure_aborts_without_log() -> Result<()> {
    let cluster = create_cluster(3)?;
    let tm = cluster.manager()?;
    cluster
        .db
        .add_rule(FakeRule::prefix("XA PREPARE").on(address(2)).error(1614, "XA_RBDEADLOCK"));

    let mut txn = tm.create_transaction();
    txn.begin()?;
    txn.execute(&writes(&[0, 1, 2]))?;

    match txn.commit() {
        Err(TransactionError::PrepareFailed { backend, .. }) => assert_eq!(backend, "backend2"),
        other => panic!("expected PrepareFailed, got {:?}", other),
    }
    assert_eq!(txn.outcome(), Some(Outcome::RolledBack));
    for i in 0..3 {
        assert!(cluster.db.queries_with_prefix(&address(i), "XA COMMIT").is_empty());
        assert_eq!(cluster.db.queries_with_prefix(&address(i), "XA ROLLBACK").len(), 1);
    }
    assert!(tm.recovery_entries().is_empty());
    Ok(())
}

#[test]
fn test_explicit_rollback() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;

    let mut txn = tm.create_transaction();
    txn.begin()?;
    let xid = txn.xid().to_string();
    txn.execute(&writes(&[0, 1]))?;
    txn.rollback()?;

    assert_eq!(txn.outcome(), Some(Outcome::RolledBack));
    assert_eq!(
        cluster.db.queries_with_prefix(&address(0), "XA "),
        vec![
            format!("XA START '{}'", xid),
            format!("XA END '{}'", xid),
            format!("XA ROLLBACK '{}'", xid),
        ]
    );
    Ok(())
}

#[test]
fn test_finish_returns_every_connection() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;

    for _ in 0..10 {
        let mut txn = tm.create_transaction();
        txn.begin()?;
        txn.execute(&writes(&[0, 1]))?;
        txn.commit()?;
        txn.finish();
        assert_eq!(txn.state(), TransactionState::Finished);
    }

    assert_eq!(tm.active_transactions(), 0);
    for (_, stats) in tm.registry().pool_stats() {
        assert_eq!(stats.in_use, 0);
    }
    // Connections were reused rather than reopened
    assert_eq!(cluster.db.connects(&address(0)), 1);
    Ok(())
}

#[test]
fn test_concurrent_transactions() -> Result<()> {
    let cluster = create_cluster(3)?;
    let tm = cluster.manager()?;

    std::thread::scope(|s| {
        for worker in 0..4 {
            let tm = &tm;
            s.spawn(move || {
                for _ in 0..20 {
                    let mut txn = tm.create_transaction();
                    txn.begin().unwrap();
                    txn.execute(&writes(&[worker % 3, (worker + 1) % 3])).unwrap();
                    txn.commit().unwrap();
                }
            });
        }
    });

    assert_eq!(tm.active_transactions(), 0);
    assert!(tm.recovery_entries().is_empty());
    let prepares: usize = (0..3)
        .map(|i| cluster.db.queries_with_prefix(&address(i), "XA PREPARE").len())
        .sum();
    assert_eq!(prepares, 4 * 20 * 2);
    Ok(())
}
