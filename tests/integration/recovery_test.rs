// Recovery Integration Tests

use anyhow::Result;
use std::fs;
use std::time::{Duration, Instant};

use shardxa::backend::fakedb::{recover_result, FakeRule};
use shardxa::transaction::recovery::{RecoveryLogError, RECOVERY_LOG_FILE};
use shardxa::{RecoveryLogEntry, RecoveryLogStore, ResolveState, TransactionError, TransactionManager};

#[path = "../common/mod.rs"]
mod common;
use common::{address, create_cluster};

#[test]
fn test_log_round_trip_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut written = Vec::new();
    {
        let store = RecoveryLogStore::open(dir.path())?;
        for i in 0..25 {
            let state = if i % 2 == 0 { ResolveState::Commit } else { ResolveState::Rollback };
            let entry = RecoveryLogEntry::new(format!("XID-20180903103145-{}", i), state);
            store.write(entry.clone())?;
            written.push(entry);
        }
    }

    let reopened = RecoveryLogStore::open(dir.path())?;
    assert_eq!(reopened.list(), written);
    assert!(!dir.path().join(format!("{}.tmp", RECOVERY_LOG_FILE)).exists());
    Ok(())
}

#[test]
fn test_corrupt_log_fails_manager_init() -> Result<()> {
    let cluster = create_cluster(1)?;
    fs::write(
        cluster.dir.path().join(RECOVERY_LOG_FILE),
        r#"{"xacommit-errs": [2]}"#,
    )?;

    match cluster.manager() {
        Err(e) => assert!(matches!(
            e.downcast_ref::<TransactionError>(),
            Some(TransactionError::RecoveryLog(RecoveryLogError::CorruptLog { .. }))
        )),
        Ok(_) => panic!("init must fail on a corrupt recovery log"),
    }
    Ok(())
}

#[test]
fn test_restart_resumes_pending_entries() -> Result<()> {
    let cluster = create_cluster(2)?;
    fs::write(
        cluster.dir.path().join(RECOVERY_LOG_FILE),
        r#"{"xacommit-errs": [
            {"time": "20180903103145", "xaid": "XID-20180903103145-1", "state": "rollback"},
            {"time": "20180903103146", "xaid": "XID-20180903103146-2", "state": "commit"}
        ]}"#,
    )?;
    cluster.db.add_rule(
        FakeRule::exact("XA RECOVER")
            .on(address(0))
            .result(recover_result(&["XID-20180903103145-1", "XID-20180903103146-2"])),
    );

    let tm = cluster.manager()?;
    assert_eq!(tm.recovery_entries().len(), 2);

    let report = tm.checker().run_once();
    assert_eq!(report.resolved.len(), 2);
    assert_eq!(
        cluster.db.queries_with_prefix(&address(0), "XA ROLLBACK"),
        vec!["XA ROLLBACK 'XID-20180903103145-1'".to_string()]
    );
    assert_eq!(
        cluster.db.queries_with_prefix(&address(0), "XA COMMIT"),
        vec!["XA COMMIT 'XID-20180903103146-2'".to_string()]
    );
    assert!(RecoveryLogStore::open(cluster.dir.path())?.is_empty());
    Ok(())
}

#[test]
fn test_unreachable_backend_keeps_entry() -> Result<()> {
    let cluster = create_cluster(2)?;
    let tm = cluster.manager()?;
    tm.recovery_store()
        .write(RecoveryLogEntry::new("XID-20180903103145-9", ResolveState::Commit))?;

    cluster.db.refuse_connections(&address(1), true);
    let report = tm.checker().run_once();
    assert_eq!(report.pending, vec!["XID-20180903103145-9".to_string()]);
    assert_eq!(tm.recovery_entries().len(), 1);

    cluster.db.refuse_connections(&address(1), false);
    let report = tm.checker().run_once();
    assert_eq!(report.discarded, vec!["XID-20180903103145-9".to_string()]);
    Ok(())
}

#[test]
fn test_background_loop_drains_log() -> Result<()> {
    let mut cluster = create_cluster(1)?;
    cluster.config.tick_interval_ms = 20;
    let tm = cluster.manager()?;
    tm.recovery_store()
        .write(RecoveryLogEntry::new("XID-20180903103145-3", ResolveState::Commit))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !tm.recovery_entries().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(tm.recovery_entries().is_empty());
    assert!(tm.checker().ticks() >= 1);
    Ok(())
}

#[test]
fn test_close_stops_checker() -> Result<()> {
    let mut cluster = create_cluster(1)?;
    cluster.config.tick_interval_ms = 10;
    let tm: TransactionManager = cluster.manager()?;
    std::thread::sleep(Duration::from_millis(50));

    tm.close();
    assert!(!tm.checker().is_running());
    let ticks = tm.checker().ticks();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(tm.checker().ticks(), ticks);
    Ok(())
}
