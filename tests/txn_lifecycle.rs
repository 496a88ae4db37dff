use std::sync::Arc;

use parking_lot::Mutex;

use wiremq::core::error::WireError;
use wiremq::core::txn::{
    BranchState, EndFlag, RecoveryTable, TransactionBranch, TxnCapabilities, TxnProtocol,
    VerifyOutcome, Xid,
};

/// Protocol double that can observe the recovery table at the moment the
/// commit packet goes out, and can be scripted to fail.
struct ObservingProtocol {
    recovery: Arc<RecoveryTable>,
    prepared_at_commit: Mutex<Vec<bool>>,
    prepare_one_phase_flags: Mutex<Vec<bool>>,
    commit_one_phase_flags: Mutex<Vec<bool>>,
    fail_commits: Mutex<usize>,
    verify: Mutex<Result<VerifyOutcome, ()>>,
}

impl ObservingProtocol {
    fn new(recovery: Arc<RecoveryTable>) -> Self {
        Self {
            recovery,
            prepared_at_commit: Mutex::new(Vec::new()),
            prepare_one_phase_flags: Mutex::new(Vec::new()),
            commit_one_phase_flags: Mutex::new(Vec::new()),
            fail_commits: Mutex::new(0),
            verify: Mutex::new(Err(())),
        }
    }
}

impl TxnProtocol for ObservingProtocol {
    fn start_transaction(&self, _xid: &Xid) -> Result<(), WireError> {
        Ok(())
    }

    fn end_transaction(&self, _xid: &Xid, _flag: EndFlag) -> Result<(), WireError> {
        Ok(())
    }

    fn prepare_transaction(&self, _xid: &Xid, one_phase: bool) -> Result<(), WireError> {
        self.prepare_one_phase_flags.lock().push(one_phase);
        Ok(())
    }

    fn commit_transaction(&self, xid: &Xid, one_phase: bool) -> Result<(), WireError> {
        self.prepared_at_commit.lock().push(self.recovery.is_prepared(xid));
        self.commit_one_phase_flags.lock().push(one_phase);
        let mut fails = self.fail_commits.lock();
        if *fails > 0 {
            *fails -= 1;
            return Err(WireError::Disconnected);
        }
        Ok(())
    }

    fn rollback_transaction(&self, _xid: &Xid) -> Result<(), WireError> {
        Ok(())
    }

    fn verify_transaction(&self, _xid: &Xid) -> Result<VerifyOutcome, WireError> {
        let v = *self.verify.lock();
        v.map_err(|_| WireError::Disconnected)
    }
}

fn ha_branch() -> (TransactionBranch, Arc<ObservingProtocol>, Arc<RecoveryTable>) {
    let recovery = Arc::new(RecoveryTable::new());
    let protocol = Arc::new(ObservingProtocol::new(Arc::clone(&recovery)));
    let branch = TransactionBranch::new(
        Arc::clone(&protocol) as _,
        Arc::clone(&recovery),
        TxnCapabilities {
            ha_broker: true,
            track_recovery: true,
        },
        42,
    );
    (branch, protocol, recovery)
}

fn xid(n: u8) -> Xid {
    Xid::new(0x7a7a, vec![n; 8], vec![n, n])
}

#[test]
fn full_two_phase_cycle_ends_created_with_clean_table() {
    let (branch, _protocol, recovery) = ha_branch();

    branch.start(xid(1)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    branch.prepare().unwrap();
    branch.commit(false).unwrap();

    assert_eq!(branch.state(), BranchState::Created);
    assert!(recovery.is_empty(), "residual recovery entry after commit");
}

#[test]
fn ha_one_phase_commit_prepares_first_with_marker_and_windows_the_table() {
    let (branch, protocol, recovery) = ha_branch();

    branch.start(xid(2)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    branch.commit(true).unwrap();

    // prepare ran before commit, carrying the one-phase marker
    assert_eq!(*protocol.prepare_one_phase_flags.lock(), vec![true]);
    // the table held the branch between prepare and commit...
    assert_eq!(*protocol.prepared_at_commit.lock(), vec![true]);
    // ...and the commit itself still asked for one-phase semantics
    assert_eq!(*protocol.commit_one_phase_flags.lock(), vec![true]);
    // ...and is resolved afterwards
    assert!(recovery.is_empty());
    assert_eq!(branch.state(), BranchState::Created);
}

#[test]
fn ha_one_phase_commit_failure_still_resolves_table() {
    let (branch, protocol, recovery) = ha_branch();
    *protocol.fail_commits.lock() = 1;
    *protocol.verify.lock() = Err(());

    branch.start(xid(3)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    let err = branch.commit(true).unwrap_err();

    assert!(err.is_heuristic(), "prepared branch with unknown outcome must be heuristic");
    assert!(recovery.is_empty(), "entry must be resolved on failure too");
}

#[test]
fn commit_retry_when_branch_still_prepared_on_failover_broker() {
    let (branch, protocol, _recovery) = ha_branch();
    *protocol.fail_commits.lock() = 1;
    *protocol.verify.lock() = Ok(VerifyOutcome::Prepared);

    branch.start(xid(4)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    branch.commit(true).unwrap();

    // first commit failed, verify said prepared, second commit landed
    assert_eq!(protocol.commit_one_phase_flags.lock().len(), 2);
}

#[test]
fn verified_rollback_is_ordinary_failure_not_heuristic() {
    let (branch, protocol, _recovery) = ha_branch();
    *protocol.fail_commits.lock() = 1;
    *protocol.verify.lock() = Ok(VerifyOutcome::RolledBack);

    branch.start(xid(5)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    let err = branch.commit(true).unwrap_err();

    assert!(matches!(err, WireError::TxnRolledBack(_)));
    assert!(!err.is_heuristic());
}

#[test]
fn illegal_transitions_fail_and_leave_state() {
    let (branch, _protocol, _recovery) = ha_branch();

    // prepare without start/end
    assert!(matches!(
        branch.prepare(),
        Err(WireError::InvalidTxnState { op: "prepare", .. })
    ));
    assert_eq!(branch.state(), BranchState::Created);

    // end without start
    assert!(matches!(
        branch.end(EndFlag::Success),
        Err(WireError::InvalidTxnState { op: "end", .. })
    ));

    // two-phase commit without prepare
    branch.start(xid(6)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    assert!(matches!(
        branch.commit(false),
        Err(WireError::InvalidTxnState { op: "commit", .. })
    ));
    assert_eq!(branch.state(), BranchState::Complete);

    // double start
    let (b2, _, _) = ha_branch();
    b2.start(xid(7)).unwrap();
    assert!(matches!(
        b2.start(xid(8)),
        Err(WireError::InvalidTxnState { op: "start", .. })
    ));
    assert_eq!(b2.state(), BranchState::Started);
}

#[test]
fn rollback_valid_from_every_associated_state() {
    for flag in [EndFlag::Success, EndFlag::Fail, EndFlag::Suspend] {
        let (branch, _protocol, recovery) = ha_branch();
        branch.start(xid(9)).unwrap();
        branch.end(flag).unwrap();
        branch.rollback().unwrap();
        assert_eq!(branch.state(), BranchState::Created);
        assert!(recovery.is_empty());
    }

    // straight from STARTED
    let (branch, _protocol, _recovery) = ha_branch();
    branch.start(xid(10)).unwrap();
    branch.rollback().unwrap();
    assert_eq!(branch.state(), BranchState::Created);

    // from PREPARED
    let (branch, _protocol, recovery) = ha_branch();
    branch.start(xid(11)).unwrap();
    branch.end(EndFlag::Success).unwrap();
    branch.prepare().unwrap();
    assert!(recovery.is_prepared(&xid(11)));
    branch.rollback().unwrap();
    assert_eq!(branch.state(), BranchState::Created);
    assert!(recovery.is_empty());
}
