//! Per-branch distributed transaction coordination.
//!
//! One [`TransactionBranch`] tracks the XA-style lifecycle of a single
//! transaction branch against a session's resource manager:
//!
//! ```text
//! CREATED → STARTED → {FAILED | INCOMPLETE | COMPLETE} → PREPARED → CREATED
//! ```
//!
//! The cycle closes on commit or rollback. Instead of a subclass per
//! resource variant, one branch type is parameterized by a small
//! capability set: whether the connection is to a high-availability
//! broker (enabling the one-phase-to-two-phase commit upgrade) and
//! whether prepared branches are tracked in the [`RecoveryTable`].
//!
//! On an HA connection with tracking enabled, a one-phase commit is
//! never sent verbatim: the branch prepares with the one-phase marker,
//! records itself in the recovery table, then commits with the same
//! marker so the broker still applies true one-phase semantics. If the
//! commit round trip errors out, the branch consults its last known
//! state and the recovery table before deciding between a clean
//! rolled-back failure and the indeterminate heuristic outcome that
//! callers must not blindly retry.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::WireError;

/// Foreign transaction identifier assigned by the external coordinator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: u32,
    pub global_id: Bytes,
    pub branch_qualifier: Bytes,
}

impl Xid {
    pub fn new(format_id: u32, global_id: impl Into<Bytes>, branch_qualifier: impl Into<Bytes>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:", self.format_id)?;
        for b in self.global_id.iter() {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in self.branch_qualifier.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

/// Lifecycle states of a transaction branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Created,
    Started,
    Failed,
    Incomplete,
    Complete,
    Prepared,
}

/// Disassociation outcome passed to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    Fail,
    Suspend,
}

/// Broker-reported state of a transaction, used by the commit-status
/// check after a failed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Committed,
    Prepared,
    RolledBack,
    Unknown,
}

/// The transaction slice of the connection's protocol layer. All calls
/// are request/response round trips over the broker link.
pub trait TxnProtocol: Send + Sync {
    fn start_transaction(&self, xid: &Xid) -> Result<(), WireError>;
    fn end_transaction(&self, xid: &Xid, flag: EndFlag) -> Result<(), WireError>;
    /// `one_phase` carries the one-phase marker the HA upgrade path sets
    /// on both the prepare and the commit of the same branch.
    fn prepare_transaction(&self, xid: &Xid, one_phase: bool) -> Result<(), WireError>;
    fn commit_transaction(&self, xid: &Xid, one_phase: bool) -> Result<(), WireError>;
    fn rollback_transaction(&self, xid: &Xid) -> Result<(), WireError>;
    /// Ask the (possibly failed-over) broker what became of a branch.
    fn verify_transaction(&self, xid: &Xid) -> Result<VerifyOutcome, WireError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMark {
    Prepared,
}

/// Prepared-but-unresolved branches, from this client's point of view.
/// Entries appear after a successful prepare and disappear once commit
/// or rollback resolves, so membership answers "did we get past prepare"
/// when interpreting a broker error after reconnection.
#[derive(Debug, Default)]
pub struct RecoveryTable {
    table: DashMap<Xid, RecoveryMark>,
}

impl RecoveryTable {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    pub fn mark_prepared(&self, xid: &Xid) {
        self.table.insert(xid.clone(), RecoveryMark::Prepared);
    }

    pub fn resolve(&self, xid: &Xid) {
        self.table.remove(xid);
    }

    pub fn is_prepared(&self, xid: &Xid) -> bool {
        self.table
            .get(xid)
            .map(|m| *m == RecoveryMark::Prepared)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Capability set replacing the resource-variant class hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct TxnCapabilities {
    /// Connection is to a broker participating in HA failover.
    pub ha_broker: bool,
    /// Record prepared branches in the recovery table.
    pub track_recovery: bool,
}

impl TxnCapabilities {
    fn upgrade_active(&self) -> bool {
        self.ha_broker && self.track_recovery
    }
}

#[derive(Debug)]
struct BranchInner {
    state: BranchState,
    xid: Option<Xid>,
}

/// One transaction branch bound to a session's resource manager.
pub struct TransactionBranch {
    protocol: Arc<dyn TxnProtocol>,
    recovery: Arc<RecoveryTable>,
    caps: TxnCapabilities,
    /// Identity of the broker session; branches on different sessions
    /// belong to different resource managers.
    broker_session: u64,
    inner: Mutex<BranchInner>,
}

impl TransactionBranch {
    pub fn new(
        protocol: Arc<dyn TxnProtocol>,
        recovery: Arc<RecoveryTable>,
        caps: TxnCapabilities,
        broker_session: u64,
    ) -> Self {
        Self {
            protocol,
            recovery,
            caps,
            broker_session,
            inner: Mutex::new(BranchInner {
                state: BranchState::Created,
                xid: None,
            }),
        }
    }

    pub fn state(&self) -> BranchState {
        self.inner.lock().state
    }

    pub fn broker_session(&self) -> u64 {
        self.broker_session
    }

    /// Two branches may only be joined when they address the same broker
    /// session, i.e. the same resource manager instance.
    pub fn assert_same_rm(&self, other: &TransactionBranch) -> Result<(), WireError> {
        if self.broker_session != 0 && self.broker_session == other.broker_session {
            Ok(())
        } else {
            Err(WireError::RmMismatch)
        }
    }

    fn invalid(op: &'static str, state: BranchState) -> WireError {
        WireError::InvalidTxnState { op, state }
    }

    /// Associate the branch with a transaction. `CREATED → STARTED`.
    pub fn start(&self, xid: Xid) -> Result<(), WireError> {
        let mut g = self.inner.lock();
        if g.state != BranchState::Created {
            return Err(Self::invalid("start", g.state));
        }
        self.protocol.start_transaction(&xid)?;
        debug!(%xid, "transaction branch started");
        g.xid = Some(xid);
        g.state = BranchState::Started;
        Ok(())
    }

    /// Disassociate. `STARTED → COMPLETE | FAILED | INCOMPLETE`.
    pub fn end(&self, flag: EndFlag) -> Result<(), WireError> {
        let mut g = self.inner.lock();
        if g.state != BranchState::Started {
            return Err(Self::invalid("end", g.state));
        }
        let xid = g.xid.clone().ok_or(Self::invalid("end", g.state))?;

        // A suspended branch stays associated broker-side; no wire call.
        if flag != EndFlag::Suspend {
            self.protocol.end_transaction(&xid, flag)?;
        }
        g.state = match flag {
            EndFlag::Success => BranchState::Complete,
            EndFlag::Fail => BranchState::Failed,
            EndFlag::Suspend => BranchState::Incomplete,
        };
        Ok(())
    }

    /// First phase of two-phase commit. `COMPLETE → PREPARED`.
    pub fn prepare(&self) -> Result<(), WireError> {
        let mut g = self.inner.lock();
        if g.state != BranchState::Complete {
            return Err(Self::invalid("prepare", g.state));
        }
        let xid = g.xid.clone().ok_or(Self::invalid("prepare", g.state))?;

        if let Err(e) = self.protocol.prepare_transaction(&xid, false) {
            if self.caps.ha_broker {
                // The broker may have failed over mid-prepare; ask its
                // replacement whether the branch actually prepared.
                self.check_prepare_status(&xid, e)?;
            } else {
                return Err(e);
            }
        }

        if self.caps.upgrade_active() {
            self.recovery.mark_prepared(&xid);
        }
        g.state = BranchState::Prepared;
        Ok(())
    }

    fn check_prepare_status(&self, xid: &Xid, cause: WireError) -> Result<(), WireError> {
        match self.protocol.verify_transaction(xid) {
            Ok(VerifyOutcome::Prepared) => {
                info!(%xid, "prepare verified on failover broker");
                Ok(())
            }
            Ok(_) => Err(WireError::TxnRolledBack(format!(
                "branch {xid} rolled back by broker during prepare: {cause}"
            ))),
            Err(verify_err) => {
                warn!(%xid, error = %verify_err, "prepare verification failed");
                Err(cause)
            }
        }
    }

    /// Commit the branch. Two-phase (`one_phase == false`) requires
    /// `PREPARED`; one-phase requires `COMPLETE`. Either way a successful
    /// or cleanly-failed commit returns the branch to `CREATED` and
    /// resolves any recovery-table entry.
    pub fn commit(&self, one_phase: bool) -> Result<(), WireError> {
        let mut g = self.inner.lock();
        let required = if one_phase {
            BranchState::Complete
        } else {
            BranchState::Prepared
        };
        if g.state != required {
            return Err(Self::invalid("commit", g.state));
        }
        let xid = g.xid.clone().ok_or(Self::invalid("commit", g.state))?;

        let result = if one_phase {
            if self.caps.upgrade_active() {
                self.ha_one_phase_commit(&xid)
            } else {
                self.plain_one_phase_commit(&xid)
            }
        } else {
            self.two_phase_commit(&xid)
        };

        self.recovery.resolve(&xid);
        g.state = BranchState::Created;
        g.xid = None;
        result
    }

    /// One-phase commit on a non-HA connection: a single round trip. A
    /// failure means the broker rolled the branch back.
    fn plain_one_phase_commit(&self, xid: &Xid) -> Result<(), WireError> {
        self.protocol.commit_transaction(xid, true).map_err(|e| {
            WireError::TxnRolledBack(format!("one-phase commit of {xid} failed: {e}"))
        })
    }

    /// One-phase commit upgraded to prepare-then-commit so the branch
    /// survives broker failover in a verifiable state. The one-phase
    /// marker rides on both packets; the broker still runs true
    /// one-phase semantics server-side.
    fn ha_one_phase_commit(&self, xid: &Xid) -> Result<(), WireError> {
        let mut last_state = BranchState::Complete;

        let attempt = (|| {
            self.protocol.prepare_transaction(xid, true)?;
            last_state = BranchState::Prepared;
            self.recovery.mark_prepared(xid);
            self.protocol.commit_transaction(xid, true)
        })();

        match attempt {
            Ok(()) => Ok(()),
            Err(cause) => self.check_commit_status(xid, last_state, true, cause),
        }
    }

    fn two_phase_commit(&self, xid: &Xid) -> Result<(), WireError> {
        match self.protocol.commit_transaction(xid, false) {
            Ok(()) => Ok(()),
            Err(cause) => {
                if self.caps.upgrade_active() && self.recovery.is_prepared(xid) {
                    self.check_commit_status(xid, BranchState::Prepared, false, cause)
                } else {
                    Err(cause)
                }
            }
        }
    }

    /// An errored commit round trip is not a failed commit. Decide from
    /// the branch's last known state, the recovery table, and the
    /// (failed-over) broker's own answer.
    fn check_commit_status(
        &self,
        xid: &Xid,
        last_state: BranchState,
        one_phase: bool,
        cause: WireError,
    ) -> Result<(), WireError> {
        let was_prepared =
            last_state == BranchState::Prepared || self.recovery.is_prepared(xid);

        match self.protocol.verify_transaction(xid) {
            Ok(VerifyOutcome::Committed) => {
                info!(%xid, "commit verified after failover");
                Ok(())
            }
            Ok(VerifyOutcome::Prepared) => {
                // Still prepared server-side: finish the commit.
                info!(%xid, "branch still prepared after failover, re-issuing commit");
                self.protocol.commit_transaction(xid, one_phase).map_err(|e| {
                    WireError::TxnHeuristic(format!(
                        "branch {xid} prepared but commit retry failed: {e}"
                    ))
                })
            }
            Ok(VerifyOutcome::RolledBack) => Err(WireError::TxnRolledBack(format!(
                "branch {xid} rolled back by broker: {cause}"
            ))),
            Ok(VerifyOutcome::Unknown) | Err(_) => {
                if was_prepared {
                    Err(WireError::TxnHeuristic(format!(
                        "branch {xid} was prepared; commit outcome unknown: {cause}"
                    )))
                } else {
                    // Never got past prepare: the broker cannot have
                    // applied it.
                    Err(WireError::TxnRolledBack(format!(
                        "branch {xid} never prepared, commit failed: {cause}"
                    )))
                }
            }
        }
    }

    /// Roll the branch back. Valid from every associated state.
    pub fn rollback(&self) -> Result<(), WireError> {
        let mut g = self.inner.lock();
        match g.state {
            BranchState::Started
            | BranchState::Complete
            | BranchState::Failed
            | BranchState::Incomplete
            | BranchState::Prepared => {}
            other => return Err(Self::invalid("rollback", other)),
        }
        let xid = g.xid.clone().ok_or(Self::invalid("rollback", g.state))?;

        if let Err(first) = self.protocol.rollback_transaction(&xid) {
            // The broker may be mid-failover; try once more against its
            // replacement.
            if let Err(second) = self.protocol.rollback_transaction(&xid) {
                if self.caps.upgrade_active() && !self.recovery.is_prepared(&xid) {
                    // Never prepared: the branch cannot survive on the
                    // failover broker, so there is nothing left to roll
                    // back.
                    warn!(%xid, error = %second, "rollback retry failed for unprepared branch, discarding");
                } else {
                    debug!(%xid, error = %first, "first rollback attempt failed");
                    return Err(second);
                }
            }
        }

        self.recovery.resolve(&xid);
        g.state = BranchState::Created;
        g.xid = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedProtocol {
        prepare_calls: AtomicUsize,
        commit_calls: AtomicUsize,
        fail_commits: AtomicUsize,
        verify: Mutex<Option<VerifyOutcome>>,
    }

    impl TxnProtocol for ScriptedProtocol {
        fn start_transaction(&self, _xid: &Xid) -> Result<(), WireError> {
            Ok(())
        }
        fn end_transaction(&self, _xid: &Xid, _flag: EndFlag) -> Result<(), WireError> {
            Ok(())
        }
        fn prepare_transaction(&self, _xid: &Xid, _one_phase: bool) -> Result<(), WireError> {
            self.prepare_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn commit_transaction(&self, _xid: &Xid, _one_phase: bool) -> Result<(), WireError> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_commits.load(Ordering::SeqCst) > 0 {
                self.fail_commits.fetch_sub(1, Ordering::SeqCst);
                return Err(WireError::Disconnected);
            }
            Ok(())
        }
        fn rollback_transaction(&self, _xid: &Xid) -> Result<(), WireError> {
            Ok(())
        }
        fn verify_transaction(&self, _xid: &Xid) -> Result<VerifyOutcome, WireError> {
            let v = *self.verify.lock();
            v.ok_or(WireError::Disconnected)
        }
    }

    fn xid(n: u8) -> Xid {
        Xid::new(0x1234, vec![n; 4], vec![n])
    }

    fn branch(proto: Arc<ScriptedProtocol>, ha: bool) -> (TransactionBranch, Arc<RecoveryTable>) {
        let recovery = Arc::new(RecoveryTable::new());
        let b = TransactionBranch::new(
            proto,
            Arc::clone(&recovery),
            TxnCapabilities {
                ha_broker: ha,
                track_recovery: true,
            },
            7,
        );
        (b, recovery)
    }

    #[test]
    fn two_phase_happy_path() {
        let proto = Arc::new(ScriptedProtocol::default());
        let (b, recovery) = branch(Arc::clone(&proto), false);

        b.start(xid(1)).unwrap();
        b.end(EndFlag::Success).unwrap();
        b.prepare().unwrap();
        b.commit(false).unwrap();

        assert_eq!(b.state(), BranchState::Created);
        assert!(recovery.is_empty());
    }

    #[test]
    fn ha_one_phase_upgrades_to_prepare_then_commit() {
        let proto = Arc::new(ScriptedProtocol::default());
        let (b, recovery) = branch(Arc::clone(&proto), true);

        b.start(xid(2)).unwrap();
        b.end(EndFlag::Success).unwrap();
        b.commit(true).unwrap();

        assert_eq!(proto.prepare_calls.load(Ordering::SeqCst), 1);
        assert_eq!(proto.commit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), BranchState::Created);
        assert!(recovery.is_empty());
    }

    #[test]
    fn non_ha_one_phase_skips_prepare() {
        let proto = Arc::new(ScriptedProtocol::default());
        let (b, _) = branch(Arc::clone(&proto), false);

        b.start(xid(3)).unwrap();
        b.end(EndFlag::Success).unwrap();
        b.commit(true).unwrap();

        assert_eq!(proto.prepare_calls.load(Ordering::SeqCst), 0);
        assert_eq!(proto.commit_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prepare_from_created_is_invalid_and_leaves_state() {
        let proto = Arc::new(ScriptedProtocol::default());
        let (b, _) = branch(proto, false);

        let err = b.prepare().unwrap_err();
        assert!(matches!(err, WireError::InvalidTxnState { op: "prepare", .. }));
        assert_eq!(b.state(), BranchState::Created);
    }

    #[test]
    fn heuristic_when_prepared_and_outcome_unknown() {
        let proto = Arc::new(ScriptedProtocol::default());
        proto.fail_commits.store(1, Ordering::SeqCst);
        *proto.verify.lock() = Some(VerifyOutcome::Unknown);
        let (b, recovery) = branch(Arc::clone(&proto), true);

        b.start(xid(4)).unwrap();
        b.end(EndFlag::Success).unwrap();
        let err = b.commit(true).unwrap_err();

        assert!(err.is_heuristic());
        // resolved either way: no residual entry
        assert!(recovery.is_empty());
        assert_eq!(b.state(), BranchState::Created);
    }

    #[test]
    fn rm_mismatch_detected() {
        let proto = Arc::new(ScriptedProtocol::default());
        let recovery = Arc::new(RecoveryTable::new());
        let caps = TxnCapabilities {
            ha_broker: false,
            track_recovery: false,
        };
        let a = TransactionBranch::new(Arc::clone(&proto) as _, Arc::clone(&recovery), caps, 7);
        let c = TransactionBranch::new(proto as _, recovery, caps, 9);
        assert!(matches!(a.assert_same_rm(&c), Err(WireError::RmMismatch)));
    }
}
