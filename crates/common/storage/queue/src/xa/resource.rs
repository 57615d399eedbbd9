// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, info, warn};

use super::{XaErrorCode, XaFlags, XaResource, XaVote, Xid};
use crate::{
    QueueItem, Result,
    codec::SharedCodec,
    error::XaSnafu,
    journal::XaTxJournal,
    recovery::QueueProvider,
    session::Queue,
    transaction::{QueueTransactionContext, XaTransactionContext},
};

/// Longest global transaction id or branch qualifier, in bytes.
pub const MAX_XID_PART_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
enum BranchState {
    #[display("active")]
    Active,
    #[display("suspended")]
    Suspended,
    #[display("ended")]
    Ended,
    #[display("prepared")]
    Prepared,
}

type SharedContext<T> = Arc<Mutex<XaTransactionContext<T>>>;

struct Branch<T: QueueItem> {
    context:       SharedContext<T>,
    state:         BranchState,
    rollback_only: bool,
}

fn xa_error(code: XaErrorCode, message: impl Into<String>) -> crate::QueueError {
    XaSnafu {
        code,
        message: message.into(),
    }
    .build()
}

/// Branch table shared by every XA session of a manager.
pub(crate) struct XaResourceManager<T: QueueItem> {
    journal:  Arc<XaTxJournal>,
    codec:    SharedCodec<T>,
    branches: Mutex<HashMap<Xid, Branch<T>>>,
}

impl<T: QueueItem> XaResourceManager<T> {
    pub(crate) fn new(journal: Arc<XaTxJournal>, codec: SharedCodec<T>) -> Self {
        Self {
            journal,
            codec,
            branches: Mutex::new(HashMap::new()),
        }
    }

    /// Registers branches found prepared in the journal at startup.
    pub(crate) fn adopt_in_doubt(&self, contexts: Vec<XaTransactionContext<T>>) {
        let mut branches = self.branches.lock();
        for context in contexts {
            let xid = context.tx().clone();
            info!(xid = %xid, "Holding in-doubt XA branch");
            branches.insert(xid, Branch {
                context:       Arc::new(Mutex::new(context)),
                state:         BranchState::Prepared,
                rollback_only: false,
            });
        }
    }

    /// Drops every branch without completing it. Applied effects stay in the
    /// queues and the journal, for recovery on the next start.
    pub(crate) fn abandon_all(&self) {
        let mut branches = self.branches.lock();
        if !branches.is_empty() {
            warn!(branches = branches.len(), "Abandoning incomplete XA branches");
        }
        branches.clear();
    }

    fn start(&self, xid: &Xid, flags: XaFlags, lock_timeout: Duration) -> Result<()> {
        ensure!(
            xid.global_transaction_id.len() <= MAX_XID_PART_SIZE && xid.branch_qualifier.len() <= MAX_XID_PART_SIZE,
            XaSnafu {
                code:    XaErrorCode::Inval,
                message: format!("xid parts are limited to {MAX_XID_PART_SIZE} bytes"),
            }
        );

        let mut branches = self.branches.lock();
        if flags.contains(XaFlags::JOIN) || flags.contains(XaFlags::RESUME) {
            let branch = branches
                .get_mut(xid)
                .ok_or_else(|| xa_error(XaErrorCode::Nota, format!("unknown branch {xid}")))?;
            let expected = if flags.contains(XaFlags::RESUME) {
                BranchState::Suspended
            } else {
                BranchState::Active
            };
            ensure!(
                branch.state == expected || (expected == BranchState::Active && branch.state == BranchState::Ended),
                XaSnafu {
                    code:    XaErrorCode::Proto,
                    message: format!("cannot resume or join branch {xid} in state {}", branch.state),
                }
            );
            branch.state = BranchState::Active;
            return Ok(());
        }

        ensure!(
            flags.is_empty(),
            XaSnafu {
                code:    XaErrorCode::Inval,
                message: format!("unsupported start flags {:#x}", flags.0),
            }
        );
        ensure!(
            !branches.contains_key(xid),
            XaSnafu {
                code:    XaErrorCode::Dupid,
                message: format!("branch {xid} already exists"),
            }
        );
        let context = XaTransactionContext::new(xid.clone(), self.journal.clone(), self.codec.clone(), lock_timeout);
        branches.insert(xid.clone(), Branch {
            context:       Arc::new(Mutex::new(context)),
            state:         BranchState::Active,
            rollback_only: false,
        });
        debug!(xid = %xid, "Started XA branch");
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<()> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| xa_error(XaErrorCode::Nota, format!("unknown branch {xid}")))?;
        ensure!(
            branch.state == BranchState::Active,
            XaSnafu {
                code:    XaErrorCode::Proto,
                message: format!("cannot end branch {xid} in state {}", branch.state),
            }
        );
        if flags.contains(XaFlags::SUSPEND) {
            branch.state = BranchState::Suspended;
        } else if flags.contains(XaFlags::FAIL) {
            branch.state = BranchState::Ended;
            branch.rollback_only = true;
        } else if flags.contains(XaFlags::SUCCESS) || flags.is_empty() {
            branch.state = BranchState::Ended;
        } else {
            return XaSnafu {
                code:    XaErrorCode::Inval,
                message: format!("unsupported end flags {:#x}", flags.0),
            }
            .fail();
        }
        Ok(())
    }

    /// Returns the branch context once `state` holds, without keeping the
    /// table locked.
    fn context_in(&self, xid: &Xid, states: &[BranchState]) -> Result<(SharedContext<T>, bool)> {
        let branches = self.branches.lock();
        let branch = branches
            .get(xid)
            .ok_or_else(|| xa_error(XaErrorCode::Nota, format!("unknown branch {xid}")))?;
        ensure!(
            states.contains(&branch.state),
            XaSnafu {
                code:    XaErrorCode::Proto,
                message: format!("branch {xid} is {}", branch.state),
            }
        );
        Ok((Arc::clone(&branch.context), branch.rollback_only))
    }

    fn set_state(&self, xid: &Xid, state: BranchState) {
        if let Some(branch) = self.branches.lock().get_mut(xid) {
            branch.state = state;
        }
    }

    fn finish(&self, xid: &Xid) { self.branches.lock().remove(xid); }

    fn rollback_only_failure(&self, xid: &Xid, context: &SharedContext<T>) -> Result<()> {
        context.lock().do_rollback()?;
        self.finish(xid);
        XaSnafu {
            code:    XaErrorCode::RbRollback,
            message: format!("branch {xid} was marked rollback-only"),
        }
        .fail()
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote> {
        let (context, rollback_only) = self.context_in(xid, &[BranchState::Ended])?;
        if rollback_only {
            return self.rollback_only_failure(xid, &context).map(|()| XaVote::ReadOnly);
        }
        let mut guard = context.lock();
        if guard.prepare()? {
            drop(guard);
            self.set_state(xid, BranchState::Prepared);
            debug!(xid = %xid, "Prepared XA branch");
            Ok(XaVote::Ok)
        } else {
            guard.do_commit()?;
            drop(guard);
            self.finish(xid);
            Ok(XaVote::ReadOnly)
        }
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let expected = if one_phase { BranchState::Ended } else { BranchState::Prepared };
        let (context, rollback_only) = self.context_in(xid, &[expected])?;
        if rollback_only {
            return self.rollback_only_failure(xid, &context);
        }
        context.lock().do_commit()?;
        self.finish(xid);
        debug!(xid = %xid, one_phase, "Committed XA branch");
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        let (context, _) = self.context_in(xid, &[
            BranchState::Suspended,
            BranchState::Ended,
            BranchState::Prepared,
        ])?;
        context.lock().do_rollback()?;
        self.finish(xid);
        debug!(xid = %xid, "Rolled back XA branch");
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        let known = self.branches.lock().contains_key(xid);
        let code = if known { XaErrorCode::Proto } else { XaErrorCode::Nota };
        XaSnafu {
            code,
            message: format!("no heuristic decision recorded for {xid}"),
        }
        .fail()
    }

    /// Context of an active branch, for routing queue operations.
    fn active_context(&self, xid: &Xid) -> Result<SharedContext<T>> {
        self.context_in(xid, &[BranchState::Active]).map(|(context, _)| context)
    }
}

/// Per-session state shared with the [`Queue`] handles it hands out.
pub(crate) struct XaSessionState<T: QueueItem> {
    resources:       Arc<XaResourceManager<T>>,
    provider:        Arc<dyn QueueProvider<T>>,
    current:         Mutex<Option<Xid>>,
    default_timeout: Duration,
    timeout:         Mutex<Duration>,
}

impl<T: QueueItem> XaSessionState<T> {
    /// Runs `op` in the associated branch, or returns `None` when no branch
    /// is associated with the session.
    pub(crate) fn with_branch<R>(
        &self,
        op: impl FnOnce(&mut dyn QueueTransactionContext<T>) -> Result<R>,
    ) -> Option<Result<R>> {
        let xid = self.current.lock().clone()?;
        Some(
            self.resources
                .active_context(&xid)
                .and_then(|context| op(&mut *context.lock())),
        )
    }

    pub(crate) fn provider(&self) -> &dyn QueueProvider<T> { self.provider.as_ref() }
}

/// XA resource exposing the manager's queues to an external transaction
/// manager.
///
/// Queue operations issued through [`XaQueueSession::get_queue`] between
/// `start` and `end` run inside that branch; outside a branch they apply
/// directly.
pub struct XaQueueSession<T: QueueItem> {
    state: Arc<XaSessionState<T>>,
}

impl<T: QueueItem> XaQueueSession<T> {
    pub(crate) fn new(
        resources: Arc<XaResourceManager<T>>,
        provider: Arc<dyn QueueProvider<T>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(XaSessionState {
                resources,
                provider,
                current: Mutex::new(None),
                default_timeout,
                timeout: Mutex::new(default_timeout),
            }),
        }
    }

    /// Handle on the named queue bound to this session.
    pub fn get_queue(&self, name: &str) -> Result<Queue<T>> {
        let store = self.state.provider.get_queue(name)?;
        Ok(Queue::xa(store, Arc::clone(&self.state)))
    }

    /// The branch currently associated with this session.
    pub fn current_xid(&self) -> Option<Xid> { self.state.current.lock().clone() }
}

impl<T: QueueItem> XaResource for XaQueueSession<T> {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<()> {
        let mut current = self.state.current.lock();
        ensure!(
            current.is_none(),
            XaSnafu {
                code:    XaErrorCode::Proto,
                message: "session is already associated with a branch",
            }
        );
        self.state.resources.start(xid, flags, *self.state.timeout.lock())?;
        *current = Some(xid.clone());
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<()> {
        self.state.resources.end(xid, flags)?;
        let mut current = self.state.current.lock();
        if current.as_ref() == Some(xid) {
            *current = None;
        }
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote> { self.state.resources.prepare(xid) }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> { self.state.resources.commit(xid, one_phase) }

    fn rollback(&self, xid: &Xid) -> Result<()> { self.state.resources.rollback(xid) }

    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>> { self.state.resources.journal.recover(flags) }

    fn forget(&self, xid: &Xid) -> Result<()> { self.state.resources.forget(xid) }

    fn transaction_timeout(&self) -> Duration { *self.state.timeout.lock() }

    /// A zero timeout restores the manager default.
    fn set_transaction_timeout(&self, timeout: Duration) -> bool {
        *self.state.timeout.lock() = if timeout.is_zero() {
            self.state.default_timeout
        } else {
            timeout
        };
        true
    }
}
