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

//! XA two-phase commit surface.
//!
//! An external transaction manager drives a branch through
//! `start -> end -> prepare -> commit | rollback`, or commits it in one
//! phase. Branches that were prepared but not completed before a crash are
//! in doubt: their effects stay applied and [`XaResource::recover`] reports
//! them until the coordinator decides.

mod resource;

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub(crate) use self::resource::{XaResourceManager, XaSessionState};
pub use self::resource::{MAX_XID_PART_SIZE, XaQueueSession};
use crate::Result;

/// Global transaction branch identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    pub format_id:             i32,
    pub global_transaction_id: Vec<u8>,
    pub branch_qualifier:      Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_transaction_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        write_hex(f, &self.global_transaction_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Xid({self})") }
}

/// XA flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct XaFlags(pub u32);

impl XaFlags {
    pub const END_RSCAN: Self = Self(0x0080_0000);
    pub const FAIL: Self = Self(0x2000_0000);
    pub const JOIN: Self = Self(0x0020_0000);
    pub const NO_FLAGS: Self = Self(0);
    pub const ONE_PHASE: Self = Self(0x4000_0000);
    pub const RESUME: Self = Self(0x0800_0000);
    pub const START_RSCAN: Self = Self(0x0100_0000);
    pub const SUCCESS: Self = Self(0x0400_0000);
    pub const SUSPEND: Self = Self(0x0200_0000);

    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 && other.0 != 0 }

    pub const fn is_empty(self) -> bool { self.0 == 0 }
}

impl std::ops::BitOr for XaFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

/// Outcome of a successful prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaVote {
    /// Work was journaled; commit or rollback must follow.
    Ok,
    /// The branch did no work and is already complete.
    ReadOnly,
}

/// XA error codes surfaced through [`QueueError::Xa`](crate::QueueError::Xa).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum XaErrorCode {
    /// Unknown Xid.
    #[display("XAER_NOTA")]
    Nota,
    /// Call made in the wrong branch state.
    #[display("XAER_PROTO")]
    Proto,
    /// Invalid arguments.
    #[display("XAER_INVAL")]
    Inval,
    /// Xid already in use.
    #[display("XAER_DUPID")]
    Dupid,
    /// Resource manager failure.
    #[display("XAER_RMERR")]
    Rmerr,
    /// Branch was marked rollback-only and has been rolled back.
    #[display("XA_RBROLLBACK")]
    RbRollback,
}

/// Resource interface used by an external transaction manager.
pub trait XaResource {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<()>;

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<()>;

    fn prepare(&self, xid: &Xid) -> Result<XaVote>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    fn rollback(&self, xid: &Xid) -> Result<()>;

    /// Lists prepared branches awaiting a decision.
    ///
    /// `START_RSCAN` begins a scan, `END_RSCAN` ends it. Within a scan
    /// each Xid is returned once.
    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>>;

    fn forget(&self, xid: &Xid) -> Result<()>;

    fn transaction_timeout(&self) -> Duration;

    fn set_transaction_timeout(&self, timeout: Duration) -> bool;
}
