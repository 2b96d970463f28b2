//! Fixed pools of hardware pipes and rotator sessions
//!
//! Both pools are created once from the [`ResourceDescriptor`](crate::hw::ResourceDescriptor)
//! and never grow or shrink. Entries are addressed through stable indices
//! ([`PipeId`], [`RotatorId`]) so allocation results can be kept, compared and
//! dumped without holding on to the pool itself.
//!
//! ## Lifecycle of an entry
//!
//! An entry is *pending* while a display is trying to build a frame with it and
//! *committed* once that frame was handed to the hardware. A display may claim
//! entries it committed for the previous frame again, since those are
//! reprogrammed by the next commit anyway. Entries committed by another display
//! stay untouchable until that display commits a frame without them.
//!
//! ```text
//!            acquire              commit
//!   Free ───────────▶ Pending ───────────▶ Committed
//!    ▲                  │                     │
//!    └──── release ─────┘                     │
//!    └────────── commit without entry ────────┘
//! ```
//!
//! The pools are shared between all displays of a [`DisplayCore`](crate::display::DisplayCore),
//! each behind its own lock. When both are needed the pipe pool is locked first.

use std::{fmt, sync::Mutex};

use crate::dump::{try_dump, Dumpable};

mod pipe;
mod rotator;

pub use self::pipe::{PipeId, PipePool};
pub use self::rotator::{RotatorBuffer, RotatorConfig, RotatorData, RotatorId, RotatorPool, RotatorSession};

/// Identifies the display owning a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display-{}", self.0)
    }
}

/// Claim state of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Claim {
    /// Display building its next frame with this entry
    pub pending: Option<DisplayId>,
    /// Display whose last committed frame uses this entry
    pub committed: Option<DisplayId>,
}

impl Claim {
    /// Whether `owner` may claim this entry for its next frame
    pub fn available_to(&self, owner: DisplayId) -> bool {
        self.pending.is_none() && self.committed.map(|c| c == owner).unwrap_or(true)
    }

    /// Apply a commit of `owner`, returning whether the entry got freed
    pub fn commit(&mut self, owner: DisplayId) -> bool {
        if self.pending == Some(owner) {
            self.pending = None;
            self.committed = Some(owner);
            false
        } else if self.committed == Some(owner) {
            self.committed = None;
            true
        } else {
            false
        }
    }

    /// Drop every claim held by `owner`
    pub fn clear(&mut self, owner: DisplayId) {
        if self.pending == Some(owner) {
            self.pending = None;
        }
        if self.committed == Some(owner) {
            self.committed = None;
        }
    }

    pub fn is_free(&self) -> bool {
        self.pending.is_none() && self.committed.is_none()
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pending, self.committed) {
            (None, None) => f.write_str("free"),
            (Some(p), None) => write!(f, "pending({p})"),
            (None, Some(c)) => write!(f, "committed({c})"),
            (Some(p), Some(c)) => write!(f, "committed({c}) pending({p})"),
        }
    }
}

impl Dumpable for Mutex<PipePool> {
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        try_dump(self, out, |pool, out| pool.dump(out))
    }
}

impl Dumpable for Mutex<RotatorPool> {
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        try_dump(self, out, |pool, out| pool.dump(out))
    }
}
