use std::fmt;

use tracing::trace;

use super::{Claim, DisplayId};
use crate::hw::{PipeClass, ResourceDescriptor};

/// Stable index of a pipe inside a [`PipePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub(crate) usize);

impl PipeId {
    /// Position of the pipe in the pool
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct PipeSlot {
    class: PipeClass,
    claim: Claim,
    // KB/s fetched by the pending and the committed frame
    pending_bandwidth: u64,
    committed_bandwidth: u64,
}

/// Every hardware pipe of the display controller
#[derive(Debug)]
pub struct PipePool {
    slots: Vec<PipeSlot>,
}

impl PipePool {
    /// Create the pool with the pipe counts reported by the hardware
    pub fn new(descriptor: &ResourceDescriptor) -> Self {
        let slots = PipeClass::ALL
            .iter()
            .flat_map(|class| {
                (0..descriptor.pipe_count(*class)).map(|_| PipeSlot {
                    class: *class,
                    claim: Claim::default(),
                    pending_bandwidth: 0,
                    committed_bandwidth: 0,
                })
            })
            .collect();
        PipePool { slots }
    }

    /// Total number of pipes
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the hardware has no pipes
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Class of the given pipe
    pub fn class(&self, id: PipeId) -> Option<PipeClass> {
        self.slots.get(id.0).map(|slot| slot.class)
    }

    /// Number of pipes of `class` that `owner` could still claim
    pub fn available(&self, class: PipeClass, owner: DisplayId) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.class == class && slot.claim.available_to(owner))
            .count()
    }

    /// Claim a pipe of `class` for the next frame of `owner`
    ///
    /// Pipes `owner` already scans out from are preferred, so a stable scene
    /// keeps the same pipes from frame to frame.
    pub fn acquire(&mut self, class: PipeClass, owner: DisplayId) -> Option<PipeId> {
        let candidates = || {
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.class == class && slot.claim.available_to(owner))
        };
        let index = candidates()
            .find(|(_, slot)| slot.claim.committed == Some(owner))
            .or_else(|| candidates().next())
            .map(|(index, _)| index)?;

        self.slots[index].claim.pending = Some(owner);
        trace!(pipe = index, %class, %owner, "acquired pipe");
        Some(PipeId(index))
    }

    /// Return a pending pipe to the pool
    pub fn release(&mut self, id: PipeId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.claim.pending = None;
            slot.pending_bandwidth = 0;
        }
    }

    /// Record the bandwidth a pending pipe will fetch at
    pub fn set_bandwidth(&mut self, id: PipeId, bandwidth: u64) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.pending_bandwidth = bandwidth;
        }
    }

    /// Bandwidth in KB/s of every pipe claimed by displays other than `owner`
    ///
    /// Committed pipes count until their display commits a frame without them,
    /// pending pipes count from the moment they are acquired.
    pub fn bandwidth_of_others(&self, owner: DisplayId) -> u64 {
        self.slots
            .iter()
            .map(|slot| match (slot.claim.pending, slot.claim.committed) {
                (Some(pending), _) if pending != owner => slot.pending_bandwidth,
                (pending, Some(committed)) if committed != owner && pending != Some(committed) => {
                    slot.committed_bandwidth
                }
                _ => 0,
            })
            .sum()
    }

    /// Apply the commit of a frame of `owner`
    ///
    /// Pending pipes of `owner` become committed, pipes `owner` committed
    /// previously but did not claim again are freed. Returns the number of freed pipes.
    pub fn commit(&mut self, owner: DisplayId) -> usize {
        self.slots
            .iter_mut()
            .map(|slot| {
                if slot.claim.pending == Some(owner) {
                    slot.committed_bandwidth = std::mem::take(&mut slot.pending_bandwidth);
                }
                let freed = slot.claim.commit(owner);
                if freed {
                    slot.committed_bandwidth = 0;
                }
                freed
            })
            .filter(|freed| *freed)
            .count()
    }

    /// Drop all pending claims of `owner`, keeping its committed pipes
    pub fn discard_pending(&mut self, owner: DisplayId) {
        for slot in &mut self.slots {
            if slot.claim.pending == Some(owner) {
                slot.claim.pending = None;
                slot.pending_bandwidth = 0;
            }
        }
    }

    /// Drop every claim of `owner`, e.g. when the display is torn down
    pub fn release_display(&mut self, owner: DisplayId) {
        for slot in &mut self.slots {
            if slot.claim.pending == Some(owner) {
                slot.pending_bandwidth = 0;
            }
            if slot.claim.committed == Some(owner) {
                slot.committed_bandwidth = 0;
            }
            slot.claim.clear(owner);
        }
    }

    /// Number of pipes claimed by any display
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.claim.is_free()).count()
    }

    /// Write a line per pipe describing its occupancy
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (index, slot) in self.slots.iter().enumerate() {
            writeln!(out, "  pipe {index:2} {:<6} {}", slot.class, slot.claim)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::descriptor;

    const A: DisplayId = DisplayId(0);
    const B: DisplayId = DisplayId(1);

    #[test]
    fn pool_matches_descriptor() {
        let pool = PipePool::new(&descriptor(2, 2));
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.available(PipeClass::Vig, A), 2);
        assert_eq!(pool.available(PipeClass::Dma, A), 0);
    }

    #[test]
    fn exhausted_class_returns_none() {
        let mut pool = PipePool::new(&descriptor(1, 0));
        assert!(pool.acquire(PipeClass::Vig, A).is_some());
        assert!(pool.acquire(PipeClass::Vig, A).is_none());
        assert!(pool.acquire(PipeClass::Rgb, A).is_none());
    }

    #[test]
    fn committed_pipes_are_reused_by_owner_only() {
        let mut pool = PipePool::new(&descriptor(1, 0));
        let pipe = pool.acquire(PipeClass::Vig, A).unwrap();
        assert_eq!(pool.commit(A), 0);

        assert!(pool.acquire(PipeClass::Vig, B).is_none());
        assert_eq!(pool.acquire(PipeClass::Vig, A), Some(pipe));
        pool.release(pipe);

        // a commit without the pipe hands it back to everyone
        assert_eq!(pool.commit(A), 1);
        assert!(pool.acquire(PipeClass::Vig, B).is_some());
    }

    #[test]
    fn bandwidth_of_other_displays() {
        let mut pool = PipePool::new(&descriptor(2, 2));
        let pipe = pool.acquire(PipeClass::Vig, B).unwrap();
        pool.set_bandwidth(pipe, 500);
        assert_eq!(pool.bandwidth_of_others(A), 500);
        assert_eq!(pool.bandwidth_of_others(B), 0);

        pool.commit(B);
        assert_eq!(pool.bandwidth_of_others(A), 500);

        // a re-claimed pipe is counted once
        assert_eq!(pool.acquire(PipeClass::Vig, B), Some(pipe));
        pool.set_bandwidth(pipe, 300);
        assert_eq!(pool.bandwidth_of_others(A), 300);

        pool.release(pipe);
        pool.commit(B);
        assert_eq!(pool.bandwidth_of_others(A), 0);
    }

    #[test]
    fn teardown_frees_everything() {
        let mut pool = PipePool::new(&descriptor(2, 2));
        pool.acquire(PipeClass::Vig, A).unwrap();
        pool.commit(A);
        pool.acquire(PipeClass::Rgb, A).unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.release_display(A);
        assert_eq!(pool.in_use(), 0);
    }
}
