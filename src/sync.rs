//! Helper for synchronizing buffer access between producers and the display
//!
//! Layers carry an acquire [`SyncPoint`] which must be reached before the
//! hardware may fetch the buffer. Waiting is always bounded by a timeout: a
//! fence that does not signal in time is reported as [`FenceError::Timeout`]
//! and the frame is failed instead of blocking the display pipeline.
use std::{
    fmt, io,
    sync::Arc,
    time::{Duration, Instant},
};

use downcast_rs::{impl_downcast, Downcast};

/// Default bound for waiting on acquire fences
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors returned while waiting on a fence
#[derive(thiserror::Error, Debug)]
pub enum FenceError {
    /// The fence did not signal in time
    #[error("Fence was not signaled within {0:?}")]
    Timeout(Duration),
    /// Waiting was interrupted, the fence state is unknown
    #[error("Wait for fence was interrupted")]
    Interrupted,
    /// The fence could not be queried
    #[error("Failed to query fence")]
    Io(#[from] io::Error),
}

/// A fence that will be signaled in finite time
pub trait Fence: fmt::Debug + Send + Sync + Downcast {
    /// Queries the state of the fence
    fn is_signaled(&self) -> bool;

    /// Blocks the current thread until the fence is signaled or `timeout` passed
    fn wait(&self, timeout: Duration) -> Result<(), FenceError>;
}
impl_downcast!(Fence);

/// A sync point that will be signaled in finite time
#[derive(Debug, Clone)]
#[must_use = "this `SyncPoint` may contain a fence that should be awaited"]
pub struct SyncPoint {
    fence: Option<Arc<dyn Fence>>,
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::signaled()
    }
}

impl SyncPoint {
    /// Create an already signaled sync point
    pub fn signaled() -> Self {
        Self { fence: None }
    }

    /// Get a reference to the underlying [`Fence`] if any
    ///
    /// Returns `None` if the sync point does not contain a fence
    /// or contains a different type of fence
    pub fn get<F: Fence + 'static>(&self) -> Option<&F> {
        self.fence.as_ref().and_then(|f| f.downcast_ref())
    }

    /// Queries the state of the sync point
    ///
    /// Will always return `true` in case the sync point does not contain a fence
    pub fn is_reached(&self) -> bool {
        self.fence.as_ref().map(|f| f.is_signaled()).unwrap_or(true)
    }

    /// Blocks the current thread until the sync point is signaled or `timeout` passed
    ///
    /// If the sync point does not contain a fence this will never block.
    #[profiling::function]
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        match self.fence.as_ref() {
            Some(fence) => fence.wait(timeout),
            None => Ok(()),
        }
    }

    /// Combine two sync points into one that is reached once both are
    pub fn merge(&self, other: &SyncPoint) -> SyncPoint {
        match (&self.fence, &other.fence) {
            (None, None) => SyncPoint::signaled(),
            (Some(_), None) => self.clone(),
            (None, Some(_)) => other.clone(),
            (Some(a), Some(b)) => {
                let mut fences = Vec::with_capacity(2);
                for fence in [a, b] {
                    match fence.downcast_ref::<MergedFence>() {
                        Some(merged) => fences.extend(merged.0.iter().cloned()),
                        None => fences.push(fence.clone()),
                    }
                }
                SyncPoint::from(MergedFence(fences))
            }
        }
    }
}

impl<T: Fence + 'static> From<T> for SyncPoint {
    fn from(value: T) -> Self {
        SyncPoint {
            fence: Some(Arc::new(value)),
        }
    }
}

/// Fence signaled once all contained fences are signaled
#[derive(Debug)]
pub struct MergedFence(Vec<Arc<dyn Fence>>);

impl Fence for MergedFence {
    fn is_signaled(&self) -> bool {
        self.0.iter().all(|f| f.is_signaled())
    }

    fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let deadline = Instant::now() + timeout;
        for fence in &self.0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            fence.wait(remaining).map_err(|err| match err {
                FenceError::Timeout(_) => FenceError::Timeout(timeout),
                err => err,
            })?;
        }
        Ok(())
    }
}

/// The buffer synchronization collaborator of the display core
pub trait BufferSync: fmt::Debug + Send + Sync {
    /// Wait for `fence` with a bounded timeout
    fn wait(&self, fence: &SyncPoint, timeout: Duration) -> Result<(), FenceError> {
        fence.wait(timeout)
    }

    /// Combine two fences into one
    fn merge(&self, a: &SyncPoint, b: &SyncPoint) -> SyncPoint {
        a.merge(b)
    }
}

/// [`BufferSync`] using the fences' own wait implementations
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSync;

impl BufferSync for NativeSync {}

#[cfg(feature = "sync_file")]
pub use self::sync_file::SyncFileFence;

#[cfg(feature = "sync_file")]
mod sync_file {
    use std::{os::unix::io::OwnedFd, time::Duration};

    use rustix::event::{poll, PollFd, PollFlags};
    use rustix::io::Errno;

    use super::{Fence, FenceError};

    /// A kernel sync file, readable once signaled
    #[derive(Debug)]
    pub struct SyncFileFence(OwnedFd);

    impl SyncFileFence {
        /// Wrap a sync file descriptor
        pub fn new(fd: OwnedFd) -> Self {
            SyncFileFence(fd)
        }

        fn poll(&self, timeout_ms: i32) -> Result<bool, FenceError> {
            let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
            match poll(&mut fds, timeout_ms) {
                Ok(ready) => Ok(ready > 0),
                Err(Errno::INTR) | Err(Errno::AGAIN) => Err(FenceError::Interrupted),
                Err(err) => Err(FenceError::Io(err.into())),
            }
        }
    }

    impl Fence for SyncFileFence {
        fn is_signaled(&self) -> bool {
            self.poll(0).unwrap_or(false)
        }

        fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
            let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            if self.poll(timeout_ms)? {
                Ok(())
            } else {
                Err(FenceError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::ManualFence;

    #[test]
    fn signaled_sync_point_never_blocks() {
        assert!(SyncPoint::signaled().wait(Duration::ZERO).is_ok());
    }

    #[test]
    fn pending_fence_times_out() {
        let fence = SyncPoint::from(ManualFence::new(false));
        assert!(matches!(
            fence.wait(Duration::from_millis(1)),
            Err(FenceError::Timeout(_))
        ));
    }

    #[test]
    fn merged_fence_needs_both() {
        let a = ManualFence::new(true);
        let b = ManualFence::new(false);
        let b_handle = b.handle();
        let merged = SyncPoint::from(a).merge(&SyncPoint::from(b));
        assert!(!merged.is_reached());
        b_handle.signal();
        assert!(merged.is_reached());
        assert!(NativeSync.wait(&merged, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn merge_flattens() {
        let a = SyncPoint::from(ManualFence::new(true));
        let b = SyncPoint::from(ManualFence::new(true));
        let c = SyncPoint::from(ManualFence::new(true));
        let merged = a.merge(&b).merge(&c);
        assert_eq!(merged.get::<MergedFence>().map(|m| m.0.len()), Some(3));
    }
}
