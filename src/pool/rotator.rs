use std::{fmt, os::unix::io::RawFd};

use tracing::trace;

use super::{Claim, DisplayId};
use crate::{
    format::{self, Fourcc},
    utils::{Buffer, Rectangle, Size, Transform},
};

/// Stable index of a session inside a [`RotatorPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RotatorId(pub(crate) usize);

impl RotatorId {
    /// Position of the session in the pool
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Geometry a rotator session is programmed with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatorConfig {
    /// Size of the input buffer
    pub src_size: Size<u32, Buffer>,
    /// Region of the input buffer to rotate
    pub crop: Rectangle<f64, Buffer>,
    /// Input format, the output keeps it
    pub format: Fourcc,
    /// Rotation and flips to apply
    pub transform: Transform,
    /// Horizontal and vertical downscale factors
    pub downscale: (u32, u32),
    /// Whether the input is protected
    pub secure: bool,
}

impl RotatorConfig {
    /// Size of the rotated and downscaled output
    pub fn output_size(&self) -> Size<u32, Buffer> {
        let rotated = self.transform.transform_size(self.crop.size);
        Size::from((
            (rotated.w / f64::from(self.downscale.0.max(1))).ceil() as u32,
            (rotated.h / f64::from(self.downscale.1.max(1))).ceil() as u32,
        ))
    }

    /// Bytes needed for one output buffer
    pub fn output_bytes(&self) -> u64 {
        let size = self.output_size();
        (f64::from(size.w) * f64::from(size.h) * format::bytes_per_pixel(self.format)).ceil() as u64
    }
}

/// Input buffer identity of a rotator session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RotatorData {
    /// File descriptor of the input buffer
    pub fd: RawFd,
    /// Offset of the image inside `fd`
    pub offset: u64,
}

/// One half of the double-buffered rotator output memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotatorBuffer {
    /// Allocated bytes, zero if not allocated
    pub size: u64,
    /// Number of times the rotator wrote to this buffer
    pub writes: u64,
}

/// A rotator context with its own output memory
///
/// The session keeps the configuration and input it was last committed with,
/// so repeated frames can skip reprogramming the hardware. Output is written
/// alternately into two buffers, so the buffer a pipe currently scans out from
/// is never overwritten.
#[derive(Debug, Default)]
pub struct RotatorSession {
    claim: Claim,
    config: Option<RotatorConfig>,
    data: Option<RotatorData>,
    buffers: [RotatorBuffer; 2],
    current: usize,
}

impl RotatorSession {
    /// Whether committing `config` requires reprogramming the session
    pub fn rot_conf_changed(&self, config: &RotatorConfig) -> bool {
        self.config.as_ref() != Some(config)
    }

    /// Whether committing `data` requires a new rotation pass
    pub fn rot_data_changed(&self, data: &RotatorData) -> bool {
        self.data.as_ref() != Some(data)
    }

    /// Configuration of the last commit
    pub fn config(&self) -> Option<&RotatorConfig> {
        self.config.as_ref()
    }

    /// Output buffer holding the result of the last rotation pass
    pub fn current_buffer(&self) -> (usize, &RotatorBuffer) {
        (self.current, &self.buffers[self.current])
    }

    /// Record that the session was committed with `config` and `data`
    ///
    /// A configuration change reallocates the output memory, new input data
    /// advances to the other output buffer. Returns whether the hardware had
    /// to run a rotation pass.
    pub fn commit(&mut self, config: RotatorConfig, data: RotatorData) -> bool {
        let conf_changed = self.rot_conf_changed(&config);
        let data_changed = self.rot_data_changed(&data);

        if conf_changed {
            let bytes = config.output_bytes();
            for buffer in &mut self.buffers {
                if buffer.size != bytes {
                    *buffer = RotatorBuffer { size: bytes, writes: 0 };
                }
            }
        }

        let rotate = conf_changed || data_changed;
        if rotate {
            self.current = (self.current + 1) % self.buffers.len();
            self.buffers[self.current].writes += 1;
        }

        self.config = Some(config);
        self.data = Some(data);
        rotate
    }

    fn reset(&mut self) {
        self.config = None;
        self.data = None;
        self.buffers = Default::default();
        self.current = 0;
    }
}

/// The rotator sessions shared by all displays
#[derive(Debug)]
pub struct RotatorPool {
    sessions: Vec<RotatorSession>,
    // acquisition order of pending claims, for `mark_unused_top`
    acquired: Vec<(DisplayId, RotatorId)>,
}

impl RotatorPool {
    /// Create a pool with `count` sessions
    pub fn new(count: usize) -> Self {
        RotatorPool {
            sessions: (0..count).map(|_| RotatorSession::default()).collect(),
            acquired: Vec::with_capacity(count),
        }
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the pool has no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Access a session
    pub fn session(&self, id: RotatorId) -> Option<&RotatorSession> {
        self.sessions.get(id.0)
    }

    /// Claim a session for `config` for the next frame of `owner`
    ///
    /// A session last committed with the same configuration is preferred, then
    /// a free one, then one `owner` committed with a different configuration.
    /// Returns `None` once every session is claimed.
    pub fn acquire(&mut self, owner: DisplayId, config: &RotatorConfig) -> Option<RotatorId> {
        let position = |predicate: &dyn Fn(&RotatorSession) -> bool| {
            self.sessions
                .iter()
                .position(|s| s.claim.available_to(owner) && predicate(s))
        };

        let index = position(&|s| !s.rot_conf_changed(config))
            .or_else(|| position(&|s| s.claim.is_free()))
            .or_else(|| position(&|_| true))?;

        let session = &mut self.sessions[index];
        if session.claim.committed.is_none() && session.rot_conf_changed(config) {
            // stale memory of a previous owner
            session.reset();
        }
        session.claim.pending = Some(owner);
        self.acquired.push((owner, RotatorId(index)));
        trace!(session = index, %owner, "acquired rotator session");
        Some(RotatorId(index))
    }

    /// Return the `count` sessions most recently claimed by `owner`
    ///
    /// Used to roll back a failed allocation attempt without touching claims
    /// made by earlier attempts or other displays.
    pub fn mark_unused_top(&mut self, owner: DisplayId, count: usize) {
        let mut remaining = count;
        let mut index = self.acquired.len();
        while remaining > 0 && index > 0 {
            index -= 1;
            let (claimant, id) = self.acquired[index];
            if claimant == owner {
                self.acquired.remove(index);
                self.sessions[id.0].claim.pending = None;
                remaining -= 1;
            }
        }
    }

    /// Record the configuration committed on a pending session of `owner`
    ///
    /// Returns whether the hardware had to run a rotation pass.
    pub fn commit_session(&mut self, id: RotatorId, config: RotatorConfig, data: RotatorData) -> bool {
        match self.sessions.get_mut(id.0) {
            Some(session) => session.commit(config, data),
            None => false,
        }
    }

    /// Apply the commit of a frame of `owner`
    ///
    /// Returns the number of sessions that got freed.
    pub fn commit(&mut self, owner: DisplayId) -> usize {
        self.acquired.retain(|(claimant, _)| *claimant != owner);
        self.sessions
            .iter_mut()
            .map(|session| session.claim.commit(owner))
            .filter(|freed| *freed)
            .count()
    }

    /// Drop all pending claims of `owner`, keeping its committed sessions
    pub fn discard_pending(&mut self, owner: DisplayId) {
        let pending = self.acquired.iter().filter(|(c, _)| *c == owner).count();
        self.mark_unused_top(owner, pending);
    }

    /// Drop every claim of `owner` and forget the sessions' state
    pub fn release_display(&mut self, owner: DisplayId) {
        self.acquired.retain(|(claimant, _)| *claimant != owner);
        for session in &mut self.sessions {
            if session.claim.pending == Some(owner) || session.claim.committed == Some(owner) {
                session.claim.clear(owner);
                session.reset();
            }
        }
    }

    /// Number of sessions claimed by any display
    pub fn in_use(&self) -> usize {
        self.sessions.iter().filter(|s| !s.claim.is_free()).count()
    }

    /// Write a line per session describing its occupancy
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (index, session) in self.sessions.iter().enumerate() {
            write!(out, "  rotator {index} {}", session.claim)?;
            if let Some(config) = session.config.as_ref() {
                let size = config.output_size();
                write!(
                    out,
                    " {}x{} {:?} {:?} buffer {}",
                    size.w, size.h, config.format, config.transform, session.current
                )?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: DisplayId = DisplayId(0);
    const B: DisplayId = DisplayId(1);

    fn config(transform: Transform) -> RotatorConfig {
        RotatorConfig {
            src_size: Size::from((1920, 1080)),
            crop: Rectangle::from_size((1920.0, 1080.0).into()),
            format: Fourcc::Nv12,
            transform,
            downscale: (1, 1),
            secure: false,
        }
    }

    const DATA: RotatorData = RotatorData { fd: 10, offset: 0 };

    #[test]
    fn identical_resubmission_needs_no_reprogram() {
        let mut session = RotatorSession::default();
        assert!(session.commit(config(Transform::_90), DATA));
        assert!(!session.rot_conf_changed(&config(Transform::_90)));
        assert!(!session.rot_data_changed(&DATA));
        let (index, _) = session.current_buffer();
        assert!(!session.commit(config(Transform::_90), DATA));
        assert_eq!(session.current_buffer().0, index);
    }

    #[test]
    fn new_data_flips_output_buffer() {
        let mut session = RotatorSession::default();
        session.commit(config(Transform::_90), DATA);
        let (first, _) = session.current_buffer();
        assert!(session.rot_data_changed(&RotatorData { fd: 11, offset: 0 }));
        assert!(session.commit(config(Transform::_90), RotatorData { fd: 11, offset: 0 }));
        assert_ne!(session.current_buffer().0, first);
        assert_eq!(session.current_buffer().1.size, 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn output_size_is_transposed_and_downscaled() {
        let mut cfg = config(Transform::_270);
        cfg.downscale = (2, 4);
        assert_eq!(cfg.output_size(), Size::from((540, 480)));
    }

    #[test]
    fn exhausting_pool_returns_none() {
        let mut pool = RotatorPool::new(2);
        let cfg = config(Transform::_90);
        assert!(pool.acquire(A, &cfg).is_some());
        assert!(pool.acquire(B, &cfg).is_some());
        assert!(pool.acquire(A, &cfg).is_none());
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn mark_unused_top_only_touches_owner() {
        let mut pool = RotatorPool::new(4);
        let cfg = config(Transform::_90);
        let a0 = pool.acquire(A, &cfg).unwrap();
        let b0 = pool.acquire(B, &cfg).unwrap();
        let a1 = pool.acquire(A, &cfg).unwrap();
        pool.mark_unused_top(A, 1);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.acquire(A, &cfg), Some(a1));
        assert_ne!(a0, b0);
    }

    #[test]
    fn matching_committed_session_is_preferred() {
        let mut pool = RotatorPool::new(3);
        let cfg = config(Transform::_90);
        let other = config(Transform::_270);
        let first = pool.acquire(A, &other).unwrap();
        let second = pool.acquire(A, &cfg).unwrap();
        pool.commit_session(first, other, DATA);
        pool.commit_session(second, cfg, DATA);
        pool.commit(A);

        let again = pool.acquire(A, &cfg).unwrap();
        assert_eq!(again, second);
        assert!(!pool.session(again).unwrap().rot_conf_changed(&cfg));
    }
}
