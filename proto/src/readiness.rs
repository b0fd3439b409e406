//! Readiness bitset used by the level-triggered poll protocol.

bitflags::bitflags! {
    /// The three readiness conditions a pseudo-device can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READABLE = 1;
        const WRITABLE = 2;
        const EXCEPTION = 4;
    }
}

/// Cached readiness state meaning "the provider declined to answer diffs".
/// All negative provider replies are clamped to this sentinel.
pub const POLL_DISABLED: i32 = -1;

impl Readiness {
    /// Interpret a raw cached state. Non-positive states (unknown or
    /// disabled) report nothing ready.
    pub fn from_state(state: i32) -> Self {
        if state <= 0 {
            Readiness::empty()
        } else {
            Readiness::from_bits_truncate(state as u32)
        }
    }
}
