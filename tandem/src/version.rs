//! Logical clock for slot and cell versioning.
//!
//! A [`VersionProvider`] hands out [`VersionToken`]s as `(epoch, sequence)`
//! pairs. Sequences increase within an epoch; when the sequence reaches the
//! provider's limit the next token opens a new epoch at sequence zero. Tokens
//! order by epoch first, so ordering stays total and monotonic across the
//! rollover.
//!
//! Both halves live in a single 128-bit atomic word, so a token is always
//! read and advanced as one unit.

use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::Ordering;
use portable_atomic::AtomicU128;

/// An opaque, totally ordered version stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionToken {
    // Field order drives the derived ordering: epoch, then sequence.
    epoch: u64,
    sequence: u64,
}

impl VersionToken {
    /// Epoch the token was issued in.
    #[inline]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sequence number inside the epoch.
    #[inline]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Orders two tokens by recency. `Greater` means `self` is newer.
    #[inline]
    pub fn compare_to(&self, other: &VersionToken) -> CmpOrdering {
        self.cmp(other)
    }

    /// Replaces this token with a fresh one from `provider`.
    pub fn update(&mut self, provider: &VersionProvider) {
        *self = provider.advance_new_token();
    }

    #[inline]
    pub(crate) const fn pack(self) -> u128 {
        ((self.epoch as u128) << 64) | self.sequence as u128
    }

    #[inline]
    pub(crate) const fn unpack(word: u128) -> Self {
        Self {
            epoch: (word >> 64) as u64,
            sequence: word as u64,
        }
    }
}

/// A token stored in one atomic word.
///
/// Used by holders that need to renew a token while others read it.
#[repr(align(16))]
pub struct AtomicVersionToken {
    word: AtomicU128,
}

impl AtomicVersionToken {
    /// Wraps `token`.
    pub const fn new(token: VersionToken) -> Self {
        Self {
            word: AtomicU128::new(token.pack()),
        }
    }

    /// Reads the token.
    #[inline]
    pub fn load(&self) -> VersionToken {
        VersionToken::unpack(self.word.load(Ordering::Acquire))
    }

    /// Overwrites the token.
    #[inline]
    pub fn store(&self, token: VersionToken) {
        self.word.store(token.pack(), Ordering::Release);
    }
}

/// Issues monotonically ordered [`VersionToken`]s.
pub struct VersionProvider {
    state: AtomicU128,
    limit: u64,
}

impl Default for VersionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionProvider {
    /// Creates a provider that rolls over only at `u64::MAX`.
    pub const fn new() -> Self {
        Self::with_sequence_limit(u64::MAX)
    }

    /// Creates a provider whose epochs hold sequences `0..=limit`.
    pub const fn with_sequence_limit(limit: u64) -> Self {
        Self {
            state: AtomicU128::new(0),
            limit,
        }
    }

    /// The most recently issued token (the zero token before any advance).
    pub fn current(&self) -> VersionToken {
        VersionToken::unpack(self.state.load(Ordering::Acquire))
    }

    /// Allocates the next token.
    pub fn advance_new_token(&self) -> VersionToken {
        let mut word = self.state.load(Ordering::Acquire);
        loop {
            let token = VersionToken::unpack(word);
            let next = if token.sequence >= self.limit {
                VersionToken {
                    epoch: token.epoch + 1,
                    sequence: 0,
                }
            } else {
                VersionToken {
                    epoch: token.epoch,
                    sequence: token.sequence + 1,
                }
            };
            match self.state.compare_exchange_weak(
                word,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => word = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_increase() {
        let provider = VersionProvider::new();
        let a = provider.advance_new_token();
        let b = provider.advance_new_token();
        assert_eq!(a.compare_to(&b), CmpOrdering::Less);
        assert_eq!(b.compare_to(&a), CmpOrdering::Greater);
        assert_eq!(provider.current(), b);
    }

    #[test]
    fn test_rollover_opens_new_epoch() {
        let provider = VersionProvider::with_sequence_limit(2);
        let issued: Vec<_> = (0..6).map(|_| provider.advance_new_token()).collect();
        let pairs: Vec<_> = issued.iter().map(|t| (t.epoch(), t.sequence())).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 0), (1, 1), (1, 2), (2, 0)]);
        assert!(issued.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_pack_round_trip_keeps_order() {
        let older = VersionToken {
            epoch: 1,
            sequence: u64::MAX,
        };
        let newer = VersionToken {
            epoch: 2,
            sequence: 0,
        };
        assert!(older.pack() < newer.pack());
        assert_eq!(VersionToken::unpack(newer.pack()), newer);
    }

    #[test]
    fn test_update() {
        let provider = VersionProvider::new();
        let mut token = provider.advance_new_token();
        let before = token;
        token.update(&provider);
        assert!(token > before);
    }

    #[test]
    fn test_atomic_token() {
        let provider = VersionProvider::new();
        let cell = AtomicVersionToken::new(VersionToken::default());
        let token = provider.advance_new_token();
        cell.store(token);
        assert_eq!(cell.load(), token);
    }
}
