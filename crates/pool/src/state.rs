//! Handle lifecycle states.
//!
//! A handle's state lives in an [`AtomicState`] and only changes through
//! [`AtomicState::transition`], a compare-and-swap checked against the table
//! in [`State::can_transition_to`]. Foreground acquire/return and the
//! housekeeping sweeps race on the same handle through these transitions
//! alone; whoever loses the CAS backs off.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum State {
    /// Created by the factory, not yet published to the pool.
    New = 0,
    /// Idle and available to acquirers.
    CheckedIn = 1,
    /// Held by exactly one caller.
    CheckedOut = 2,
    /// Being probed by the validation sweep.
    Validation = 3,
    /// Marked for destruction ("flush"); the connection is about to close.
    ToDestroy = 4,
    /// Closed and removed from the pool. Terminal.
    Destroyed = 5,
}

impl State {
    /// Every state, in discriminant order.
    pub const ALL: [Self; 6] = [
        Self::New,
        Self::CheckedIn,
        Self::CheckedOut,
        Self::Validation,
        Self::ToDestroy,
        Self::Destroyed,
    ];

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::New | Self::CheckedOut | Self::Validation, Self::CheckedIn)
                | (Self::CheckedIn, Self::CheckedOut | Self::Validation)
                | (
                    Self::New | Self::CheckedIn | Self::CheckedOut | Self::Validation,
                    Self::ToDestroy
                )
                | (Self::ToDestroy, Self::Destroyed)
        )
    }

    /// Whether the handle can never change state again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether the handle still belongs to the pool.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Destroyed)
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::CheckedIn,
            2 => Self::CheckedOut,
            3 => Self::Validation,
            4 => Self::ToDestroy,
            _ => Self::Destroyed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::CheckedIn => write!(f, "checked-in"),
            Self::CheckedOut => write!(f, "checked-out"),
            Self::Validation => write!(f, "validation"),
            Self::ToDestroy => write!(f, "to-destroy"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Atomically updated [`State`].
pub struct AtomicState(AtomicU8);

impl AtomicState {
    /// Create a cell holding `state`.
    #[must_use]
    pub const fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state.
    #[must_use]
    pub fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`.
    ///
    /// Returns `false` without touching the cell when the transition is not in
    /// the table or the current state is not `from`.
    pub fn transition(&self, from: State, to: State) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicState").field(&self.load()).finish()
    }
}
