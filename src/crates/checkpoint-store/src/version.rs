//! Channel version tokens
//!
//! A version token is a fixed-width string `"<counter>.<tiebreak>"`: a 32-digit
//! zero-padded counter followed by a 16-digit zero-padded random tiebreak.
//! Fixed width makes lexicographic order equal to `(counter, tiebreak)` order,
//! so tokens can be compared as plain strings in SQL and in memory.
//!
//! Two writers computing [`VersionGenerator::next`] from the same base get the
//! same counter but (practically always) different tiebreaks, so both tokens
//! sort after the base without colliding. Callers deciding whether a write is
//! stale must compare with "greater than", never with exact equality.

use crate::error::{CheckpointError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const COUNTER_WIDTH: usize = 32;
const TIEBREAK_WIDTH: usize = 16;
const TIEBREAK_BOUND: u64 = 10_000_000_000_000_000;
/// Largest counter that fits the fixed width
pub const MAX_COUNTER: u128 = 10u128.pow(COUNTER_WIDTH as u32) - 1;

/// Version token of a single channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelVersion(String);

impl ChannelVersion {
    /// Build a token from its parts; `None` when the counter exceeds [`MAX_COUNTER`]
    pub fn from_parts(counter: u128, tiebreak: u64) -> Option<Self> {
        if counter > MAX_COUNTER {
            return None;
        }
        Some(Self(format!(
            "{:0cw$}.{:0tw$}",
            counter,
            tiebreak % TIEBREAK_BOUND,
            cw = COUNTER_WIDTH,
            tw = TIEBREAK_WIDTH
        )))
    }

    /// Wrap an already formatted token.
    ///
    /// Bare integers written by older engines are normalized to the
    /// fixed-width form with a zero tiebreak so they keep sorting correctly.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let (counter, tiebreak) = split(&raw)?;
        if raw.contains('.') && raw.len() == COUNTER_WIDTH + 1 + TIEBREAK_WIDTH {
            Some(Self(raw))
        } else {
            Self::from_parts(counter, tiebreak)
        }
    }

    /// `(counter, tiebreak)`
    pub fn parts(&self) -> (u128, u64) {
        split(&self.0).unwrap_or((0, 0))
    }

    pub fn counter(&self) -> u128 {
        self.parts().0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn split(raw: &str) -> Option<(u128, u64)> {
    match raw.split_once('.') {
        Some((counter, tiebreak)) => Some((counter.parse().ok()?, tiebreak.parse().ok()?)),
        None => Some((raw.parse().ok()?, 0)),
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ChannelVersion> for String {
    fn from(v: ChannelVersion) -> Self {
        v.0
    }
}

/// Produces the next version token for a channel
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionGenerator;

impl VersionGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Next token after `current`; `None` starts the counter at zero.
    ///
    /// Fails with [`CheckpointError::Invalid`] once the counter is exhausted.
    pub fn next(&self, current: Option<&ChannelVersion>) -> Result<ChannelVersion> {
        let counter = match current {
            Some(v) => v.counter().checked_add(1),
            None => Some(0),
        };
        let tiebreak = rand::thread_rng().gen_range(0..TIEBREAK_BOUND);
        counter
            .and_then(|counter| ChannelVersion::from_parts(counter, tiebreak))
            .ok_or_else(|| {
                CheckpointError::Invalid(format!(
                    "channel version counter exhausted after {}",
                    current.map(|v| v.as_str()).unwrap_or_default()
                ))
            })
    }
}
