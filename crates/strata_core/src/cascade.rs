//! Cascade policies: which tiers a mutation must reach.

use crate::error::{CoreError, CoreResult};
use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// A bit-set over tiers describing how far a save or remove propagates.
///
/// Two independent policies exist per model and per relation: one for save
/// propagation and one for remove propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cascade(u8);

impl Cascade {
    /// Reach no tier at all.
    pub const NONE: Cascade = Cascade(0);
    /// Local cache only.
    pub const LOCAL: Cascade = Cascade(1);
    /// Remote authoritative service only.
    pub const REST: Cascade = Cascade(2);
    /// Live broadcast channel only.
    pub const LIVE: Cascade = Cascade(4);
    /// Remote service plus live broadcast.
    pub const REMOTE: Cascade = Cascade(2 | 4);
    /// All three tiers.
    pub const ALL: Cascade = Cascade(1 | 2 | 4);

    /// Builds a cascade from raw bits. Bits outside the three tiers are
    /// rejected.
    pub fn from_bits(bits: u8) -> CoreResult<Self> {
        if bits <= Self::ALL.0 {
            Ok(Cascade(bits))
        } else {
            Err(CoreError::InvalidCascade { bits })
        }
    }

    /// Returns the raw bits.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Returns true if the cascade reaches the given tier.
    #[must_use]
    pub fn includes(&self, tier: Tier) -> bool {
        self.0 & Cascade::from(tier).0 != 0
    }

    /// Returns true if no tier is reached.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Resolves the ordered list of tiers to enact.
    ///
    /// The local tier always comes first when included, so local observers
    /// see the change immediately and later operations read a consistent
    /// snapshot; then the remote service, then the live broadcast.
    #[must_use]
    pub fn tiers(&self) -> Vec<Tier> {
        [Tier::Local, Tier::Remote, Tier::Live]
            .into_iter()
            .filter(|tier| self.includes(*tier))
            .collect()
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade::ALL
    }
}

impl From<Tier> for Cascade {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Local => Cascade::LOCAL,
            Tier::Remote => Cascade::REST,
            Tier::Live => Cascade::LIVE,
        }
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Self) -> Self::Output {
        Cascade(self.0 | rhs.0)
    }
}

impl BitAnd for Cascade {
    type Output = Cascade;

    fn bitand(self, rhs: Self) -> Self::Output {
        Cascade(self.0 & rhs.0)
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Cascade::NONE => write!(f, "none"),
            Cascade::ALL => write!(f, "all"),
            Cascade::REMOTE => write!(f, "remote"),
            other => {
                let mut first = true;
                for tier in other.tiers() {
                    if !first {
                        write!(f, "+")?;
                    }
                    write!(f, "{tier}")?;
                    first = false;
                }
                if first {
                    write!(f, "none")?;
                }
                Ok(())
            }
        }
    }
}
