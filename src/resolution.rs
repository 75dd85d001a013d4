//! Target resolutions for the game and the desktop.
//!
//! `ResolutionConfig` holds the pair that the engine applies on match entry
//! and exit. The pair is swapped wholesale, never edited field by field, so a
//! reader always sees a consistent game/desktop combination.

use crate::error::ResolutionParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

/// A display mode with strictly positive dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Create a resolution, rejecting zero dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, ResolutionParseError> {
        if width == 0 || height == 0 {
            return Err(ResolutionParseError::ZeroDimension { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ResolutionParseError;

    /// Parse `1920x1080`. Surrounding whitespace and an uppercase `X` are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (w, h) = trimmed
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(|| ResolutionParseError::Malformed(s.to_string()))?;

        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| ResolutionParseError::Malformed(s.to_string()))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| ResolutionParseError::Malformed(s.to_string()))?;

        Resolution::new(width, height)
    }
}

// Serialized as the "WIDTHxHEIGHT" text the frontend already sends.
impl Serialize for Resolution {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which of the two configured resolutions an action refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTarget {
    Game,
    Desktop,
}

/// The game and desktop resolutions, always replaced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPair {
    pub game: Resolution,
    pub desktop: Resolution,
}

impl ResolutionPair {
    pub fn new(game: Resolution, desktop: Resolution) -> Self {
        Self { game, desktop }
    }

    pub fn get(&self, target: ResolutionTarget) -> Resolution {
        match target {
            ResolutionTarget::Game => self.game,
            ResolutionTarget::Desktop => self.desktop,
        }
    }
}

impl Default for ResolutionPair {
    fn default() -> Self {
        Self {
            game: Resolution {
                width: 1440,
                height: 1080,
            },
            desktop: Resolution {
                width: 1920,
                height: 1080,
            },
        }
    }
}

/// Live, hot-swappable resolution pair.
///
/// Read on every resolution-change action; an update takes effect on the
/// next action and never resets monitoring state.
pub struct ResolutionConfig {
    pair: RwLock<ResolutionPair>,
}

impl ResolutionConfig {
    pub fn new(pair: ResolutionPair) -> Self {
        Self {
            pair: RwLock::new(pair),
        }
    }

    /// Current pair.
    pub fn get(&self) -> ResolutionPair {
        self.pair
            .read()
            .map(|p| *p)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Resolve one side of the current pair.
    pub fn resolve(&self, target: ResolutionTarget) -> Resolution {
        self.get().get(target)
    }

    /// Replace both resolutions at once.
    pub fn replace(&self, pair: ResolutionPair) {
        match self.pair.write() {
            Ok(mut current) => *current = pair,
            Err(poisoned) => *poisoned.into_inner() = pair,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_resolution() {
        let res: Resolution = "1920x1080".parse().unwrap();
        assert_eq!(res.width(), 1920);
        assert_eq!(res.height(), 1080);

        let res: Resolution = " 1440 X 1080 ".parse().unwrap();
        assert_eq!(res.to_string(), "1440x1080");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "1920".parse::<Resolution>(),
            Err(ResolutionParseError::Malformed(_))
        ));
        assert!(matches!(
            "axb".parse::<Resolution>(),
            Err(ResolutionParseError::Malformed(_))
        ));
        assert!(matches!(
            "-1x1080".parse::<Resolution>(),
            Err(ResolutionParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert_eq!(
            "0x1080".parse::<Resolution>(),
            Err(ResolutionParseError::ZeroDimension {
                width: 0,
                height: 1080
            })
        );
        assert!(Resolution::new(1920, 0).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let pair = ResolutionPair::default();
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, r#"{"game":"1440x1080","desktop":"1920x1080"}"#);

        let parsed: ResolutionPair = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pair);

        let bad: Result<ResolutionPair, _> =
            serde_json::from_str(r#"{"game":"0x0","desktop":"1920x1080"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_replace_swaps_both_sides() {
        let config = ResolutionConfig::new(ResolutionPair::default());
        let new_pair = ResolutionPair::new(
            Resolution::new(1280, 960).unwrap(),
            Resolution::new(2560, 1440).unwrap(),
        );
        config.replace(new_pair);

        assert_eq!(config.get(), new_pair);
        assert_eq!(config.resolve(ResolutionTarget::Game).to_string(), "1280x960");
        assert_eq!(
            config.resolve(ResolutionTarget::Desktop).to_string(),
            "2560x1440"
        );
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_positive_dimensions(
            width in 1u32..20_000,
            height in 1u32..20_000,
            upper in any::<bool>(),
        ) {
            let sep = if upper { 'X' } else { 'x' };
            let res: Resolution = format!("{}{}{}", width, sep, height).parse().unwrap();
            prop_assert_eq!(res.width(), width);
            prop_assert_eq!(res.height(), height);
        }

        #[test]
        fn prop_parse_rejects_zero_side(other in 0u32..20_000, zero_width in any::<bool>()) {
            let text = if zero_width {
                format!("0x{}", other)
            } else {
                format!("{}x0", other)
            };
            prop_assert!(text.parse::<Resolution>().is_err());
        }
    }
}
