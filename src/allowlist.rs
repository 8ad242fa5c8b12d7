//! Destination authorization.

use anyhow::{Context, Result, bail};
use regex::Regex;
use std::fmt;

/// Policy deciding which destination addresses may be dialed.
///
/// An unconfigured policy allows everything. Operators opt into restriction
/// with either a regular expression or a list of address suffixes.
#[derive(Debug, Clone, Default)]
pub enum AllowList {
    #[default]
    Any,
    /// Allowed when the pattern matches somewhere in the address. Anchor with
    /// `^...$` to require a full match.
    Pattern(Regex),
    /// Allowed when the address ends with any of the suffixes.
    Suffixes(Vec<String>),
}

impl AllowList {
    /// Compiles the configured policy. Empty inputs mean "allow all"; setting
    /// both a pattern and suffixes is rejected.
    pub fn from_config(pattern: Option<&str>, suffixes: &[String]) -> Result<Self> {
        let pattern = pattern.map(str::trim).filter(|p| !p.is_empty());
        let suffixes: Vec<String> = suffixes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        match (pattern, suffixes.is_empty()) {
            (Some(_), false) => {
                bail!("Configure either an address pattern or address suffixes, not both")
            }
            (Some(pattern), true) => {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("Invalid allowed address pattern: {pattern}"))?;
                Ok(Self::Pattern(regex))
            }
            (None, false) => Ok(Self::Suffixes(suffixes)),
            (None, true) => Ok(Self::Any),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, address: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Pattern(regex) => regex.is_match(address),
            Self::Suffixes(suffixes) => suffixes
                .iter()
                .any(|suffix| address.ends_with(suffix.as_str())),
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("allow all"),
            Self::Pattern(regex) => write!(f, "pattern {}", regex.as_str()),
            Self::Suffixes(suffixes) => write!(f, "suffixes [{}]", suffixes.join(", ")),
        }
    }
}
