use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An object identifier: a non-empty sequence of unsigned 32-bit
/// sub-identifiers.
///
/// Ordering is lexicographic over the component sequence, not textual:
/// `1.3.6.1.2 < 1.3.6.1.10`, and a strict prefix sorts before any of its
/// extensions. That is exactly the order a GETNEXT walk has to follow, so
/// `Oid` can be used directly as a `BTreeMap` key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(Vec<u32>);

impl Oid {
    /// Build from raw sub-identifiers. Fails on an empty slice.
    pub fn from_parts(parts: &[u32]) -> Result<Self, Error> {
        if parts.is_empty() {
            return Err(Error::InvalidOid("empty OID".to_string()));
        }
        Ok(Oid(parts.to_vec()))
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false // by construction
    }

    /// True if every component of `self` matches the head of `other`.
    /// Matching is at component boundaries: `1.3.6.1.2` is a prefix of
    /// `1.3.6.1.2.5` but not of `1.3.6.1.25`.
    pub fn is_prefix_of(&self, other: &Oid) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// `self` extended by one sub-identifier.
    pub fn child(&self, sub_id: u32) -> Oid {
        let mut parts = self.0.clone();
        parts.push(sub_id);
        Oid(parts)
    }

    /// `self` extended by all components of `suffix`.
    pub fn join(&self, suffix: &Oid) -> Oid {
        let mut parts = self.0.clone();
        parts.extend_from_slice(&suffix.0);
        Oid(parts)
    }
}

impl FromStr for Oid {
    type Err = Error;

    /// Parse dotted decimal. Surrounding whitespace and dots are stripped,
    /// so `" .1.3.6.1. "` parses the same as `"1.3.6.1"`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let trimmed = s.trim().trim_matches('.');
        if trimmed.is_empty() {
            return Err(Error::InvalidOid(s.to_string()));
        }

        let mut parts = Vec::new();
        for component in trimmed.split('.') {
            match component.parse::<u32>() {
                Ok(n) => parts.push(n),
                Err(_) => return Err(Error::InvalidOid(s.to_string())),
            }
        }

        Ok(Oid(parts))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}
