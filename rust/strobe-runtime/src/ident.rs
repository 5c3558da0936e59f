//! Synthetic identifiers handed to the host for producer-owned entities.
//!
//! An identifier renders as `@<tag>-<kind>-<index>`, e.g. `@mixer-sink-3`.
//! The index is the producer's own index for the external entity, so the
//! identifier stays stable while the entity lives and is never handed out
//! for a different entity while the producer keeps its index unique.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyntheticId {
    pub tag: String,
    pub kind: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("synthetic id must start with '@'")]
    MissingSigil,
    #[error("synthetic id '{0}' is not of the form @tag-kind-index")]
    Shape(String),
    #[error("synthetic id index '{0}' is not a number")]
    Index(String),
}

impl SyntheticId {
    pub fn new(tag: impl Into<String>, kind: impl Into<String>, index: u32) -> Self {
        Self {
            tag: tag.into(),
            kind: kind.into(),
            index,
        }
    }

    /// Whether `s` looks like an identifier minted for `tag`.
    pub fn has_tag(s: &str, tag: &str) -> bool {
        s.strip_prefix('@')
            .and_then(|rest| rest.strip_prefix(tag))
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl fmt::Display for SyntheticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}-{}-{}", self.tag, self.kind, self.index)
    }
}

impl FromStr for SyntheticId {
    type Err = IdParseError;

    /// The tag is everything up to the first '-', the index everything after
    /// the last one, so kinds may contain dashes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix('@').ok_or(IdParseError::MissingSigil)?;
        let (tag, rest) = body
            .split_once('-')
            .ok_or_else(|| IdParseError::Shape(s.to_string()))?;
        let (kind, index) = rest
            .rsplit_once('-')
            .ok_or_else(|| IdParseError::Shape(s.to_string()))?;
        if tag.is_empty() || kind.is_empty() {
            return Err(IdParseError::Shape(s.to_string()));
        }
        let index = index
            .parse::<u32>()
            .map_err(|_| IdParseError::Index(index.to_string()))?;
        Ok(SyntheticId::new(tag, kind, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse() {
        let id = SyntheticId::new("mixer", "sink", 3);
        assert_eq!(id.to_string(), "@mixer-sink-3");
        assert_eq!("@mixer-sink-3".parse::<SyntheticId>().unwrap(), id);
    }

    #[test]
    fn test_kind_with_dash() {
        let id: SyntheticId = "@tray-status-item-12".parse().unwrap();
        assert_eq!(id.tag, "tray");
        assert_eq!(id.kind, "status-item");
        assert_eq!(id.index, 12);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("mixer-sink-3".parse::<SyntheticId>(), Err(IdParseError::MissingSigil));
        assert!(matches!("@mixer".parse::<SyntheticId>(), Err(IdParseError::Shape(_))));
        assert!(matches!("@mixer-sink-x".parse::<SyntheticId>(), Err(IdParseError::Index(_))));
    }

    #[test]
    fn test_has_tag() {
        assert!(SyntheticId::has_tag("@mixer-sink-1", "mixer"));
        assert!(!SyntheticId::has_tag("@mixers-sink-1", "mixer"));
        assert!(!SyntheticId::has_tag("alsa_output.pci", "mixer"));
    }
}
