use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Separator between path segments in the dotted rendering.
pub const SEPARATOR: char = '.';

/// Key prefix of the value tree in the backing store.
pub(crate) const VALUE_PREFIX: &str = "v:";
/// Key prefix of the lock tree. Kept disjoint from the value tree so lock
/// records never shadow data.
pub(crate) const LOCK_PREFIX: &str = "l:";
/// Marker between a lock key and the holder token of an intention record.
pub(crate) const TOKEN_MARK: char = '#';

/// A node address in the hierarchy: an ordered sequence of non-empty
/// segments. The empty sequence is the root.
///
/// Segments may not be empty, contain the separator, or contain `#`
/// (reserved for intention-lock record keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    segments: Vec<String>,
}

fn validate_segment(segment: &str, original: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidPath {
            path: original.to_string(),
            reason: "empty segment",
        });
    }
    if segment.contains(SEPARATOR) {
        return Err(Error::InvalidPath {
            path: original.to_string(),
            reason: "segment contains separator",
        });
    }
    if segment.contains(TOKEN_MARK) {
        return Err(Error::InvalidPath {
            path: original.to_string(),
            reason: "segment contains reserved character '#'",
        });
    }
    Ok(())
}

impl Path {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path like `a.b.c`. The empty string is the root.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in input.split(SEPARATOR) {
            validate_segment(segment, input)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from individual segments, validating each one.
    pub fn from_segments<I, S>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments = Vec::new();
        for segment in iter {
            let segment = segment.as_ref();
            validate_segment(segment, segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Append a single validated segment.
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment, segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Append a dotted relative path.
    pub fn join(&self, relative: &str) -> Result<Self> {
        let tail = Self::parse(relative)?;
        let mut segments = self.segments.clone();
        segments.extend(tail.segments);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// All strict ancestors, root first, the immediate parent last.
    /// Empty for the root itself. This is the lock-chain walk order.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.segments.len()).map(move |depth| Path {
            segments: self.segments[..depth].to_vec(),
        })
    }

    /// True iff `self`'s segments are a proper prefix of `other`'s.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Store key of this node's value. The root is the bare prefix; every
    /// descendant key extends its parent's key with `.<segment>`, so prefix
    /// scans of `<key>.` enumerate exactly the descendants.
    pub(crate) fn value_key(&self) -> String {
        Self::encode(VALUE_PREFIX, &self.segments)
    }

    /// Store key of this node's exclusive lock record. Intention records
    /// for the same path live at `<lock_key>#<token>`.
    pub(crate) fn lock_key(&self) -> String {
        Self::encode(LOCK_PREFIX, &self.segments)
    }

    fn encode(prefix: &str, segments: &[String]) -> String {
        let mut key = String::from(prefix);
        for segment in segments {
            key.push(SEPARATOR);
            key.push_str(segment);
        }
        key
    }

    /// Invert `value_key`. Returns `None` for keys outside the value tree.
    pub(crate) fn from_value_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(VALUE_PREFIX)?;
        if rest.is_empty() {
            return Some(Self::root());
        }
        let rest = rest.strip_prefix(SEPARATOR)?;
        Self::parse(rest).ok()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
