//! Cluster-safe key construction
//!
//! Every key the crate writes to the distributed store goes through
//! [`KeySpace`]. Keys belonging to one subject (cache entries, the subject
//! index, cache locks) and keys belonging to one resilience instance share a
//! hash tag, so a clustered Redis routes them to the same slot and multi-key
//! scripts over them never cross shards.
//!
//! Ids are percent-encoded before they are placed inside a tag or a segment,
//! which keeps `{`, `}` and `:` inside ids from changing the key layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of scope a permission set was computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    None,
    Server,
    Channel,
}

/// Scope a permission set applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// No scope, global permissions
    Global,
    /// Server-wide permissions
    Server(String),
    /// Channel-level permissions
    Channel(String),
}

impl Scope {
    pub fn server(id: impl Into<String>) -> Self {
        Scope::Server(id.into())
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Scope::Channel(id.into())
    }

    /// Build a scope from its `(type, id)` pair
    pub fn from_parts(scope_type: ScopeType, scope_id: Option<&str>) -> Result<Self, KeyError> {
        match (scope_type, scope_id) {
            (ScopeType::None, _) => Ok(Scope::Global),
            (ScopeType::Server, Some(id)) => Ok(Scope::Server(id.to_string())),
            (ScopeType::Channel, Some(id)) => Ok(Scope::Channel(id.to_string())),
            (kind, None) => Err(KeyError::MissingScopeId(kind)),
        }
    }

    pub fn scope_type(&self) -> ScopeType {
        match self {
            Scope::Global => ScopeType::None,
            Scope::Server(_) => ScopeType::Server,
            Scope::Channel(_) => ScopeType::Channel,
        }
    }

    pub fn scope_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Server(id) | Scope::Channel(id) => Some(id),
        }
    }

    fn segment(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Server(id) => format!("server:{}", urlencoding::encode(id)),
            Scope::Channel(id) => format!("channel:{}", urlencoding::encode(id)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Server(id) => write!(f, "server:{}", id),
            Scope::Channel(id) => write!(f, "channel:{}", id),
        }
    }
}

/// Identity of one cached permission set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub subject_id: String,
    pub scope: Scope,
}

impl CacheKey {
    pub fn new(subject_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            subject_id: subject_id.into(),
            scope,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.subject_id, self.scope)
    }
}

/// Errors from parsing rendered keys
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key does not belong to namespace {0:?}")]
    ForeignNamespace(String),
    #[error("key is missing a hash tag: {0}")]
    MissingHashTag(String),
    #[error("unknown key layout: {0}")]
    UnknownLayout(String),
    #[error("invalid percent-encoding in key: {0}")]
    InvalidEncoding(String),
    #[error("scope type {0:?} requires a scope id")]
    MissingScopeId(ScopeType),
}

/// Result of parsing a rendered permission key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Entry(CacheKey),
    SubjectIndex(String),
}

impl ParsedKey {
    pub fn subject_id(&self) -> &str {
        match self {
            ParsedKey::Entry(key) => &key.subject_id,
            ParsedKey::SubjectIndex(subject) => subject,
        }
    }
}

/// Wrap a value in a hash tag
pub fn hash_tag(value: &str) -> String {
    format!("{{{}}}", urlencoding::encode(value))
}

/// Namespaced key builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, rest: String) -> String {
        if self.prefix.is_empty() {
            rest
        } else {
            format!("{}:{}", self.prefix, rest)
        }
    }

    /// L2 key of a cached permission set
    pub fn entry(&self, key: &CacheKey) -> String {
        self.join(format!(
            "perm:{}:{}",
            hash_tag(&key.subject_id),
            key.scope.segment()
        ))
    }

    /// Reverse index of every entry key issued for a subject
    pub fn subject_index(&self, subject_id: &str) -> String {
        self.join(format!("perm:{}:index", hash_tag(subject_id)))
    }

    /// Lock guarding population of one cache entry
    pub fn entry_lock(&self, key: &CacheKey) -> String {
        self.join(format!(
            "lock:perm:{}:{}",
            hash_tag(&key.subject_id),
            key.scope.segment()
        ))
    }

    /// Lock guarding an arbitrary named resource
    pub fn resource_lock(&self, resource: &str) -> String {
        self.join(format!("lock:{}", hash_tag(resource)))
    }

    pub fn breaker_state(&self, name: &str) -> String {
        self.join(format!("cb:{}:state", hash_tag(name)))
    }

    /// Rate limiter counter key; `dimension` is `all` for the combined ceiling
    pub fn rate(&self, name: &str, dimension: &str, value: Option<&str>) -> String {
        match value {
            Some(value) => self.join(format!(
                "rl:{}:{}:{}",
                hash_tag(name),
                dimension,
                urlencoding::encode(value)
            )),
            None => self.join(format!("rl:{}:{}", hash_tag(name), dimension)),
        }
    }

    pub fn bulkhead(&self, name: &str) -> String {
        self.join(format!("bh:{}:state", hash_tag(name)))
    }

    /// Stored configuration of one resilience instance
    pub fn config(&self, kind: &str, name: &str) -> String {
        self.join(format!("cfg:{}", hash_tag(&format!("{}:{}", kind, name))))
    }

    /// Set of every config key written, used by `clear_all`
    pub fn config_index(&self) -> String {
        self.join("cfg:index".to_string())
    }

    /// Parse a rendered permission key back into its parts
    pub fn parse(&self, rendered: &str) -> Result<ParsedKey, KeyError> {
        let rest = if self.prefix.is_empty() {
            rendered
        } else {
            rendered
                .strip_prefix(self.prefix.as_str())
                .and_then(|r| r.strip_prefix(':'))
                .ok_or_else(|| KeyError::ForeignNamespace(self.prefix.clone()))?
        };

        let rest = rest
            .strip_prefix("perm:")
            .ok_or_else(|| KeyError::UnknownLayout(rendered.to_string()))?;
        let rest = rest
            .strip_prefix('{')
            .ok_or_else(|| KeyError::MissingHashTag(rendered.to_string()))?;
        let close = rest
            .find('}')
            .ok_or_else(|| KeyError::MissingHashTag(rendered.to_string()))?;

        let subject = decode(&rest[..close])?;
        let tail = rest[close + 1..]
            .strip_prefix(':')
            .ok_or_else(|| KeyError::UnknownLayout(rendered.to_string()))?;

        let scope = match tail.split_once(':') {
            None if tail == "index" => return Ok(ParsedKey::SubjectIndex(subject)),
            None if tail == "global" => Scope::Global,
            Some(("server", id)) if !id.is_empty() => Scope::Server(decode(id)?),
            Some(("channel", id)) if !id.is_empty() => Scope::Channel(decode(id)?),
            _ => return Err(KeyError::UnknownLayout(rendered.to_string())),
        };

        Ok(ParsedKey::Entry(CacheKey::new(subject, scope)))
    }
}

fn decode(value: &str) -> Result<String, KeyError> {
    urlencoding::decode(value)
        .map(|s| s.into_owned())
        .map_err(|_| KeyError::InvalidEncoding(value.to_string()))
}

/// Redis Cluster slot of a key (CRC16/XMODEM of the hash tag, mod 16384)
pub fn hash_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };

    crc16(hashed) % 16384
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
