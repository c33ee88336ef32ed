/// Namespaced byte keys
///
/// Every key is a single category tag byte followed by the raw identifier
/// bytes. Range scans over a category rely on the tag being a unique prefix.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Logical key namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCategory {
    /// Internal bookkeeping (maintenance run counters)
    SystemCounter,
    /// Persisted global statistics counters
    GlobalStat,
    /// Short id records
    Record,
}

impl KeyCategory {
    pub const ALL: [KeyCategory; 3] = [
        KeyCategory::SystemCounter,
        KeyCategory::GlobalStat,
        KeyCategory::Record,
    ];

    /// The tag byte that prefixes every key of this category
    pub const fn tag(self) -> u8 {
        match self {
            KeyCategory::SystemCounter => 0x00,
            KeyCategory::GlobalStat => 0x02,
            KeyCategory::Record => 0x04,
        }
    }

    /// Prefix for scanning every key of this category
    pub fn prefix(self) -> [u8; 1] {
        [self.tag()]
    }
}

const fn tags_are_unique() -> bool {
    let all = KeyCategory::ALL;
    let mut i = 0;
    while i < all.len() {
        let mut j = i + 1;
        while j < all.len() {
            if all[i].tag() == all[j].tag() {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(tags_are_unique(), "key category tags must not collide");

/// Build the key for `id` in `category`
pub fn encode(category: KeyCategory, id: &str) -> Result<Bytes> {
    if id.is_empty() {
        return Err(Error::EmptyIdentifier);
    }
    let mut buf = BytesMut::with_capacity(id.len() + 1);
    buf.put_u8(category.tag());
    buf.put_slice(id.as_bytes());
    Ok(buf.freeze())
}

/// Split a key back into its category and identifier
pub fn decode(key: &[u8]) -> Option<(KeyCategory, &str)> {
    let (&tag, rest) = key.split_first()?;
    let category = KeyCategory::ALL.into_iter().find(|c| c.tag() == tag)?;
    let id = std::str::from_utf8(rest).ok()?;
    if id.is_empty() {
        return None;
    }
    Some((category, id))
}
