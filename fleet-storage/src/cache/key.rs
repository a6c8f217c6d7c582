//! Composite cache keys.
//!
//! A `CacheKey` can only be built from an [`EntityType`] plus an
//! identifier, so two entity kinds sharing an identifier (a tenant id is
//! both a namespace key and a settings scope) never collide.

use fleet_core::EntityType;
use std::fmt;

/// Separator between the entity kind and the identifier.
const SEPARATOR: char = '/';

/// Cache key of the form `entity_kind/identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

/// Private inner struct - prevents construction without an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    entity_type: EntityType,
    identifier: String,
}

impl CacheKey {
    pub fn new(entity_type: EntityType, identifier: impl Into<String>) -> Self {
        Self {
            inner: CacheKeyInner {
                entity_type,
                identifier: identifier.into(),
            },
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.inner.entity_type
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Bytes used as the backend key.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse bytes produced by [`encode`](Self::encode).
    ///
    /// Only the first separator splits, so identifiers may contain `/`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(bytes).ok()?;
        let (kind, identifier) = s.split_once(SEPARATOR)?;
        let entity_type = kind.parse().ok()?;
        Some(Self::new(entity_type, identifier))
    }

    /// Prefix shared by every key of one entity kind.
    pub fn type_prefix(entity_type: EntityType) -> Vec<u8> {
        format!("{}{}", entity_type.as_str(), SEPARATOR).into_bytes()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.inner.entity_type.as_str(),
            SEPARATOR,
            self.inner.identifier
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_display_is_kind_slash_identifier() {
        let key = CacheKey::new(EntityType::Device, "abc");
        assert_eq!(key.to_string(), "device/abc");
    }

    #[test]
    fn test_same_identifier_different_kind_differs() {
        let ns = CacheKey::new(EntityType::Namespace, "t1");
        let settings = CacheKey::new(EntityType::SystemSettings, "t1");
        assert_ne!(ns.encode(), settings.encode());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(CacheKey::decode(b"widget/1").is_none());
        assert!(CacheKey::decode(b"no-separator").is_none());
    }

    #[test]
    fn test_encoded_key_starts_with_type_prefix() {
        let key = CacheKey::new(EntityType::User, "u1");
        assert!(key
            .encode()
            .starts_with(&CacheKey::type_prefix(EntityType::User)));
    }

    fn entity_type_strategy() -> impl Strategy<Value = EntityType> {
        proptest::sample::select(EntityType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            entity_type in entity_type_strategy(),
            identifier in ".{0,40}",
        ) {
            let key = CacheKey::new(entity_type, identifier);
            prop_assert_eq!(CacheKey::decode(&key.encode()), Some(key));
        }
    }
}
