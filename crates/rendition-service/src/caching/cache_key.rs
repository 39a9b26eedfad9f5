use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::types::{Dimensions, ResourceId};

/// Separates the encoded resource id from the rendition size.
///
/// The form-urlencoded id never contains this character, so it can not be forged by an id.
const SIZE_SEPARATOR: char = '@';

/// Storage-level key of one rendition of a resource.
///
/// The key text is the form-urlencoded [`ResourceId`], followed by `@{width}x{height}` for
/// size-specific renditions. Every rendition of one resource thus shares the size-agnostic key
/// as a prefix, which is what bulk invalidation relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    text: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl CacheKey {
    /// Creates the size-agnostic key of `id`.
    pub fn for_resource(id: &ResourceId) -> Self {
        Self {
            text: encode(id.as_str()).into(),
        }
    }

    /// Creates the key of the `size` rendition of `id`.
    pub fn for_rendition(id: &ResourceId, size: Dimensions) -> Self {
        let mut text = encode(id.as_str());
        // writing into a `String` can not fail
        let _ = write!(text, "{SIZE_SEPARATOR}{size}");
        Self { text: text.into() }
    }

    /// Creates the key a decoded payload for `size_hint` is stored under.
    pub fn for_hint(id: &ResourceId, size_hint: Option<Dimensions>) -> Self {
        match size_hint {
            Some(size) => Self::for_rendition(id, size),
            None => Self::for_resource(id),
        }
    }

    /// Encodes a raw prefix so it can be matched against key texts.
    ///
    /// Encoding works byte by byte, so the encoded prefix of an id is a prefix of its encoded
    /// key.
    pub fn prefix(raw: &str) -> String {
        encode(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether this key names a size-specific rendition.
    pub fn is_sized(&self) -> bool {
        self.text.contains(SIZE_SEPARATOR)
    }

    /// Returns the relative path for this key inside a persistent store.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let hash: [u8; 32] = Sha256::digest(self.text.as_bytes()).into();

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

fn encode(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
