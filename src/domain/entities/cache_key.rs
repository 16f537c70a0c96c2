//! Cache identity: size classes, composite keys and disk digests.

use serde::{Deserialize, Serialize};

/// Named size buckets requested by the rendering layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// 80 px.
    Thumbnail,
    /// 100 px.
    Small,
    /// 150 px.
    Medium,
    /// 200 px.
    Large,
    /// 300 px.
    #[value(name = "xlarge")]
    XLarge,
    /// 800 px.
    Magazine,
}

impl SizeClass {
    /// Every size class, smallest first.
    pub const ALL: [Self; 6] = [
        Self::Thumbnail,
        Self::Small,
        Self::Medium,
        Self::Large,
        Self::XLarge,
        Self::Magazine,
    ];

    /// Target pixel dimension for this class.
    #[must_use]
    pub const fn pixels(self) -> u32 {
        match self {
            Self::Thumbnail => 80,
            Self::Small => 100,
            Self::Medium => 150,
            Self::Large => 200,
            Self::XLarge => 300,
            Self::Magazine => 800,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::XLarge => "xlarge",
            Self::Magazine => "magazine",
        }
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Composite cache identity. The same source at two size classes is two entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source: String,
    size: SizeClass,
}

impl CacheKey {
    /// Creates a key for `source` at `size`.
    #[must_use]
    pub fn new(source: impl Into<String>, size: SizeClass) -> Self {
        Self {
            source: source.into(),
            size,
        }
    }

    /// Source identifier (usually a URL).
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Requested size class.
    #[must_use]
    pub const fn size(&self) -> SizeClass {
        self.size
    }

    /// Digest addressing this key in the disk tier.
    #[must_use]
    pub fn digest(&self) -> DiskDigest {
        DiskDigest::from_key(self)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The size name never contains '#', so splitting on the last one is unambiguous.
        write!(f, "{}#{}", self.source, self.size)
    }
}

/// 128-bit content address for the disk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskDigest([u8; 16]);

impl DiskDigest {
    /// Hashes the string form of `key`.
    #[must_use]
    pub fn from_key(key: &CacheKey) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        let result = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&result[..16]);
        Self(bytes)
    }

    /// Parses a 32-character hex digest.
    #[must_use]
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let decoded = hex::decode(hex_str).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Lowercase hex form, used as the store's file name stem.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for DiskDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_digest_is_stable() {
        let key = CacheKey::new("https://example.com/a.png", SizeClass::Medium);
        assert_eq!(key.digest().to_hex(), "ac7758049f36b2b966b16415198a2836");
        assert_eq!(
            CacheKey::new("a", SizeClass::Thumbnail).digest().to_hex(),
            "f3812a5b528304e94126d318afcdb471"
        );
    }

    #[test]
    fn test_digest_consistency() {
        let a = CacheKey::new("https://example.com/image.png", SizeClass::Large);
        let b = CacheKey::new("https://example.com/image.png", SizeClass::Large);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().to_hex().len(), 32);
    }

    #[test]
    fn test_size_classes_are_distinct_entries() {
        let small = CacheKey::new("img", SizeClass::Small);
        let large = CacheKey::new("img", SizeClass::Large);
        assert_ne!(small, large);
        assert_ne!(small.digest(), large.digest());
    }

    #[test]
    fn test_separator_in_source_does_not_collide() {
        let a = CacheKey::new("a#small", SizeClass::Medium);
        let b = CacheKey::new("a", SizeClass::Small);
        assert_eq!(a.to_string(), "a#small#medium");
        assert_ne!(a.to_string(), b.to_string());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_pixel_table_is_unique() {
        let pixels: HashSet<u32> = SizeClass::ALL.iter().map(|s| s.pixels()).collect();
        assert_eq!(pixels.len(), SizeClass::ALL.len());
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = CacheKey::new("x", SizeClass::Magazine).digest();
        assert_eq!(DiskDigest::from_hex(&digest.to_hex()), Some(digest));
        assert_eq!(DiskDigest::from_hex("not-hex"), None);
        assert_eq!(DiskDigest::from_hex("abcd"), None);
    }
}
