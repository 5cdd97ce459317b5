//! `CasKey` and `StringKey` — the two compact identifiers that travel on
//! the wire.

use std::fmt;

/// Bit flags packed into the 20th byte of a `CasKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CasFlags(u8);

impl CasFlags {
    pub const STORED_COMPRESSED: u8 = 1 << 0;
    pub const VIA_PROXY: u8 = 1 << 2;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }

    pub fn without(mut self, bit: u8) -> Self {
        self.0 &= !bit;
        self
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_stored_compressed(self) -> bool {
        self.has(Self::STORED_COMPRESSED)
    }

    pub fn came_via_proxy(self) -> bool {
        self.has(Self::VIA_PROXY)
    }
}

/// 20-byte content-addressed key: 19 bytes of content hash plus one flag
/// byte. Equality that should ignore transient flags (e.g. when
/// deduplicating fetches regardless of how a blob was obtained) must use
/// [`CasKey::content_eq`] rather than `==`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasKey {
    bytes: [u8; 20],
}

impl CasKey {
    /// The all-zero key is reserved and never a valid content address.
    pub const ZERO: CasKey = CasKey { bytes: [0u8; 20] };

    pub fn from_hash_and_flags(hash19: [u8; 19], flags: CasFlags) -> Self {
        let mut bytes = [0u8; 20];
        bytes[..19].copy_from_slice(&hash19);
        bytes[19] = flags.bits();
        CasKey { bytes }
    }

    /// Derive a `CasKey` by hashing `data` with blake3 and truncating the
    /// 32-byte digest to the 19 bytes this wire format carries.
    pub fn hash_content(data: &[u8], flags: CasFlags) -> Self {
        let digest = blake3::hash(data);
        let mut hash19 = [0u8; 19];
        hash19.copy_from_slice(&digest.as_bytes()[..19]);
        Self::from_hash_and_flags(hash19, flags)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        CasKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.bytes
    }

    pub fn flags(&self) -> CasFlags {
        CasFlags::from_bits(self.bytes[19])
    }

    pub fn with_flags(&self, flags: CasFlags) -> Self {
        let mut bytes = self.bytes;
        bytes[19] = flags.bits();
        CasKey { bytes }
    }

    pub fn hash_bytes(&self) -> &[u8] {
        &self.bytes[..19]
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; 20]
    }

    /// Equality over the content hash only, ignoring the flag byte — used
    /// to compare keys regardless of how the blob is being delivered (e.g.
    /// proxy vs. direct).
    pub fn content_eq(&self, other: &CasKey) -> bool {
        self.bytes[..19] == other.bytes[..19]
    }
}

impl fmt::Debug for CasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasKey(")?;
        for b in &self.bytes[..19] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ",flags={:#04x})", self.bytes[19])
    }
}

/// 16-byte hash of a normalized path, used as a compact path
/// identifier on the wire instead of sending the full path string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringKey {
    bytes: [u8; 16],
}

impl StringKey {
    pub const ZERO: StringKey = StringKey { bytes: [0u8; 16] };

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        StringKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Normalize `path` (forward slashes, lower-case when the host
    /// filesystem is case-insensitive) and hash it to a `StringKey`.
    pub fn from_path(path: &str, case_insensitive_fs: bool) -> Self {
        let mut normalized = path.replace('\\', "/");
        if case_insensitive_fs {
            normalized = normalized.to_lowercase();
        }
        let digest = blake3::hash(normalized.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        StringKey { bytes }
    }
}

impl fmt::Debug for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringKey(")?;
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_eq_ignores_flags() {
        let a = CasKey::hash_content(b"hello", CasFlags::empty());
        let b = a.with_flags(CasFlags::empty().with(CasFlags::VIA_PROXY));
        assert_ne!(a, b);
        assert!(a.content_eq(&b));
    }

    #[test]
    fn same_path_normalizes_to_same_key() {
        let a = StringKey::from_path("Foo/Bar.cpp", true);
        let b = StringKey::from_path("foo\\bar.cpp", true);
        assert_eq!(a, b);
    }

    #[test]
    fn case_sensitive_fs_keeps_distinct_keys() {
        let a = StringKey::from_path("Foo.cpp", false);
        let b = StringKey::from_path("foo.cpp", false);
        assert_ne!(a, b);
    }
}
