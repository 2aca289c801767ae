//! Strong types for identifiers and hashes
//!
//! Semantic newtypes replacing raw `[u8; N]` and bare integers.

use std::fmt;

/// Macro to define fixed-size byte arrays with strong types.
///
/// Args:
/// - $name: The name of the struct (e.g., Hash)
/// - $len: The size of the array (e.g., 32)
/// - $doc: Documentation string
/// - $derives: List of traits to derive
macro_rules! define_bytes {
    ($name:ident, $len:expr, $doc:expr, [$($derives:ident),*]) => {
        #[doc = $doc]
        #[derive(
            Clone,
            Copy,
            serde::Serialize,
            serde::Deserialize,
            borsh::BorshSerialize,
            borsh::BorshDeserialize,
            $($derives),*
        )]
        #[repr(transparent)]
        pub struct $name(#[serde(with = "serde_bytes")] pub [u8; $len]);

        impl $name {
            /// Returns the inner bytes as a slice.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse from a hex string.
            pub fn from_hex(hex_str: &str) -> Result<Self, String> {
                let bytes = hex::decode(hex_str)
                    .map_err(|e| format!("invalid hex: {}", e))?;
                if bytes.len() != $len {
                    return Err(format!(
                        "expected {} hex characters, got {}",
                        $len * 2,
                        hex_str.len()
                    ));
                }
                Ok(Self(bytes.try_into().map_err(|_| "internal error: length mismatch".to_string())?))
            }

            /// Short hex prefix for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(wrapper: $name) -> [u8; $len] {
                wrapper.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(self, f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                fmt::Display::fmt(self, f)?;
                write!(f, ")")
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(<[u8; $len]>::try_from(slice)?))
            }
        }
    };
}

define_bytes!(
    Hash,
    32,
    "32-byte hash (BLAKE3)",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// BLAKE3 of arbitrary bytes.
    pub fn digest(bytes: &[u8]) -> Hash {
        Hash(blake3::hash(bytes).into())
    }
}

impl From<blake3::Hash> for Hash {
    fn from(h: blake3::Hash) -> Self {
        Hash(h.into())
    }
}

/// Cluster-unique node identifier.
///
/// Ordering matters: when every peer is still starting, the lowest id among
/// the trusted copies settles first and the rest join it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let h = Hash::digest(b"gmeta");
        let parsed = Hash::from_hex(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_hash_from_hex_rejects_wrong_length() {
        let err = Hash::from_hex("abcd").unwrap_err();
        assert!(err.contains("expected 64 hex characters"));
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn test_hash_debug_and_short() {
        let h = Hash([0xab; 32]);
        assert!(format!("{:?}", h).starts_with("Hash(abab"));
        assert_eq!(h.short(), "abababab");
    }

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId(3), NodeId(1), NodeId(2)];
        ids.sort();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(NodeId(7).to_string(), "node-7");
    }
}
