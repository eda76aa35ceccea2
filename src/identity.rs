//! Identifier newtypes and the node signature scheme.
//!
//! Every identifier kind gets its own 32-byte newtype so account, transaction
//! and round IDs cannot be mixed across domains. `MerkleDigest` is the
//! 16-byte state-tree checksum that names a finalized round's world state.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::Hash;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const LEN: usize = 32;

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parse from a 64-character hex string.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let arr: [u8; 32] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<Hash> for $name {
            fn from(h: Hash) -> Self {
                Self(h)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..8]))
            }
        }
    };
}

id_newtype! {
    /// A 32-byte account identifier (an ed25519 verifying key).
    AccountId
}

id_newtype! {
    /// A 32-byte transaction identifier (BLAKE3 of the canonical encoding).
    TransactionId
}

id_newtype! {
    /// A 32-byte round identifier.
    RoundId
}

/// The 16-byte state-tree checksum.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MerkleDigest(pub [u8; 16]);

impl MerkleDigest {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for MerkleDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for MerkleDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MerkleDigest({})", hex::encode(self.0))
    }
}

/// A detached ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// The empty signature used by synthetic transactions (genesis, tests).
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "Signature(empty)")
        } else {
            write!(f, "Signature({})", hex::encode(&self.0[..8.min(self.0.len())]))
        }
    }
}

/// A node keypair. The account ID is the verifying key's 32 bytes.
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Keypair {
            signing: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Rebuild a keypair from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Keypair {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    pub fn account_id(&self) -> AccountId {
        AccountId(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes().to_vec())
    }
}

/// Verify a signature against an account ID interpreted as a verifying key.
///
/// Returns false for malformed keys or signatures rather than erroring;
/// ingress treats any failure the same way.
pub fn verify_signature(account: &AccountId, message: &[u8], signature: &Signature) -> bool {
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&account.0) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.0.as_slice()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig).is_ok()
}
