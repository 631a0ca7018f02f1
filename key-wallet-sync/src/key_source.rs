//! Key sources supplying extended public keys to the engine.

use dashcore::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey, ExtendedPubKey};
use dashcore::secp256k1::{All, Secp256k1};
use dashcore::Network;

use crate::error::DerivationError;

/// Supplies extended public keys on demand.
///
/// Implementations may hold a master key in memory or defer to an external
/// signer such as a hardware wallet. Only public keys cross this boundary.
pub trait KeySource: Send {
    /// Extended public key at the given absolute path from the master key.
    fn xpub_at(&self, path: &DerivationPath) -> Result<ExtendedPubKey, DerivationError>;

    /// Stable identifier of the master key this source derives from.
    ///
    /// The default implementation uses the parent fingerprint of the
    /// purpose-level key (`m/44'`), which pins down `m` without exposing
    /// any key material.
    fn tree_ident(&self) -> Result<String, DerivationError> {
        let purpose = ChildNumber::from_hardened_idx(44).map_err(DerivationError::Bip32)?;
        let xpub = self.xpub_at(&DerivationPath::from(vec![purpose]))?;
        Ok(xpub.parent_fingerprint.to_string())
    }
}

/// Key source backed by a master extended private key held in memory.
pub struct SoftwareKeySource {
    master: ExtendedPrivKey,
    secp: Secp256k1<All>,
}

impl SoftwareKeySource {
    /// Wraps an existing master key.
    pub fn new(master: ExtendedPrivKey) -> Self {
        Self {
            master,
            secp: Secp256k1::new(),
        }
    }

    /// Builds a source from a BIP39-style seed.
    pub fn from_seed(network: Network, seed: &[u8]) -> Result<Self, DerivationError> {
        let master =
            ExtendedPrivKey::new_master(network, seed).map_err(DerivationError::Bip32)?;
        Ok(Self::new(master))
    }
}

impl KeySource for SoftwareKeySource {
    fn xpub_at(&self, path: &DerivationPath) -> Result<ExtendedPubKey, DerivationError> {
        let xprv = self
            .master
            .derive_priv(&self.secp, path)
            .map_err(DerivationError::Bip32)?;
        Ok(ExtendedPubKey::from_priv(&self.secp, &xprv))
    }
}
