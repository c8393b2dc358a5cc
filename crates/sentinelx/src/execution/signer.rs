use std::fmt;

use ethereum_types::{Address, H256, U256};
use secp256k1::{Message, SECP256K1, SecretKey};
use thiserror::Error;

use super::tx::Signature;
use crate::abi::{format_address, keccak256, parse_hex_bytes};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signer key is not valid hex")]
    InvalidHex,
    #[error("signer key is not a valid secp256k1 secret key")]
    InvalidKey,
}

/// In-process secp256k1 key used to sign mitigation transactions.
pub struct LocalSigner {
    secret: SecretKey,
    address: Address,
}

impl LocalSigner {
    pub fn new(secret: SecretKey) -> Self {
        let address = address_of(&secret);
        Self { secret, address }
    }

    pub fn from_hex(raw: &str) -> Result<Self, SignerError> {
        let bytes = parse_hex_bytes(raw).ok_or(SignerError::InvalidHex)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self::new(secret))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign_digest(&self, digest: H256) -> Signature {
        let (recovery_id, compact) = SECP256K1
            .sign_ecdsa_recoverable(&Message::from_digest(digest.0), &self.secret)
            .serialize_compact();

        let (r, s) = compact.split_at(32);
        Signature {
            r: U256::from_big_endian(r),
            s: U256::from_big_endian(s),
            recovery_id: u8::try_from(i32::from(recovery_id)).unwrap_or(0),
        }
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &format_address(&self.address))
            .finish_non_exhaustive()
    }
}

/// Ethereum address: last 20 bytes of keccak over the uncompressed public key.
pub fn address_of(secret: &SecretKey) -> Address {
    let public = secret.public_key(SECP256K1).serialize_uncompressed();
    let hash = keccak256(public.get(1..).unwrap_or_default());
    Address::from_slice(hash.as_bytes().get(12..).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tx::LegacyTransaction;
    use hex_literal::hex;

    #[test]
    fn derives_the_known_address() -> Result<(), SignerError> {
        let signer =
            LocalSigner::from_hex("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")?;
        assert_eq!(
            format_address(&signer.address()),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!(LocalSigner::from_hex("0xzz").err(), Some(SignerError::InvalidHex));
        assert_eq!(LocalSigner::from_hex(&"00".repeat(32)).err(), Some(SignerError::InvalidKey));
    }

    #[test]
    fn signs_the_eip155_reference_transaction() -> Result<(), SignerError> {
        let signer = LocalSigner::from_hex(&"46".repeat(32))?;
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: Address::repeat_byte(0x35),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: Vec::new(),
        };

        let signature = signer.sign_digest(tx.signing_hash(1));
        let raw = tx.encode_signed(1, &signature);
        assert_eq!(
            raw,
            hex!(
                "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
            )
            .to_vec()
        );
        Ok(())
    }

    #[test]
    fn debug_output_hides_the_key() -> Result<(), SignerError> {
        let signer = LocalSigner::from_hex(&"46".repeat(32))?;
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains("4646"));
        Ok(())
    }
}
