//! EIP-155 legacy transactions and the minimal RLP needed to encode them.

use ethereum_types::{Address, H256, U256};

use crate::abi::keccak256;

/// Recoverable secp256k1 signature split into its transaction fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub r: U256,
    pub s: U256,
    pub recovery_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    /// `keccak(rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0]))`.
    pub fn signing_hash(&self, chain_id: u64) -> H256 {
        let mut payload = self.encode_fields();
        encode_uint(&mut payload, U256::from(chain_id));
        encode_uint(&mut payload, U256::zero());
        encode_uint(&mut payload, U256::zero());
        keccak256(&wrap_list(payload))
    }

    /// Raw signed transaction ready for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, chain_id: u64, signature: &Signature) -> Vec<u8> {
        // v = chainId * 2 + 35 + recovery id
        let v = U256::from(chain_id) * U256::from(2u8) + U256::from(35u8) + U256::from(signature.recovery_id);

        let mut payload = self.encode_fields();
        encode_uint(&mut payload, v);
        encode_uint(&mut payload, signature.r);
        encode_uint(&mut payload, signature.s);
        wrap_list(payload)
    }

    fn encode_fields(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(64 + self.data.len());
        encode_uint(&mut payload, U256::from(self.nonce));
        encode_uint(&mut payload, self.gas_price);
        encode_uint(&mut payload, U256::from(self.gas_limit));
        encode_bytes(&mut payload, self.to.as_bytes());
        encode_uint(&mut payload, self.value);
        encode_bytes(&mut payload, &self.data);
        payload
    }
}

fn encode_header(out: &mut Vec<u8>, offset: u8, len: usize) {
    match u8::try_from(len) {
        Ok(short) if short < 56 => out.push(offset + short),
        _ => {
            let be = len.to_be_bytes();
            let significant: Vec<u8> = be.iter().copied().skip_while(|byte| *byte == 0).collect();
            let len_of_len = u8::try_from(significant.len()).unwrap_or(8);
            out.push(offset + 55 + len_of_len);
            out.extend_from_slice(&significant);
        }
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    match bytes {
        [single] if *single < 0x80 => out.push(*single),
        _ => {
            encode_header(out, 0x80, bytes.len());
            out.extend_from_slice(bytes);
        }
    }
}

fn encode_uint(out: &mut Vec<u8>, value: U256) {
    let be = value.to_big_endian();
    let significant: Vec<u8> = be.iter().copied().skip_while(|byte| *byte == 0).collect();
    encode_bytes(out, &significant);
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    encode_header(&mut out, 0xc0, payload.len());
    out.extend(payload);
    out
}
