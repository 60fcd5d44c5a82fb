#![allow(clippy::needless_range_loop)]

/// This module derives the trie keys for the state SMT. Each account field
/// lives at `Poseidon(address limbs ++ kind selector; capacity)`, following
/// the Hermez layout. See
/// https://github.com/0xPolygonHermez/zkevm-commonjs/blob/main/src/smt-utils.js
/// for the reference implementation.
use alloy_primitives::{Address, B256, U256};
use plonky2::field::types::Field;
use plonky2::hash::poseidon::Poseidon;

use crate::smt::{Key, SmtError, SmtResult, F};
use crate::utils::{f2limbs, hash0};

/// `Poseidon([0; 8])`, the capacity input for non-storage keys.
const HASH_ZEROS: [u64; 4] = [
    4330397376401421145,
    14124799381142128323,
    8742572140681234676,
    14345658006221440202,
];

pub const KEY_BALANCE: u8 = 0;
pub const KEY_NONCE: u8 = 1;
pub const SC_CODE: u8 = 2;
pub const SC_STORAGE: u8 = 3;
pub const SC_LENGTH: u8 = 4;

/// Encoded key-source records are `kind || address || storage key`.
const KEY_SOURCE_LEN: usize = 1 + 20 + 32;

fn derive(addr: Address, kind: u8, capacity: [F; 4]) -> Key {
    let mut arr = [F::ZERO; 12];
    for i in 0..5 {
        arr[i] = F::from_canonical_u32(u32::from_be_bytes(
            addr.0[16 - 4 * i..16 - 4 * i + 4].try_into().unwrap(),
        ));
    }
    arr[6] = F::from_canonical_u64(kind as u64);
    arr[8..12].copy_from_slice(&capacity);

    Key(F::poseidon(arr)[0..4].try_into().unwrap())
}

pub fn key_balance(addr: Address) -> Key {
    derive(addr, KEY_BALANCE, HASH_ZEROS.map(F::from_canonical_u64))
}

pub fn key_nonce(addr: Address) -> Key {
    derive(addr, KEY_NONCE, HASH_ZEROS.map(F::from_canonical_u64))
}

pub fn key_code(addr: Address) -> Key {
    derive(addr, SC_CODE, HASH_ZEROS.map(F::from_canonical_u64))
}

pub fn key_code_length(addr: Address) -> Key {
    derive(addr, SC_LENGTH, HASH_ZEROS.map(F::from_canonical_u64))
}

pub fn key_storage(addr: Address, slot: U256) -> Key {
    derive(addr, SC_STORAGE, hash0(f2limbs(slot)))
}

/// Derives the trie key for a non-storage account field.
pub fn key_field(addr: Address, kind: u8) -> SmtResult<Key> {
    match kind {
        KEY_BALANCE => Ok(key_balance(addr)),
        KEY_NONCE => Ok(key_nonce(addr)),
        SC_CODE => Ok(key_code(addr)),
        SC_LENGTH => Ok(key_code_length(addr)),
        _ => Err(SmtError::MalformedKeySource(format!(
            "field kind {kind} has no address-only key"
        ))),
    }
}

pub fn encode_key_source(kind: u8, addr: Address, storage_key: B256) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_SOURCE_LEN);
    out.push(kind);
    out.extend_from_slice(addr.as_slice());
    out.extend_from_slice(storage_key.as_slice());
    out
}

pub fn decode_key_source(bytes: &[u8]) -> SmtResult<(u8, Address, B256)> {
    if bytes.len() != KEY_SOURCE_LEN {
        return Err(SmtError::MalformedKeySource(format!(
            "expected {KEY_SOURCE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let kind = bytes[0];
    if kind > SC_LENGTH {
        return Err(SmtError::MalformedKeySource(format!(
            "unknown field kind {kind}"
        )));
    }
    Ok((
        kind,
        Address::from_slice(&bytes[1..21]),
        B256::from_slice(&bytes[21..53]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_source_round_trip() {
        let addr = Address::repeat_byte(0xAB);
        let slot = B256::left_padding_from(&[0x01]);
        let encoded = encode_key_source(SC_STORAGE, addr, slot);
        assert_eq!(decode_key_source(&encoded).unwrap(), (SC_STORAGE, addr, slot));

        assert!(decode_key_source(&encoded[..40]).is_err());
        let mut bad_kind = encoded;
        bad_kind[0] = 9;
        assert!(decode_key_source(&bad_kind).is_err());
    }

    #[test]
    fn test_field_keys_are_distinct() {
        let addr = Address::repeat_byte(0x01);
        let keys = [
            key_balance(addr),
            key_nonce(addr),
            key_code(addr),
            key_code_length(addr),
            key_storage(addr, U256::from(1)),
            key_balance(Address::repeat_byte(0x02)),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_storage_key_depends_on_wide_slots() {
        let addr = Address::repeat_byte(0x01);
        let lo = U256::from(1);
        let hi = U256::from(1) << 200;
        assert_ne!(key_storage(addr, lo), key_storage(addr, hi));
    }
}
