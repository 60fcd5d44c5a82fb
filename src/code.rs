/// Functions to hash contract bytecode using Poseidon.
/// See `hashContractBytecode()` in https://github.com/0xPolygonHermez/zkevm-commonjs/blob/main/src/smt-utils.js
/// for reference implementation.
use plonky2::field::types::Field;
use plonky2::hash::poseidon::{self, Poseidon};

use crate::smt::{HashOut, F};

pub fn hash_contract_bytecode(code: &[u8]) -> HashOut {
    let mut padded = code.to_vec();
    poseidon_pad_byte_vec(&mut padded);

    poseidon_hash_padded_byte_vec(&padded)
}

pub fn poseidon_hash_padded_byte_vec(bytes: &[u8]) -> HashOut {
    let mut capacity = [F::ZERO; poseidon::SPONGE_CAPACITY];
    let mut arr = [F::ZERO; poseidon::SPONGE_WIDTH];
    for blocks in bytes.chunks_exact(poseidon::SPONGE_RATE * 7) {
        arr[..poseidon::SPONGE_RATE].copy_from_slice(
            &blocks
                .chunks_exact(7)
                .map(|block| {
                    let mut bytes = [0u8; poseidon::SPONGE_RATE];
                    bytes[..7].copy_from_slice(block);
                    F::from_canonical_u64(u64::from_le_bytes(bytes))
                })
                .collect::<Vec<F>>(),
        );
        arr[poseidon::SPONGE_RATE..poseidon::SPONGE_WIDTH].copy_from_slice(&capacity);
        capacity = F::poseidon(arr)[0..poseidon::SPONGE_CAPACITY]
            .try_into()
            .unwrap();
    }
    HashOut { elements: capacity }
}

pub fn poseidon_pad_byte_vec(bytes: &mut Vec<u8>) {
    bytes.push(0x01);
    while bytes.len() % 56 != 0 {
        bytes.push(0x00);
    }
    *bytes.last_mut().unwrap() |= 0x80;
}
