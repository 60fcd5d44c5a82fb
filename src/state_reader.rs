//! Account-level reads over the trie: point queries for the scalar fields
//! and the translation of the storage view into a legacy Merkle-Patricia
//! root.

use std::collections::HashMap;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_rlp::encode_fixed_size;
use alloy_trie::{HashBuilder, Nibbles, EMPTY_ROOT_HASH};
use log::error;

use crate::db::Db;
use crate::keys::{
    decode_key_source, key_field, KEY_BALANCE, KEY_NONCE, SC_CODE, SC_LENGTH, SC_STORAGE,
};
use crate::smt::{Key, Smt, SmtError, SmtResult, F};
use crate::utils::{b2u, key2u, limbs2f};

/// Account state as surfaced to the host node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    pub storage_root: B256,
}

impl<D: Db> Smt<D> {
    /// Reads the account object for the address. The `storage_root` is
    /// left zero; it is only materialised on explicit request through
    /// [`Smt::account_storage_root`].
    pub fn read_account_data(&self, address: Address) -> SmtResult<Account> {
        Ok(Account {
            nonce: self.account_nonce(address)?.wrapping_to::<u64>(),
            balance: self.account_balance(address)?,
            code_hash: self.account_code_hash(address)?,
            storage_root: B256::ZERO,
        })
    }

    /// The storage layout is not exposed as a point query at this layer.
    pub fn read_account_storage(&self, _address: Address, _key: &B256) -> SmtResult<Vec<u8>> {
        Ok(Vec::new())
    }

    pub fn read_account_code(&self, code_hash: B256) -> SmtResult<Vec<u8>> {
        self.db
            .get_code(code_hash.as_slice())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SmtError::MissingCode(b2u(code_hash)))
    }

    pub fn read_account_code_size(&self, address: Address) -> SmtResult<usize> {
        let bytes = self.value_in_bytes(SC_LENGTH, address)?;
        Ok(U256::try_from_be_slice(&bytes)
            .unwrap_or_default()
            .saturating_to::<usize>())
    }

    /// Incarnations are a relic of the host node's storage layout.
    pub fn read_account_incarnation(&self, _address: Address) -> SmtResult<u64> {
        Ok(0)
    }

    pub fn account_balance(&self, address: Address) -> SmtResult<U256> {
        let bytes = self.value_in_bytes(KEY_BALANCE, address).map_err(|e| {
            error!("error reading balance of {address}: {e}");
            e
        })?;
        Ok(U256::try_from_be_slice(&bytes).unwrap_or_default())
    }

    pub fn account_nonce(&self, address: Address) -> SmtResult<U256> {
        let bytes = self.value_in_bytes(KEY_NONCE, address).map_err(|e| {
            error!("error reading nonce of {address}: {e}");
            e
        })?;
        Ok(U256::try_from_be_slice(&bytes).unwrap_or_default())
    }

    pub fn account_code_hash(&self, address: Address) -> SmtResult<B256> {
        let bytes = self.value_in_bytes(SC_CODE, address).map_err(|e| {
            error!("error reading code hash of {address}: {e}");
            e
        })?;
        Ok(B256::left_padding_from(&bytes))
    }

    /// Folds the address's storage view into a legacy Merkle-Patricia
    /// root: slots are keccak-hashed, values RLP-encoded, leaves added in
    /// hashed-key order.
    pub fn account_storage_root(&self, address: Address) -> SmtResult<B256> {
        let storage = self.storage_map(address)?;
        if storage.is_empty() {
            return Ok(EMPTY_ROOT_HASH);
        }

        let mut leaves: Vec<(B256, U256)> = storage
            .into_iter()
            .map(|(slot, value)| (keccak256(slot), value))
            .collect();
        leaves.sort_unstable_by_key(|(hashed_slot, _)| *hashed_slot);

        let mut hash_builder = HashBuilder::default();
        for (hashed_slot, value) in leaves {
            hash_builder.add_leaf(
                Nibbles::unpack(hashed_slot),
                encode_fixed_size(&value).as_ref(),
            );
        }
        Ok(hash_builder.root())
    }

    /// Point query: walks only the target key's path and returns the leaf
    /// value's bytes, or empty bytes if the key is not committed.
    fn value_in_bytes(&self, kind: u8, address: Address) -> SmtResult<Vec<u8>> {
        let kn = key_field(address, kind)?;
        let target = kn.split();
        let mut value = Vec::new();

        self.traverse(self.root_key(), None, &mut |prefix, _k, node| {
            if !target.starts_with(prefix) {
                return Ok(false);
            }
            if node.is_final() {
                // a prefix-sharing neighbour may sit on our path; only an
                // exact key match is a hit
                if Key::join(*prefix, node.rem_key()) == kn {
                    let record = self.node(&node.value_hash())?;
                    let value8: [F; 8] = record.0[0..8].try_into().unwrap();
                    value = limbs2f(value8).to_be_bytes_trimmed_vec();
                }
                return Ok(false);
            }
            Ok(true)
        })?;

        Ok(value)
    }

    /// Collects every committed storage slot of the address by scanning
    /// the trie's leaves through their key sources.
    fn storage_map(&self, address: Address) -> SmtResult<HashMap<B256, U256>> {
        let mut storage = HashMap::new();

        self.traverse(self.root_key(), None, &mut |_prefix, k, node| {
            if !node.is_final() {
                return Ok(true);
            }
            let trie_key = self
                .db
                .get_hash_key(&k)
                .ok_or_else(|| SmtError::KeySourceMissing(key2u(k)))?;
            let source = self
                .db
                .get_key_source(&trie_key)
                .ok_or_else(|| SmtError::KeySourceMissing(key2u(trie_key)))?;
            let (kind, addr, slot) = decode_key_source(source)?;

            if kind == SC_STORAGE && addr == address {
                let record = self.node(&node.value_hash())?;
                let value8: [F; 8] = record.0[0..8].try_into().unwrap();
                storage.insert(slot, limbs2f(value8));
            }
            Ok(true)
        })?;

        Ok(storage)
    }
}
