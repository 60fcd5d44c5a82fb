use std::collections::HashMap;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::code::hash_contract_bytecode;
use crate::smt::{Key, Node};
use crate::utils::hashout2b;

/// Storage backend for the trie: node records, the reverse indexes that
/// resolve leaves back to their semantic keys, and the bytecode store.
pub trait Db: Default {
    fn get_node(&self, key: &Key) -> Option<&Node>;
    fn set_node(&mut self, key: Key, value: Node);

    /// Bytecode lookup by Poseidon bytecode hash. `hash` may be the minimal
    /// big-endian rendering of the hash; it is left-padded to 32 bytes.
    fn get_code(&self, hash: &[u8]) -> Option<&[u8]>;
    /// Stores bytecode under its own hash. Re-adding code for an existing
    /// hash is a no-op.
    fn add_code(&mut self, code: &[u8]);

    /// Leaf record hash -> full trie key (the hashed-key preimage).
    fn get_hash_key(&self, key: &Key) -> Option<Key>;
    fn set_hash_key(&mut self, key: Key, preimage: Key);

    /// Trie key -> encoded `(kind, address, storage key)` triple.
    fn get_key_source(&self, key: &Key) -> Option<&[u8]>;
    fn set_key_source(&mut self, key: Key, source: Vec<u8>);
}

/// In-memory backend; also the scratch DB of tries rebuilt from witnesses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDb {
    pub nodes: HashMap<Key, Node>,
    pub code: HashMap<B256, Vec<u8>>,
    pub hash_keys: HashMap<Key, Key>,
    pub key_sources: HashMap<Key, Vec<u8>>,
}

impl Db for MemoryDb {
    fn get_node(&self, key: &Key) -> Option<&Node> {
        self.nodes.get(key)
    }

    fn set_node(&mut self, key: Key, value: Node) {
        self.nodes.insert(key, value);
    }

    fn get_code(&self, hash: &[u8]) -> Option<&[u8]> {
        self.code
            .get(&B256::left_padding_from(hash))
            .map(Vec::as_slice)
    }

    fn add_code(&mut self, code: &[u8]) {
        let hash = hashout2b(hash_contract_bytecode(code));
        self.code.entry(hash).or_insert_with(|| code.to_vec());
    }

    fn get_hash_key(&self, key: &Key) -> Option<Key> {
        self.hash_keys.get(key).copied()
    }

    fn set_hash_key(&mut self, key: Key, preimage: Key) {
        self.hash_keys.insert(key, preimage);
    }

    fn get_key_source(&self, key: &Key) -> Option<&[u8]> {
        self.key_sources.get(key).map(Vec::as_slice)
    }

    fn set_key_source(&mut self, key: Key, source: Vec<u8>) {
        self.key_sources.insert(key, source);
    }
}
