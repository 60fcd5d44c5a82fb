#![allow(clippy::needless_range_loop)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use plonky2::field::goldilocks_field::GoldilocksField;
use plonky2::field::types::{Field, PrimeField64};
use plonky2::hash::poseidon::{Poseidon, PoseidonHash};
use plonky2::plonk::config::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bits::Bits;
use crate::code::hash_contract_bytecode;
use crate::db::Db;
use crate::keys::{
    encode_key_source, key_balance, key_code, key_code_length, key_nonce, key_storage,
    KEY_BALANCE, KEY_NONCE, SC_CODE, SC_LENGTH, SC_STORAGE,
};
use crate::utils::{f2limbs, get_unique_sibling, hash0, hash_key_hash, hashout2u, key2u, limbs2f};

pub type F = GoldilocksField;
pub type HashOut = <PoseidonHash as Hasher<F>>::Hash;

pub type SmtResult<T> = Result<T, SmtError>;

/// An error raised by trie operations, witness handling or account reads.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SmtError {
    /// A node record referenced by the trie is absent from the database.
    #[error("missing node record for key {0:#x}")]
    MissingNode(U256),

    /// No bytecode is stored under a code leaf's value hash.
    #[error("no bytecode stored for hash {0:#x}")]
    MissingCode(U256),

    /// A leaf is present but its hashed-key preimage cannot be resolved.
    #[error("no key preimage recorded for {0:#x}")]
    KeySourceMissing(U256),

    /// A key-source record did not decode to a `(kind, address, slot)` triple.
    #[error("malformed key source: {0}")]
    MalformedKeySource(String),

    /// The witness byte stream used an opcode outside the closed operator set.
    #[error("unsupported witness operator {0:#04x}")]
    UnsupportedOperator(u8),

    /// The operator stream or a hash-node splice violated the trie protocol.
    #[error("malformed witness: {0}")]
    Structural(&'static str),

    /// The abort signal was raised during a traversal.
    #[error("traversal aborted")]
    Aborted,
}

/// Checks whether the caller raised the abort signal, to bail out of a
/// traversal at the next node boundary.
pub fn check_abort_signal(abort_signal: Option<&Arc<AtomicBool>>) -> SmtResult<()> {
    if let Some(signal) = abort_signal {
        if signal.load(Ordering::Relaxed) {
            return Err(SmtError::Aborted);
        }
    }
    Ok(())
}

/// A 256-bit node key: four 64-bit field limbs. The key of a record is the
/// Poseidon hash of its content, so keys double as subtree commitments.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Key(pub [F; 4]);

/// A 12-limb node record. Internal nodes carry the left child key in limbs
/// `0..4` and the right child key in `4..8` (zero means no child). Final
/// (leaf) nodes are tagged by limb 8 and carry the remainder key in `0..4`
/// and the hash of the value record in `4..8`.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Node(pub [F; 12]);

impl Key {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(F::is_zero)
    }

    /// The little-endian bit expansion of the key: bit `i` of the path is
    /// bit `i / 4` of limb `i % 4`.
    pub fn split(&self) -> Bits {
        let mut bits = Bits::empty();
        let mut arr: [_; 4] = std::array::from_fn(|i| self.0[i].to_canonical_u64());
        for _ in 0..64 {
            for j in 0..4 {
                bits.push_bit(arr[j] & 1 == 1);
                arr[j] >>= 1;
            }
        }
        bits
    }

    /// Rebuilds a full key from a path prefix and the remainder key stored
    /// in a leaf at that position.
    pub fn join(bits: Bits, rem_key: Self) -> Self {
        let mut n = [0; 4];
        let mut accs = [0; 4];
        for i in 0..bits.count {
            if bits.get_bit(i) {
                accs[i % 4] |= 1 << n[i % 4];
            }
            n[i % 4] += 1;
        }
        let key = std::array::from_fn(|i| {
            F::from_canonical_u64((rem_key.0[i].to_canonical_u64() << n[i]) | accs[i])
        });
        Key(key)
    }

    /// Drops the first `nbits` path bits, leaving the remainder key for a
    /// leaf at depth `nbits`.
    pub(crate) fn remove_key_bits(&self, nbits: usize) -> Self {
        let full_levels = nbits / 4;
        let mut auxk = self.0.map(|x| x.to_canonical_u64());
        for i in 0..4 {
            let mut n = full_levels;
            if full_levels * 4 + i < nbits {
                n += 1;
            }
            auxk[i] >>= n;
        }
        Key(auxk.map(F::from_canonical_u64))
    }
}

impl Node {
    pub(crate) const EMPTY: Node = Node([F::ZERO; 12]);

    pub fn is_final(&self) -> bool {
        self.0[8].is_one()
    }

    pub fn left(&self) -> Key {
        Key(self.0[0..4].try_into().unwrap())
    }

    pub fn right(&self) -> Key {
        Key(self.0[4..8].try_into().unwrap())
    }

    /// Remainder key of a leaf record.
    pub fn rem_key(&self) -> Key {
        Key(self.0[0..4].try_into().unwrap())
    }

    /// Hash of the value record a leaf points at.
    pub fn value_hash(&self) -> Key {
        Key(self.0[4..8].try_into().unwrap())
    }
}

/// Sparse Merkle trie over Poseidon-hashed account state.
///
/// Node records live in the backing [`Db`], keyed by their own Poseidon
/// hash; leaves are hashed with a capacity prefix of 1 and point at a value
/// record stored under the value's hash. The root commits to the whole
/// trie. Walkers and witness builders must not overlap with writers on the
/// same instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Smt<D: Db> {
    pub db: D,
    pub root: HashOut,
}

impl<D: Db> Smt<D> {
    /// Key of the root node record.
    pub fn root_key(&self) -> Key {
        Key(self.root.elements)
    }

    pub(crate) fn node(&self, key: &Key) -> SmtResult<Node> {
        self.db
            .get_node(key)
            .copied()
            .ok_or_else(|| SmtError::MissingNode(key2u(*key)))
    }

    /// Returns `Poseidon(x, [0,0,0,0])` and saves the record in the DB.
    fn hash0(&mut self, x: [F; 8]) -> [F; 4] {
        let h = hash0(x);
        let a = std::array::from_fn(|i| if i < 8 { x[i] } else { F::ZERO });
        self.db.set_node(Key(h), Node(a));
        h
    }

    /// Creates the leaf record for `full_key` from its remainder key and
    /// value-record hash, and indexes the record hash back to the full key.
    fn save_leaf(&mut self, full_key: Key, rem_key: Key, val_h: [F; 4]) -> [F; 4] {
        let a = std::array::from_fn(|i| match i {
            j if j < 4 => rem_key.0[i],
            j if j < 8 => val_h[i - 4],
            8 => F::ONE,
            _ => F::ZERO,
        });
        let h = hash_key_hash(rem_key, val_h);
        self.db.set_node(Key(h), Node(a));
        self.db.set_hash_key(Key(h), full_key);
        h
    }

    /// Returns the value associated with the key, or 0 if absent.
    pub fn get(&self, key: Key) -> SmtResult<U256> {
        let keys = key.split();
        let mut level = 0;
        let mut acc_key = Bits::empty();
        let mut r = self.root_key();

        while !r.is_zero() {
            let node = self.node(&r)?;
            if node.is_final() {
                let value = self.node(&node.value_hash())?;
                let value8: [F; 8] = value.0[0..8].try_into().unwrap();
                let found_key = Key::join(acc_key, node.rem_key());
                return Ok(if found_key == key {
                    limbs2f(value8)
                } else {
                    U256::ZERO
                });
            }
            let b = keys.get_bit(level);
            r = if b { node.right() } else { node.left() };
            acc_key.push_bit(b);
            level += 1;
        }
        Ok(U256::ZERO)
    }

    /// Sets the value associated with the key; a value of 0 removes the
    /// key. Reference implementation in
    /// https://github.com/0xPolygonHermez/zkevm-commonjs/blob/main/src/smt.js.
    pub fn set(&mut self, key: Key, value: U256) -> SmtResult<()> {
        let mut r = self.root_key();
        let mut new_root = self.root;
        let keys = key.split();
        let mut level = 0isize;
        let mut acc_key = Bits::empty();
        let mut found_key = None;
        let mut found_rem_key = None;
        let mut found_old_val_h = None;
        let mut siblings: Vec<Node> = vec![];

        while !r.is_zero() {
            let sibling = self.node(&r)?;
            siblings.push(sibling);
            if sibling.is_final() {
                let rem = sibling.rem_key();
                found_old_val_h = Some(sibling.value_hash().0);
                found_rem_key = Some(rem);
                found_key = Some(Key::join(acc_key, rem));
                break;
            }
            let b = keys.get_bit(level as usize);
            r = if b { sibling.right() } else { sibling.left() };
            acc_key.push_bit(b);
            level += 1;
        }

        level -= 1;
        if !acc_key.is_empty() {
            acc_key.pop_next_bit();
        }

        if value.is_zero() {
            if found_key == Some(key) {
                if level >= 0 {
                    let i = (keys.get_bit(level as usize) as usize) * 4;
                    siblings[level as usize].0[i..i + 4].copy_from_slice(&[F::ZERO; 4]);
                    let mut u_key = get_unique_sibling(siblings[level as usize]);

                    if u_key < 0 {
                        return Err(SmtError::Structural("delete left an empty internal node"));
                    }
                    let k = if u_key == 0 {
                        siblings[level as usize].left()
                    } else {
                        siblings[level as usize].right()
                    };
                    // the leaf only bubbles up if its unique sibling is
                    // itself a leaf; opaque or internal siblings stay put
                    let sib_node = self.db.get_node(&k).copied();
                    if let Some(sib_node) = sib_node.filter(Node::is_final) {
                        let val_h = sib_node.value_hash().0;
                        let r_key = sib_node.rem_key();
                        let ins_key = Key::join(acc_key.add_bit(u_key != 0), r_key);

                        while u_key >= 0 && level >= 0 {
                            level -= 1;
                            if level >= 0 {
                                u_key = get_unique_sibling(siblings[level as usize]);
                            }
                        }

                        let old_key = ins_key.remove_key_bits((level + 1) as usize);
                        let old_leaf_hash = self.save_leaf(ins_key, old_key, val_h);

                        if level >= 0 {
                            let b = keys.get_bit(level as usize) as usize * 4;
                            siblings[level as usize].0[b..b + 4].copy_from_slice(&old_leaf_hash);
                        } else {
                            new_root = HashOut {
                                elements: old_leaf_hash,
                            };
                        }
                    }
                } else {
                    new_root = HashOut {
                        elements: [F::ZERO; 4],
                    };
                }
            }
        } else if let Some(found_key) = found_key {
            if key == found_key {
                let new_val_h = self.hash0(f2limbs(value));
                let new_leaf_hash = self.save_leaf(key, found_rem_key.unwrap(), new_val_h);
                if level >= 0 {
                    let i = (keys.get_bit(level as usize) as usize) * 4;
                    siblings[level as usize].0[i..i + 4].copy_from_slice(&new_leaf_hash);
                } else {
                    new_root = HashOut {
                        elements: new_leaf_hash,
                    };
                }
            } else {
                // keys diverge below the found leaf: push both leaves under
                // a fresh chain of internal nodes down to the split bit
                let mut node = [F::ZERO; 8];
                let mut level2 = level + 1;
                let found_keys = found_key.split();
                while keys.get_bit(level2 as usize) == found_keys.get_bit(level2 as usize) {
                    level2 += 1;
                }
                let old_key = found_key.remove_key_bits(level2 as usize + 1);
                let old_leaf_hash = self.save_leaf(found_key, old_key, found_old_val_h.unwrap());

                let new_key = key.remove_key_bits(level2 as usize + 1);
                let new_val_h = self.hash0(f2limbs(value));
                let new_leaf_hash = self.save_leaf(key, new_key, new_val_h);

                let b = keys.get_bit(level2 as usize) as usize * 4;
                let bb = found_keys.get_bit(level2 as usize) as usize * 4;
                node[b..b + 4].copy_from_slice(&new_leaf_hash);
                node[bb..bb + 4].copy_from_slice(&old_leaf_hash);

                let mut r2 = self.hash0(node);
                level2 -= 1;

                while level2 != level {
                    node = [F::ZERO; 8];
                    let b = keys.get_bit(level2 as usize) as usize * 4;
                    node[b..b + 4].copy_from_slice(&r2);

                    r2 = self.hash0(node);
                    level2 -= 1;
                }

                if level >= 0 {
                    let b = keys.get_bit(level as usize) as usize * 4;
                    siblings[level as usize].0[b..b + 4].copy_from_slice(&r2);
                } else {
                    new_root = HashOut { elements: r2 };
                }
            }
        } else {
            let new_key = key.remove_key_bits((level + 1) as usize);
            let new_val_h = self.hash0(f2limbs(value));
            let new_leaf_hash = self.save_leaf(key, new_key, new_val_h);

            if level >= 0 {
                let b = keys.get_bit(level as usize) as usize * 4;
                siblings[level as usize].0[b..b + 4].copy_from_slice(&new_leaf_hash);
            } else {
                new_root = HashOut {
                    elements: new_leaf_hash,
                };
            }
        }
        siblings.truncate((level + 1) as usize);

        while level >= 0 {
            let n = siblings[level as usize];
            new_root = F::poseidon(n.0)[0..4].try_into().unwrap();
            self.db.set_node(Key(new_root.elements), n);
            level -= 1;
            if level >= 0 {
                let b = keys.get_bit(level as usize) as usize * 4;
                siblings[level as usize].0[b..b + 4].copy_from_slice(&new_root.elements);
            }
        }
        self.root = new_root;
        Ok(())
    }

    /// Removes the key.
    pub fn delete(&mut self, key: Key) -> SmtResult<()> {
        self.set(key, U256::ZERO)
    }

    /// Splices an opaque subtree hash at the given DFS position, creating
    /// skeleton internal nodes along the way. Hash nodes must be inserted
    /// before any leaf mutation touches the surrounding area; the target
    /// slot must be empty.
    pub fn insert_hash_node(&mut self, path: Bits, hash: HashOut) -> SmtResult<HashOut> {
        let mut r = self.root_key();
        let mut new_root = self.root;
        let mut level = 0isize;
        let mut siblings = vec![];

        for _ in 0..path.count {
            let sibling = self.db.get_node(&r).copied().unwrap_or(Node::EMPTY);
            siblings.push(sibling);
            if sibling.is_final() {
                return Err(SmtError::Structural("hash node path crosses a leaf"));
            }
            let b = path.get_bit(level as usize);
            r = if b { sibling.right() } else { sibling.left() };
            level += 1;
        }
        level -= 1;
        if !r.is_zero() {
            return Err(SmtError::Structural("hash node target is not empty"));
        }

        if level >= 0 {
            let b = path.get_bit(level as usize) as usize * 4;
            siblings[level as usize].0[b..b + 4].copy_from_slice(&hash.elements);
        } else {
            new_root = hash;
        }
        siblings.truncate((level + 1) as usize);

        while level >= 0 {
            let n = siblings[level as usize];
            new_root = F::poseidon(n.0)[0..4].try_into().unwrap();
            self.db.set_node(Key(new_root.elements), n);
            level -= 1;
            if level >= 0 {
                let b = path.get_bit(level as usize) as usize * 4;
                siblings[level as usize].0[b..b + 4].copy_from_slice(&new_root.elements);
            }
        }
        self.root = new_root;
        Ok(new_root)
    }

    /// Sets the balance leaf for the address and records its key source.
    pub fn set_account_balance(&mut self, addr: Address, balance: U256) -> SmtResult<Key> {
        let k = key_balance(addr);
        self.set(k, balance)?;
        self.db
            .set_key_source(k, encode_key_source(KEY_BALANCE, addr, B256::ZERO));
        Ok(k)
    }

    /// Sets the nonce leaf for the address and records its key source.
    pub fn set_account_nonce(&mut self, addr: Address, nonce: U256) -> SmtResult<Key> {
        let k = key_nonce(addr);
        self.set(k, nonce)?;
        self.db
            .set_key_source(k, encode_key_source(KEY_NONCE, addr, B256::ZERO));
        Ok(k)
    }

    /// Sets the code-hash and code-length leaves for the contract and
    /// persists the bytecode under its hash.
    pub fn set_contract_bytecode(&mut self, addr: Address, code: &[u8]) -> SmtResult<()> {
        let code_hash = hashout2u(hash_contract_bytecode(code));
        let kc = key_code(addr);
        self.set(kc, code_hash)?;
        self.db
            .set_key_source(kc, encode_key_source(SC_CODE, addr, B256::ZERO));

        let kl = key_code_length(addr);
        self.set(kl, U256::from(code.len()))?;
        self.db
            .set_key_source(kl, encode_key_source(SC_LENGTH, addr, B256::ZERO));

        self.db.add_code(code);
        Ok(())
    }

    /// Writes one storage leaf per slot; zero values remove the slot.
    pub fn set_contract_storage(
        &mut self,
        addr: Address,
        storage: &HashMap<B256, U256>,
    ) -> SmtResult<()> {
        for (slot, value) in storage {
            let k = key_storage(addr, U256::from_be_bytes(slot.0));
            self.set(k, *value)?;
            if !value.is_zero() {
                self.db
                    .set_key_source(k, encode_key_source(SC_STORAGE, addr, *slot));
            }
        }
        Ok(())
    }

    /// Depth-first walk from `node`, left child before right child.
    ///
    /// The visitor receives the bit prefix that selects the node, the
    /// node's record key and the record itself, and decides whether to
    /// descend. Leaves are visited with the full prefix that selects them
    /// and are never descended into. A record-less key reads as an all-zero
    /// node: an opaque subtree with nothing to descend into.
    pub fn traverse<V>(
        &self,
        node: Key,
        abort_signal: Option<Arc<AtomicBool>>,
        visit: &mut V,
    ) -> SmtResult<()>
    where
        V: FnMut(&Bits, Key, &Node) -> SmtResult<bool>,
    {
        self.traverse_from(node, Bits::empty(), abort_signal.as_ref(), visit)
    }

    fn traverse_from<V>(
        &self,
        node: Key,
        prefix: Bits,
        abort_signal: Option<&Arc<AtomicBool>>,
        visit: &mut V,
    ) -> SmtResult<()>
    where
        V: FnMut(&Bits, Key, &Node) -> SmtResult<bool>,
    {
        if node.is_zero() {
            return Ok(());
        }
        check_abort_signal(abort_signal)?;

        let record = self.db.get_node(&node).copied().unwrap_or(Node::EMPTY);
        if !visit(&prefix, node, &record)? || record.is_final() {
            return Ok(());
        }
        self.traverse_from(record.left(), prefix.add_bit(false), abort_signal, visit)?;
        self.traverse_from(record.right(), prefix.add_bit(true), abort_signal, visit)
    }
}
