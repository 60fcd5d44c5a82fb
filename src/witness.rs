//! Witness extraction and reconstruction.
//!
//! A witness is a pre-order operator stream describing exactly the sub-trie
//! needed to recompute the root: retained positions expand into `Branch`
//! and `Leaf` operators, everything else collapses into an opaque `Hash`.
//! Because the walk is pre-order with a fixed left-before-right child
//! order, and every internal node is announced by exactly one `Branch`
//! carrying its arity, the stream needs no explicit positions: a path
//! stack replayed by the decoder recovers them.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::bits::Bits;
use crate::db::{Db, MemoryDb};
use crate::keys::{decode_key_source, KEY_BALANCE, KEY_NONCE, SC_CODE, SC_STORAGE};
use crate::smt::{Key, Smt, SmtError, SmtResult, F};
use crate::utils::{b2u, key2u, limbs2f, u2b, u2h};

/// Decides which trie positions a witness expands. Positions whose prefix
/// is not retained collapse into a single `Hash` operator.
pub trait RetainDecider {
    fn retain(&self, prefix: &Bits) -> bool;
}

/// Retains exactly the positions on the paths to a fixed set of keys.
#[derive(Debug, Clone, Default)]
pub struct RetainList {
    prefixes: HashSet<Bits>,
}

impl RetainList {
    /// Builds the prefix closure of the given keys' bit paths.
    pub fn new<K: Borrow<Key>, I: IntoIterator<Item = K>>(keys: I) -> Self {
        let mut prefixes = HashSet::new();
        for key in keys {
            let mut bits = key.borrow().split();
            loop {
                prefixes.insert(bits);
                if bits.is_empty() {
                    break;
                }
                bits.pop_next_bit();
            }
        }
        RetainList { prefixes }
    }
}

impl RetainDecider for RetainList {
    fn retain(&self, prefix: &Bits) -> bool {
        self.prefixes.contains(prefix)
    }
}

/// One step of the witness stream. The set is closed; a `Code` operator
/// always immediately precedes the `SC_CODE` leaf whose value hashes it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WitnessOperator {
    Branch {
        mask: u32,
    },
    Hash {
        hash: B256,
    },
    Leaf {
        node_type: u8,
        address: Address,
        storage_key: B256,
        value: Vec<u8>,
    },
    Code {
        code: Vec<u8>,
    },
}

/// An ordered operator stream proving a retained subset of the trie
/// against its root.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Witness {
    pub operators: Vec<WitnessOperator>,
}

/// Builds a witness for the trie under the given retention policy; `None`
/// retains everything. The walk aborts on the first error or when the
/// abort signal is raised.
pub fn build_witness<D: Db>(
    smt: &Smt<D>,
    rd: Option<&dyn RetainDecider>,
    abort_signal: Option<Arc<AtomicBool>>,
) -> SmtResult<Witness> {
    let mut operators = Vec::new();

    smt.traverse(smt.root_key(), abort_signal, &mut |prefix, k, v| {
        if let Some(rd) = rd {
            let retain = if v.is_final() {
                // a leaf is kept iff the position it hangs off is retained
                if prefix.is_empty() {
                    true
                } else {
                    let mut parent = *prefix;
                    parent.pop_next_bit();
                    rd.retain(&parent)
                }
            } else {
                rd.retain(prefix)
            };

            if !retain {
                operators.push(WitnessOperator::Hash {
                    hash: u2b(key2u(k)),
                });
                return Ok(false);
            }
        }

        if v.is_final() {
            let trie_key = smt
                .db
                .get_hash_key(&k)
                .ok_or_else(|| SmtError::KeySourceMissing(key2u(k)))?;
            let source = smt
                .db
                .get_key_source(&trie_key)
                .ok_or_else(|| SmtError::KeySourceMissing(key2u(trie_key)))?;
            let (node_type, address, storage_key) = decode_key_source(source)?;

            let record = smt.node(&v.value_hash())?;
            let value8: [F; 8] = record.0[0..8].try_into().unwrap();
            let value = limbs2f(value8).to_be_bytes_trimmed_vec();

            if node_type == SC_CODE {
                let code = smt
                    .db
                    .get_code(&value)
                    .ok_or_else(|| SmtError::MissingCode(limbs2f(value8)))?;
                operators.push(WitnessOperator::Code {
                    code: code.to_vec(),
                });
            }

            operators.push(WitnessOperator::Leaf {
                node_type,
                address,
                storage_key,
                value,
            });
            return Ok(false);
        }

        let mut mask = 0u32;
        if !v.left().is_zero() {
            mask |= 1;
        }
        if !v.right().is_zero() {
            mask |= 2;
        }
        if mask == 0 {
            return Err(SmtError::Structural("internal node with no children"));
        }
        operators.push(WitnessOperator::Branch { mask });
        Ok(true)
    })?;

    trace!("built witness with {} operators", operators.len());
    Ok(Witness { operators })
}

/// DFS bookkeeping for one internal node on the decoder's current path.
#[derive(Clone, Copy, Debug)]
struct Frame {
    expected: u32,
    seen: u32,
}

/// Rebuilds an in-memory SMT from an operator stream. The result's root
/// equals the source trie's root over the retained subset.
///
/// Leaf and hash operators are accumulated while the path stack replays
/// the encoder's walk, then applied in two phases: hash nodes first (they
/// must land in empty slots), then the account mutations, which recreate
/// the retained leaves through the regular write path.
pub fn build_from_witness(w: &Witness) -> SmtResult<Smt<MemoryDb>> {
    let mut smt = Smt::<MemoryDb>::default();

    let mut balances: HashMap<Address, U256> = HashMap::new();
    let mut nonces: HashMap<Address, U256> = HashMap::new();
    let mut codes: HashMap<Address, Vec<u8>> = HashMap::new();
    let mut storage: HashMap<Address, HashMap<B256, U256>> = HashMap::new();
    let mut hash_nodes: Vec<(Bits, B256)> = Vec::new();

    let mut path = Bits::empty();
    let mut frames: Vec<Frame> = Vec::new();
    let mut first = true;
    let mut done = false;

    for (i, operator) in w.operators.iter().enumerate() {
        if done {
            return Err(SmtError::Structural("operator after the stream completed"));
        }
        match operator {
            WitnessOperator::Branch { mask } => {
                if first {
                    first = false;
                } else {
                    let parent = frames
                        .last_mut()
                        .ok_or(SmtError::Structural("branch outside any subtree"))?;
                    parent.seen += 1;
                }
                let (expected, bit) = match mask {
                    1 => (1, false),
                    2 => (1, true),
                    3 => (2, false),
                    _ => return Err(SmtError::Structural("branch mask out of range")),
                };
                frames.push(Frame { expected, seen: 0 });
                path.push_bit(bit);
            }

            WitnessOperator::Leaf {
                node_type,
                address,
                storage_key,
                value,
            } => {
                let scalar = U256::try_from_be_slice(value)
                    .ok_or(SmtError::Structural("leaf value wider than 256 bits"))?;
                match *node_type {
                    KEY_BALANCE => {
                        balances.insert(*address, scalar);
                    }
                    KEY_NONCE => {
                        nonces.insert(*address, scalar);
                    }
                    SC_STORAGE => {
                        storage
                            .entry(*address)
                            .or_default()
                            .insert(*storage_key, scalar);
                    }
                    // code and code-length leaves are rebuilt from the
                    // bytecode carried by the preceding Code operator
                    _ => {}
                }
                ascend(&mut path, &mut frames, &mut done)?;
            }

            WitnessOperator::Hash { hash } => {
                hash_nodes.push((path, *hash));
                ascend(&mut path, &mut frames, &mut done)?;
            }

            WitnessOperator::Code { code } => {
                let owner = match w.operators.get(i + 1) {
                    Some(WitnessOperator::Leaf {
                        node_type, address, ..
                    }) if *node_type == SC_CODE => *address,
                    _ => return Err(SmtError::Structural("code operator without a code leaf")),
                };
                smt.db.add_code(code);
                codes.insert(owner, code.clone());
            }
        }
    }
    if !done && !w.operators.is_empty() {
        return Err(SmtError::Structural("stream ended inside a subtree"));
    }

    for (p, hash) in hash_nodes {
        smt.insert_hash_node(p, u2h(b2u(hash)))?;
    }
    for (addr, balance) in balances {
        smt.set_account_balance(addr, balance)?;
    }
    for (addr, nonce) in nonces {
        smt.set_account_nonce(addr, nonce)?;
    }
    for (addr, code) in codes {
        smt.set_contract_bytecode(addr, &code)?;
    }
    for (addr, slots) in storage {
        smt.set_contract_storage(addr, &slots)?;
    }

    trace!("rebuilt trie from {} operators", w.operators.len());
    Ok(smt)
}

/// Leaf-ascent: after consuming a leaf or hash at the current position,
/// moves the path to the next position the stream will fill, popping
/// completed subtrees and switching to a pending right sibling. An empty
/// path with no pending frames marks the stream complete.
fn ascend(path: &mut Bits, frames: &mut Vec<Frame>, done: &mut bool) -> SmtResult<()> {
    if path.is_empty() {
        // the consumed operator was the root itself
        *done = true;
        return Ok(());
    }
    path.pop_next_bit();
    frames
        .last_mut()
        .ok_or(SmtError::Structural("path stack underflow"))?
        .seen += 1;

    while !path.is_empty() && frames.last().is_some_and(|f| f.seen == f.expected) {
        frames.pop();
        path.pop_next_bit();
    }

    match frames.last() {
        Some(f) if f.seen < f.expected => path.push_bit(true),
        Some(_) => {
            frames.pop();
            *done = true;
        }
        None => return Err(SmtError::Structural("path stack underflow")),
    }
    Ok(())
}
