use alloy_primitives::{Address, U256};
use plonky2::field::types::{Field, Sample};
use rand::seq::SliceRandom;
use rand::{random, thread_rng, Rng};

use crate::bits::Bits;
use crate::db::{Db, MemoryDb};
use crate::keys::{decode_key_source, KEY_BALANCE};
use crate::smt::{HashOut, Key, Smt, F};

fn rand_u256() -> U256 {
    U256::from_limbs(thread_rng().gen())
}

#[test]
fn test_add_and_rem() {
    let mut smt = Smt::<MemoryDb>::default();

    let k = Key(F::rand_array());
    let v = rand_u256();
    smt.set(k, v).unwrap();
    assert_eq!(v, smt.get(k).unwrap());

    smt.set(k, U256::ZERO).unwrap();
    assert_eq!(smt.root.elements, [F::ZERO; 4]);
}

#[test]
fn test_add_and_rem_hermez() {
    let mut smt = Smt::<MemoryDb>::default();

    let k = Key([F::ONE, F::ZERO, F::ZERO, F::ZERO]);
    let v = U256::from(2);
    smt.set(k, v).unwrap();
    assert_eq!(v, smt.get(k).unwrap());
    assert_eq!(
        smt.root.elements,
        [
            16483217357039062949,
            6830539605347455377,
            6826288191577443203,
            8219762152026661456
        ]
        .map(F::from_canonical_u64)
    );

    smt.set(k, U256::ZERO).unwrap();
    assert_eq!(smt.root.elements, [F::ZERO; 4]);
}

#[test]
fn test_update_element_1() {
    let mut smt = Smt::<MemoryDb>::default();

    let k = Key(F::rand_array());
    let v1 = rand_u256();
    let v2 = rand_u256();
    smt.set(k, v1).unwrap();
    let root = smt.root;
    smt.set(k, v2).unwrap();
    smt.set(k, v1).unwrap();
    assert_eq!(smt.root, root);
}

#[test]
fn test_add_shared_element_2() {
    let mut smt = Smt::<MemoryDb>::default();

    let k1 = Key(F::rand_array());
    let k2 = Key(F::rand_array());
    assert_ne!(k1, k2, "Unlucky");
    let v1 = rand_u256();
    let v2 = rand_u256();
    smt.set(k1, v1).unwrap();
    smt.set(k2, v2).unwrap();
    smt.set(k1, U256::ZERO).unwrap();
    smt.set(k2, U256::ZERO).unwrap();
    assert_eq!(smt.root.elements, [F::ZERO; 4]);
}

#[test]
fn test_add_shared_element_3() {
    let mut smt = Smt::<MemoryDb>::default();

    let k1 = Key(F::rand_array());
    let k2 = Key(F::rand_array());
    let k3 = Key(F::rand_array());
    let v1 = rand_u256();
    let v2 = rand_u256();
    let v3 = rand_u256();
    smt.set(k1, v1).unwrap();
    smt.set(k2, v2).unwrap();
    smt.set(k3, v3).unwrap();
    smt.set(k1, U256::ZERO).unwrap();
    smt.set(k2, U256::ZERO).unwrap();
    smt.set(k3, U256::ZERO).unwrap();
    assert_eq!(smt.root.elements, [F::ZERO; 4]);
}

#[test]
fn test_add_remove_128() {
    let mut smt = Smt::<MemoryDb>::default();

    let kvs = (0..128)
        .map(|_| {
            let k = Key(F::rand_array());
            let v = rand_u256();
            smt.set(k, v).unwrap();
            (k, v)
        })
        .collect::<Vec<_>>();
    for &(k, v) in &kvs {
        smt.set(k, v).unwrap();
    }
    for &(k, _) in &kvs {
        smt.set(k, U256::ZERO).unwrap();
    }
    assert_eq!(smt.root.elements, [F::ZERO; 4]);
}

#[test]
fn test_should_read_random() {
    let mut smt = Smt::<MemoryDb>::default();

    let kvs = (0..128)
        .map(|_| {
            let k = Key(F::rand_array());
            let v = rand_u256();
            smt.set(k, v).unwrap();
            (k, v)
        })
        .collect::<Vec<_>>();
    for &(k, v) in &kvs {
        smt.set(k, v).unwrap();
    }
    for &(k, v) in &kvs {
        assert_eq!(smt.get(k).unwrap(), v);
    }
}

#[test]
fn test_add_element_similar_key() {
    let mut smt = Smt::<MemoryDb>::default();

    let k1 = Key([F::ZERO; 4]);
    let k2 = Key([F::from_canonical_u16(15), F::ZERO, F::ZERO, F::ZERO]);
    let k3 = Key([F::from_canonical_u16(31), F::ZERO, F::ZERO, F::ZERO]);
    let v1 = U256::from(2);
    let v2 = U256::from(3);
    smt.set(k1, v1).unwrap();
    smt.set(k2, v1).unwrap();
    smt.set(k3, v2).unwrap();

    let expected_root = [
        442750481621001142,
        12174547650106208885,
        10730437371575329832,
        4693848817100050981,
    ]
    .map(F::from_canonical_u64);
    assert_eq!(smt.root.elements, expected_root);

    // a prefix-sharing neighbour is not a hit
    let absent = Key([F::from_canonical_u16(7), F::ZERO, F::ZERO, F::ZERO]);
    assert_eq!(smt.get(absent).unwrap(), U256::ZERO);
}

#[test]
fn test_leaf_one_level_depth() {
    let mut smt = Smt::<MemoryDb>::default();

    let k0 = Key([
        15508201873038097485,
        13226964191399612151,
        16289586894263066011,
        5039894867879804772,
    ]
    .map(F::from_canonical_u64));
    let k1 = Key([
        844617937539064431,
        8280782215217712600,
        776954566881514913,
        1946423943169448778,
    ]
    .map(F::from_canonical_u64));
    let k2 = Key([
        15434611863279822111,
        11975487827769517766,
        15368078704174133449,
        1970673199824226969,
    ]
    .map(F::from_canonical_u64));
    let k3 = Key([
        4947646911082557289,
        4015479196169929139,
        8997983193975654297,
        9607383237755583623,
    ]
    .map(F::from_canonical_u64));
    let k4 = Key([
        15508201873038097485,
        13226964191399612151,
        16289586894263066011,
        5039894867879804772,
    ]
    .map(F::from_canonical_u64));

    let v0 = U256::from_str_radix(
        "8163644824788514136399898658176031121905718480550577527648513153802600646339",
        10,
    )
    .unwrap();
    let v1 = U256::from_str_radix(
        "115792089237316195423570985008687907853269984665640564039457584007913129639934",
        10,
    )
    .unwrap();
    let v2 = U256::from_str_radix(
        "115792089237316195423570985008687907853269984665640564039457584007913129639935",
        10,
    )
    .unwrap();
    let v3 = U256::from_str_radix("7943875943875408", 10).unwrap();
    let v4 = U256::from_str_radix(
        "35179347944617143021579132182092200136526168785636368258055676929581544372820",
        10,
    )
    .unwrap();

    smt.set(k0, v0).unwrap();
    smt.set(k1, v1).unwrap();
    smt.set(k2, v2).unwrap();
    smt.set(k3, v3).unwrap();
    smt.set(k4, v4).unwrap();

    let expected_root = [
        13590506365193044307,
        13215874698458506886,
        4743455437729219665,
        1933616419393621600,
    ]
    .map(F::from_canonical_u64);
    assert_eq!(smt.root.elements, expected_root);
}

#[test]
fn test_no_write_0() {
    let mut smt = Smt::<MemoryDb>::default();

    let k1 = Key(F::rand_array());
    let k2 = Key(F::rand_array());
    let v = rand_u256();
    smt.set(k1, v).unwrap();
    let root = smt.root;
    smt.set(k2, U256::ZERO).unwrap();
    assert_eq!(smt.root, root);
}

#[test]
fn test_insert_hash_first_level() {
    let mut smt = Smt::<MemoryDb>::default();

    for _ in 0..128 {
        smt.set(Key(F::rand_array()), U256::from_limbs(random()))
            .unwrap();
    }

    let first_level = *smt.db.get_node(&smt.root_key()).unwrap();
    let mut hash_smt = Smt::<MemoryDb>::default();
    let zero = Bits {
        count: 1,
        packed: U256::ZERO,
    };
    let one = Bits {
        count: 1,
        packed: U256::from(1),
    };
    hash_smt
        .insert_hash_node(
            zero,
            HashOut {
                elements: first_level.0[0..4].try_into().unwrap(),
            },
        )
        .unwrap();
    hash_smt
        .insert_hash_node(
            one,
            HashOut {
                elements: first_level.0[4..8].try_into().unwrap(),
            },
        )
        .unwrap();

    assert_eq!(smt.root, hash_smt.root);
}

#[test]
fn test_insert_hash_order() {
    let mut smt = Smt::<MemoryDb>::default();

    let level = 4;

    let mut khs = (1..1 << level)
        .map(|i| {
            let k = Bits {
                count: level,
                packed: U256::from(i),
            };
            let hash = HashOut {
                elements: F::rand_array(),
            };
            (k, hash)
        })
        .collect::<Vec<_>>();
    for &(k, v) in &khs {
        smt.insert_hash_node(k, v).unwrap();
    }
    let key = loop {
        // Forgive my laziness
        let key = Key(F::rand_array());
        let keys = key.split();
        if (0..level).all(|i| !keys.get_bit(i)) {
            break key;
        }
    };
    let val = U256::from_limbs(random());
    smt.set(key, val).unwrap();

    let mut second_smt = Smt::<MemoryDb>::default();
    khs.shuffle(&mut thread_rng());
    for (k, v) in khs {
        second_smt.insert_hash_node(k, v).unwrap();
    }
    second_smt.set(key, val).unwrap();

    assert_eq!(smt.root, second_smt.root);
}

#[test]
fn test_insert_hash_rejects_occupied_slot() {
    let mut smt = Smt::<MemoryDb>::default();
    let path = Bits {
        count: 2,
        packed: U256::from(1),
    };
    let hash = HashOut {
        elements: F::rand_array(),
    };
    smt.insert_hash_node(path, hash).unwrap();
    assert!(smt.insert_hash_node(path, hash).is_err());
}

#[test]
fn test_account_leaves_resolve_key_sources() {
    let mut smt = Smt::<MemoryDb>::default();
    let addr = Address::repeat_byte(0x42);
    smt.set_account_balance(addr, U256::from(100)).unwrap();
    smt.set_account_nonce(addr, U256::from(1)).unwrap();

    // the delete collapses the nonce leaf's sibling back up, recreating
    // the balance leaf with a longer remainder key; the preimage index
    // must stay fresh through it
    smt.set_account_nonce(addr, U256::ZERO).unwrap();

    let mut leaves = 0;
    smt.traverse(smt.root_key(), None, &mut |_prefix, k, v| {
        if v.is_final() {
            leaves += 1;
            let trie_key = smt.db.get_hash_key(&k).expect("leaf has a preimage");
            let source = smt.db.get_key_source(&trie_key).expect("leaf has a source");
            let (kind, a, _slot) = decode_key_source(source).unwrap();
            assert_eq!((kind, a), (KEY_BALANCE, addr));
        }
        Ok(true)
    })
    .unwrap();
    assert_eq!(leaves, 1);
}
