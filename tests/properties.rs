//! Property tests for determinism, proof soundness and pruning safety

use proptest::prelude::*;
use rhizome_trees::{
    verify, Change, CommitInfo, Config, Database, Hash, KeyOrdering, Proof, RetentionPolicy,
};
use std::collections::BTreeMap;

fn ordering() -> impl Strategy<Value = KeyOrdering> {
    prop_oneof![Just(KeyOrdering::Lexicographic), Just(KeyOrdering::Hashed)]
}

/// Short keys over a tiny alphabet so paths share prefixes often
fn key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', 0u8, 0xff]), 0..6)
}

/// Values on both sides of the inline threshold
fn value() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..8),
        prop::collection::vec(any::<u8>(), 33..80),
    ]
}

fn build(db: &Database, pairs: &BTreeMap<Vec<u8>, Vec<u8>>, order: &[usize]) -> Hash {
    let entries: Vec<_> = pairs.iter().collect();
    let changes: Vec<Change> = order
        .iter()
        .map(|&i| {
            let (k, v) = entries[i];
            Change::Put(k.clone(), v.clone())
        })
        .collect();
    db.tree().apply(Hash::ZERO, &changes).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn root_is_independent_of_write_order(
        ordering in ordering(),
        (pairs, shuffled) in prop::collection::btree_map(key(), value(), 0..24)
            .prop_flat_map(|pairs| {
                let order: Vec<usize> = (0..pairs.len()).collect();
                (Just(pairs), Just(order).prop_shuffle())
            }),
    ) {
        let db = Database::in_memory(Config::default().with_ordering(ordering)).unwrap();
        let forward: Vec<usize> = (0..pairs.len()).collect();

        let a = build(&db, &pairs, &forward);
        let b = build(&db, &pairs, &shuffled);
        prop_assert_eq!(a, b);

        let listed: BTreeMap<Vec<u8>, Vec<u8>> = db.tree().entries(a).unwrap().into_iter().collect();
        prop_assert_eq!(listed, pairs);
    }

    #[test]
    fn deletes_return_to_the_same_root(
        ordering in ordering(),
        keep in prop::collection::btree_map(key(), value(), 0..12),
        extra in prop::collection::btree_map(key(), value(), 1..12),
    ) {
        let db = Database::in_memory(Config::default().with_ordering(ordering)).unwrap();
        let tree = db.tree();
        let extra: BTreeMap<_, _> = extra.into_iter().filter(|(k, _)| !keep.contains_key(k)).collect();

        let base = build(&db, &keep, &(0..keep.len()).collect::<Vec<_>>());
        let mut root = base;
        for (k, v) in &extra {
            root = tree.insert(root, k, v).unwrap();
        }
        for k in extra.keys() {
            root = tree.remove(root, k).unwrap();
        }
        prop_assert_eq!(root, base);
    }

    #[test]
    fn proofs_verify_and_reject_wrong_claims(
        ordering in ordering(),
        pairs in prop::collection::btree_map(key(), value(), 1..16),
        probe in key(),
    ) {
        let db = Database::in_memory(Config::default().with_ordering(ordering)).unwrap();
        let root = build(&db, &pairs, &(0..pairs.len()).collect::<Vec<_>>());

        for (k, v) in &pairs {
            let proof = db.prove(root, k).unwrap();
            prop_assert!(verify(&proof, root, k, Some(v.as_slice())));
            let mut wrong = v.clone();
            wrong.push(0);
            prop_assert!(!verify(&proof, root, k, Some(wrong.as_slice())));
            prop_assert!(!verify(&proof, root, k, None));
        }

        let proof = db.prove(root, &probe).unwrap();
        match pairs.get(&probe) {
            Some(v) => prop_assert!(verify(&proof, root, &probe, Some(v.as_slice()))),
            None => {
                prop_assert!(!proof.is_inclusion());
                prop_assert!(verify(&proof, root, &probe, None));
            }
        }
    }

    #[test]
    fn mutated_proof_bytes_never_verify(
        ordering in ordering(),
        pairs in prop::collection::btree_map(key(), value(), 1..10),
        probe in key(),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let db = Database::in_memory(Config::default().with_ordering(ordering)).unwrap();
        let root = build(&db, &pairs, &(0..pairs.len()).collect::<Vec<_>>());
        let expected = pairs.get(&probe).map(|v| v.as_slice());

        let mut bytes = db.prove(root, &probe).unwrap().to_bytes().unwrap();
        let i = position.index(bytes.len());
        bytes[i] ^= flip;

        let accepted = Proof::from_bytes(&bytes)
            .map(|p| verify(&p, root, &probe, expected))
            .unwrap_or(false);
        prop_assert!(!accepted);
    }

    #[test]
    fn pruning_preserves_retained_versions(
        versions in prop::collection::vec(prop::collection::btree_map(key(), value(), 0..6), 1..6),
        depth in 0usize..3,
    ) {
        let db = Database::in_memory(Config::default()).unwrap();
        let mut heads = Vec::new();
        for (i, changes) in versions.iter().enumerate() {
            let changes: Vec<Change> = changes
                .iter()
                .map(|(k, v)| Change::Put(k.clone(), v.clone()))
                .collect();
            heads.push(db.apply("main", &changes, CommitInfo::message(format!("v{}", i))).unwrap());
        }

        let tip = *heads.last().unwrap();
        let live_from = heads.len().saturating_sub(depth + 1);
        let snapshot: Vec<_> = heads[live_from..]
            .iter()
            .map(|c| {
                let root = db.root_of(c).unwrap();
                (root, db.tree().entries(root).unwrap())
            })
            .collect();

        db.prune(&RetentionPolicy::commits([tip]).with_max_depth(depth)).unwrap();

        for (root, entries) in &snapshot {
            prop_assert_eq!(&db.tree().entries(*root).unwrap(), entries);
            for (k, v) in entries {
                let proof = db.prove(*root, k).unwrap();
                prop_assert!(verify(&proof, *root, k, Some(v.as_slice())));
            }
        }
        for dropped in &heads[..live_from] {
            prop_assert!(!db.graph().contains(dropped).unwrap());
        }
    }
}
