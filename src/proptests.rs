use super::*;

use crate::update::AnnouncementScanner;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::convert::Infallible;

/// Reference model: what the database should hold after each step.
#[derive(Clone, Debug, Default)]
struct Model {
    active: BTreeMap<HostId, (Weight, u64)>,
    inactive: BTreeMap<HostId, (Weight, u64)>,
}

impl Model {
    fn total_weight(&self) -> u128 {
        self.active.values().map(|(w, _)| u128::from(*w)).sum()
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insert(String, Weight),
    Remove(String),
    Deactivate(String),
    Activate(String),
    /// Apply a block of announcements on top of the chain.
    Apply(Vec<(String, Weight)>),
    /// Rewind this many blocks off the top of the chain.
    Rewind(usize),
}

struct Scanner;

impl AnnouncementScanner for Scanner {
    type Block = Vec<(String, Weight)>;
    type Error = Infallible;

    fn scan(&self, _height: BlockHeight, block: &Self::Block) -> Result<Vec<HostEntry>, Infallible> {
        Ok(block
            .iter()
            .map(|(id, weight)| HostEntry::new(id.as_str(), *weight))
            .collect())
    }
}

fn id_strategy() -> impl Strategy<Value = String> + Clone {
    // A small id space so collisions, repeats and removals actually happen.
    (0u8..24).prop_map(|i| format!("host{i}"))
}

fn weight_strategy() -> impl Strategy<Value = Weight> + Clone {
    prop_oneof![
        8 => 1u64..1_000,
        1 => Just(u64::MAX),
        1 => Just(0u64),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let id = id_strategy();
    let weight = weight_strategy();
    let op = prop_oneof![
        30 => (id.clone(), weight.clone()).prop_map(|(i, w)| Op::Insert(i, w)),
        15 => id.clone().prop_map(Op::Remove),
        8 => id.clone().prop_map(Op::Deactivate),
        8 => id.clone().prop_map(Op::Activate),
        15 => prop::collection::vec((id, weight), 0..4).prop_map(Op::Apply),
        10 => (1usize..3).prop_map(Op::Rewind),
    ];
    prop::collection::vec(op, 0..=300)
}

fn check_against_model(db: &HostDb, model: &Model) -> Result<(), TestCaseError> {
    db.validate();
    prop_assert_eq!(db.len(), model.active.len());
    prop_assert_eq!(db.inactive_len(), model.inactive.len());
    prop_assert_eq!(db.total_weight(), model.total_weight());
    for (id, (weight, _)) in &model.active {
        prop_assert!(db.is_active(id.as_str()));
        prop_assert_eq!(db.get(id.as_str()).map(|e| e.weight), Some(*weight));
    }
    for id in model.inactive.keys() {
        prop_assert!(db.contains(id.as_str()));
        prop_assert!(!db.is_active(id.as_str()));
    }
    Ok(())
}

fn model_retract(model: &mut Model, id: &HostId, weight: Weight) {
    if weight == 0 {
        return;
    }
    for index in [&mut model.active, &mut model.inactive] {
        if let Some((_, count)) = index.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                index.remove(id);
            }
            return;
        }
    }
}

fn model_announce(model: &mut Model, id: HostId, weight: Weight) {
    if weight == 0 {
        return;
    }
    if let Some((_, count)) = model.active.get_mut(&id) {
        *count += 1;
    } else if let Some((_, count)) = model.inactive.get_mut(&id) {
        *count += 1;
    } else {
        model.active.insert(id, (weight, 1));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy()) {
        let db = HostDb::new();
        let mut model = Model::default();
        let mut chain: Vec<Vec<(String, Weight)>> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(id, weight) => {
                    let got = db.insert(HostEntry::new(id.as_str(), weight));
                    let key = HostId::from(id);
                    if weight == 0 {
                        prop_assert_eq!(got, Err(HostDbError::ZeroWeight(key)));
                    } else if model.active.contains_key(&key) {
                        prop_assert_eq!(got, Err(HostDbError::AlreadyExists(key)));
                    } else {
                        prop_assert_eq!(got, Ok(()));
                        let count = model.inactive.remove(&key).map(|(_, c)| c).unwrap_or(1);
                        model.active.insert(key, (weight, count));
                    }
                }
                Op::Remove(id) => {
                    let got = db.remove(&id);
                    let key = HostId::from(id);
                    let known = model.active.remove(&key).is_some()
                        || model.inactive.remove(&key).is_some();
                    if known {
                        prop_assert_eq!(got, Ok(()));
                    } else {
                        prop_assert_eq!(got, Err(HostDbError::NotFound(key)));
                    }
                }
                Op::Deactivate(id) => {
                    let got = db.deactivate(&id);
                    let key = HostId::from(id);
                    match model.active.remove(&key) {
                        Some(host) => {
                            prop_assert_eq!(got, Ok(()));
                            model.inactive.insert(key, host);
                        }
                        None => prop_assert_eq!(got, Err(HostDbError::NotFound(key))),
                    }
                }
                Op::Activate(id) => {
                    let got = db.activate(&id);
                    let key = HostId::from(id);
                    match model.inactive.remove(&key) {
                        Some(host) => {
                            prop_assert_eq!(got, Ok(()));
                            model.active.insert(key, host);
                        }
                        None => prop_assert_eq!(got, Err(HostDbError::NotInactive(key))),
                    }
                }
                Op::Apply(block) => {
                    let height = chain.len() as BlockHeight;
                    prop_assert!(db.update(&Scanner, height, &[], std::slice::from_ref(&block)).is_ok());
                    for (id, weight) in &block {
                        model_announce(&mut model, HostId::from(id.as_str()), *weight);
                    }
                    chain.push(block);
                }
                Op::Rewind(n) => {
                    let n = n.min(chain.len());
                    let rewound: Vec<_> = chain.drain(chain.len() - n..).rev().collect();
                    let height = chain.len() as BlockHeight;
                    prop_assert!(db.update(&Scanner, height, &rewound, &[]).is_ok());
                    for block in &rewound {
                        for (id, weight) in block {
                            model_retract(&mut model, &HostId::from(id.as_str()), *weight);
                        }
                    }
                }
            }

            check_against_model(&db, &model)?;
        }
    }

    #[test]
    fn prop_sampled_host_is_active(
        hosts in prop::collection::btree_map(id_strategy(), 1u64..10_000, 1..24),
        seed in any::<u64>(),
    ) {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let db = HostDb::new();
        for (id, weight) in &hosts {
            db.insert(HostEntry::new(id.as_str(), *weight)).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..64 {
            let host = db.random_host_with(&mut rng).unwrap();
            prop_assert_eq!(hosts.get(host.id.as_str()), Some(&host.weight));
        }
    }
}

/// Every ordering of `items`, by Heap's algorithm.
fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    let mut current = items.to_vec();
    let mut counters = vec![0usize; current.len()];
    let mut all = vec![current.clone()];
    let mut i = 1;
    while i < current.len() {
        if counters[i] < i {
            let j = if i % 2 == 0 { 0 } else { counters[i] };
            current.swap(j, i);
            all.push(current.clone());
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }
    all
}

#[test]
fn permutations_are_distinct_and_complete() {
    let mut perms = permutations(&[1, 2, 3, 4]);
    assert_eq!(perms.len(), 24);
    perms.sort();
    perms.dedup();
    assert_eq!(perms.len(), 24);
}

#[test]
fn exhaustive_remove_order_small_set() {
    let hosts: Vec<(&str, Weight)> = vec![
        ("a", 1),
        ("b", 2),
        ("c", 3),
        ("d", 5),
        ("e", 8),
        ("f", 13),
    ];

    for perm in permutations(&hosts) {
        let db = HostDb::new();
        for (id, weight) in &hosts {
            db.insert(HostEntry::new(*id, *weight)).unwrap();
        }
        let mut remaining: u128 = hosts.iter().map(|(_, w)| u128::from(*w)).sum();

        for (id, weight) in perm {
            db.remove(id).unwrap();
            remaining -= u128::from(weight);
            assert_eq!(db.total_weight(), remaining);
            db.validate();
        }
        assert!(db.is_empty());
    }
}

#[test]
fn exhaustive_insert_order_lookup() {
    let hosts: Vec<(&str, Weight)> = vec![("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)];

    for perm in permutations(&hosts) {
        let mut tree = WeightTree::new();
        for (id, weight) in &perm {
            tree.insert(HostEntry::new(*id, *weight));
        }
        tree.validate();

        // Every weight in range maps to some entry, each entry exactly as
        // often as its weight.
        let mut hits: BTreeMap<HostId, u128> = BTreeMap::new();
        for w in 0..tree.total_weight() {
            *hits.entry(tree.entry_at_weight(w).id.clone()).or_default() += 1;
        }
        for (id, weight) in &hosts {
            assert_eq!(hits[&HostId::from(*id)], u128::from(*weight));
        }
    }
}
