// SPDX-License-Identifier: AGPL-3.0-only

//! Slot-map invariants under random operation sequences

use npu_driver::{NpuError, SlotId, SlotMap};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};

#[derive(Debug, Clone)]
enum Op {
    Insert(u64),
    Release(u64),
    Peek(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..12).prop_map(Op::Insert),
        (0u64..12).prop_map(Op::Release),
        (0u64..12).prop_map(Op::Peek),
    ]
}

proptest! {
    #[test]
    fn one_slot_per_key(ops in prop::collection::vec(op(), 1..200)) {
        let map: SlotMap<u64> = SlotMap::new(2, 16, true);
        let mut live: HashMap<u64, SlotId> = HashMap::new();
        let mut stale: Vec<SlotId> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(k) => match map.insert(k, k) {
                    Ok((id, v)) => {
                        prop_assert!(!live.contains_key(&k));
                        prop_assert_eq!(*v, k);
                        prop_assert!(live.values().all(|other| other.index() != id.index()));
                        live.insert(k, id);
                    }
                    Err(NpuError::AlreadyExists { key }) => {
                        prop_assert_eq!(key, k);
                        prop_assert!(live.contains_key(&k));
                    }
                    Err(e) => prop_assert!(false, "unexpected {e}"),
                },
                Op::Release(k) => {
                    if let Some(id) = live.remove(&k) {
                        map.remove_by_index(id);
                        map.unuse(id, true);
                        stale.push(id);
                    }
                }
                Op::Peek(k) => {
                    if let Some(&id) = live.get(&k) {
                        let v = map.use_by_index(id).unwrap();
                        prop_assert_eq!(*v, k);
                        prop_assert_eq!(map.refs(id), 2);
                        map.unuse(id, true);
                    }
                }
            }
            prop_assert_eq!(map.len(), live.len());
        }

        for id in stale {
            prop_assert!(map.use_by_index(id).is_none());
        }
    }
}

#[test]
fn racing_inserts_of_one_key_have_one_winner() {
    const THREADS: usize = 8;
    let map: Arc<SlotMap<usize>> = Arc::new(SlotMap::new(4, 64, true));
    let barrier = Arc::new(Barrier::new(THREADS));

    let winners: usize = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                usize::from(map.insert(0xfeed, t).is_ok())
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();

    assert_eq!(winners, 1);
    assert_eq!(map.len(), 1);
}
