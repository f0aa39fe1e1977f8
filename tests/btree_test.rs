use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tempfile::{tempdir, TempDir};
use vibetree::access::{FieldType, RangePredicate, Tuple, Value};
use vibetree::storage::BufferPoolManager;
use vibetree::{BTree, IndexConfig, IndexDescriptor, IndexError};

const INT_PAIR: [FieldType; 2] = [FieldType::Int32, FieldType::Int32];

fn create_tree(page_size: usize, fields: &[FieldType], key_fields: usize) -> Result<(BTree, TempDir)> {
    let dir = tempdir()?;
    let config = IndexConfig {
        page_size,
        buffer_frames: 128,
        ..Default::default()
    };
    let pool = BufferPoolManager::with_lru(page_size, config.buffer_frames)?;
    let descriptor = IndexDescriptor::new(fields.to_vec(), key_fields)?;
    let tree = BTree::create(pool, &dir.path().join("index.vt"), descriptor, config)?;
    Ok((tree, dir))
}

fn row(key: i32, payload: i32) -> Tuple {
    Tuple::from_values(&[Value::Int32(key), Value::Int32(payload)])
}

fn key(k: i32) -> Tuple {
    Tuple::from_values(&[Value::Int32(k)])
}

fn first_int(tuple: &Tuple) -> i32 {
    i32::from_le_bytes([
        tuple.field(0)[0],
        tuple.field(0)[1],
        tuple.field(0)[2],
        tuple.field(0)[3],
    ])
}

fn scan_keys(tree: &BTree, predicate: RangePredicate) -> Result<Vec<i32>> {
    let accessor = tree.create_accessor();
    let mut keys = Vec::new();
    for tuple in accessor.range(predicate)? {
        keys.push(first_int(&tuple?));
    }
    Ok(keys)
}

fn leaf_chain_length(tree: &BTree) -> Result<u64> {
    tree.verify()?;
    Ok(tree.statistics()?.leaf_pages)
}

#[test]
fn test_sequential_inserts_on_small_pages() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    for k in 1..=1000 {
        accessor.insert(&row(k, k))?;
    }

    assert!(leaf_chain_length(&tree)? >= 100);
    assert_eq!(
        scan_keys(&tree, RangePredicate::all())?,
        (1..=1000).collect::<Vec<_>>()
    );
    assert_eq!(tree.root_page_id().0, 1);
    assert_eq!(tree.buffer_pool().pinned_frames(), 0);
    Ok(())
}

#[test]
fn test_delete_even_keys() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    for k in 1..=1000 {
        accessor.insert(&row(k, k))?;
    }
    for k in (2..=1000).step_by(2) {
        accessor.delete(&key(k))?;
    }

    let odd: Vec<i32> = (1..=999).step_by(2).collect();
    let scanned = scan_keys(&tree, RangePredicate::all())?;
    assert_eq!(scanned.len(), 500);
    assert_eq!(scanned, odd);
    // verify() walks the sibling chain against the tree order.
    tree.verify()?;

    let backward = scan_keys(&tree, RangePredicate::all().backward())?;
    assert_eq!(backward, odd.iter().rev().copied().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_disjoint_concurrent_inserts() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;

    std::thread::scope(|s| {
        for t in 0..4 {
            let tree = &tree;
            s.spawn(move || {
                let accessor = tree.create_accessor();
                for k in t * 250..(t + 1) * 250 {
                    accessor.insert(&row(k, t)).unwrap();
                }
            });
        }
    });

    tree.verify()?;
    assert_eq!(
        scan_keys(&tree, RangePredicate::all())?,
        (0..1000).collect::<Vec<_>>()
    );
    assert_eq!(tree.buffer_pool().pinned_frames(), 0);
    Ok(())
}

#[test]
fn test_shuffled_concurrent_inserts_never_give_up() -> Result<()> {
    const THREADS: i32 = 8;
    const PER_THREAD: i32 = 150;

    for round in 0..5u64 {
        let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
        let failures: Vec<(i32, IndexError)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let tree = &tree;
                    s.spawn(move || {
                        let accessor = tree.create_accessor();
                        let mut keys: Vec<i32> = (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
                        keys.shuffle(&mut StdRng::seed_from_u64(round * 100 + t as u64));
                        let mut failed = Vec::new();
                        for k in keys {
                            if let Err(err) = accessor.insert(&row(k, t)) {
                                failed.push((k, err));
                            }
                        }
                        failed
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert!(
            !failures
                .iter()
                .any(|(_, err)| matches!(err, IndexError::RestartsExhausted { .. })),
            "round {}: inserts gave up: {:?}",
            round,
            failures
        );
        assert!(failures.is_empty(), "round {}: {:?}", round, failures);
        tree.verify()?;
        assert_eq!(
            scan_keys(&tree, RangePredicate::all())?,
            (0..THREADS * PER_THREAD).collect::<Vec<_>>()
        );
        assert_eq!(tree.buffer_pool().pinned_frames(), 0);
    }
    Ok(())
}

#[test]
fn test_bulk_load_then_point_search() -> Result<()> {
    let (tree, _dir) = create_tree(1024, &INT_PAIR, 1)?;
    let mut loader = tree.begin_bulk_load(0.9)?;
    for k in 0..10_000 {
        loader.add(&row(k, k * 2))?;
    }
    loader.end()?;
    tree.verify()?;

    let accessor = tree.create_accessor();
    for k in (0..10_000).step_by(37) {
        assert_eq!(accessor.point_search(&key(k))?, Some(row(k, k * 2)));
    }
    for k in [-1, -37, -10_000, 10_000, 20_001] {
        assert_eq!(accessor.point_search(&key(k))?, None);
    }
    Ok(())
}

#[test]
fn test_duplicate_insert_changes_nothing() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    for k in 0..100 {
        accessor.insert(&row(k, k))?;
    }
    let before: Vec<Tuple> = accessor.range(RangePredicate::all())?.collect::<Result<_, _>>()?;

    let err = accessor.insert(&row(42, -1)).unwrap_err();
    assert!(matches!(err, IndexError::DuplicateKey));
    assert!(err.is_bad_input());

    let after: Vec<Tuple> = accessor.range(RangePredicate::all())?.collect::<Result<_, _>>()?;
    assert_eq!(
        before.iter().map(|t| t.as_bytes().to_vec()).collect::<Vec<_>>(),
        after.iter().map(|t| t.as_bytes().to_vec()).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_range_bounds() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    let keys: BTreeSet<i32> = (0..300).map(|k| k * 3).collect();
    for &k in &keys {
        accessor.insert(&row(k, 0))?;
    }

    let bounds = [-5, 0, 1, 3, 100, 450, 451, 897, 900];
    for &low in &bounds {
        for &high in &bounds {
            for low_inclusive in [true, false] {
                for high_inclusive in [true, false] {
                    let lower = if low_inclusive {
                        Bound::Included(low)
                    } else {
                        Bound::Excluded(low)
                    };
                    let upper = if high_inclusive {
                        Bound::Included(high)
                    } else {
                        Bound::Excluded(high)
                    };
                    let expected: Vec<i32> =
                        if low < high || (low == high && low_inclusive && high_inclusive) {
                            keys.range((lower, upper)).copied().collect()
                        } else {
                            Vec::new()
                        };

                    let predicate =
                        RangePredicate::new(Some(key(low)), low_inclusive, Some(key(high)), high_inclusive);
                    assert_eq!(
                        scan_keys(&tree, predicate.clone())?,
                        expected,
                        "forward {:?}..{:?}",
                        lower,
                        upper
                    );
                    let mut reversed = expected.clone();
                    reversed.reverse();
                    assert_eq!(
                        scan_keys(&tree, predicate.backward())?,
                        reversed,
                        "backward {:?}..{:?}",
                        lower,
                        upper
                    );
                }
            }
        }
    }

    // Open sides.
    assert_eq!(
        scan_keys(&tree, RangePredicate::all().with_low(key(890), false))?,
        vec![891, 894, 897]
    );
    assert_eq!(
        scan_keys(&tree, RangePredicate::all().with_high(key(6), true).backward())?,
        vec![6, 3, 0]
    );
    Ok(())
}

#[test]
fn test_prefix_scan_on_composite_key() -> Result<()> {
    let fields = [FieldType::Int32, FieldType::Utf8, FieldType::Int64];
    let (tree, _dir) = create_tree(256, &fields, 2)?;
    let accessor = tree.create_accessor();
    for group in 0..20 {
        for name in ["ant", "bee", "cat", "dog", "eel"] {
            accessor.insert(&Tuple::from_values(&[
                Value::Int32(group),
                Value::from(name),
                Value::Int64(group as i64 * 100),
            ]))?;
        }
    }
    tree.verify()?;

    let prefix = Tuple::from_values(&[Value::Int32(7)]);
    let found: Vec<Tuple> = accessor
        .range(RangePredicate::prefix(prefix.clone()))?
        .collect::<Result<_, _>>()?;
    let names: Vec<Vec<Value>> = found
        .iter()
        .map(|t| t.to_values(&fields))
        .collect::<Result<_, _>>()?;
    assert_eq!(names.len(), 5);
    assert!(names.iter().all(|values| values[0] == Value::Int32(7)));
    assert_eq!(names[0][1], Value::from("ant"));
    assert_eq!(names[4][1], Value::from("eel"));

    let backward: Vec<Tuple> = accessor
        .range(RangePredicate::prefix(prefix).backward())?
        .collect::<Result<_, _>>()?;
    assert_eq!(backward, found.into_iter().rev().collect::<Vec<_>>());

    // Exclusive prefix bounds skip the whole group.
    let after_seven = accessor
        .range(RangePredicate::all().with_low(Tuple::from_values(&[Value::Int32(7)]), false))?
        .next()
        .transpose()?;
    let first = after_seven.map(|t| t.to_values(&fields)).transpose()?;
    assert_eq!(first.map(|values| values[0].clone()), Some(Value::Int32(8)));
    Ok(())
}

#[test]
fn test_cursor_reuse_and_close() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    for k in 0..50 {
        accessor.insert(&row(k, k))?;
    }

    let mut cursor = accessor.create_cursor();
    assert!(!cursor.has_next()?);

    accessor.search(&mut cursor, RangePredicate::new(Some(key(10)), true, Some(key(12)), true))?;
    assert!(cursor.has_next()?);
    assert!(cursor.has_next()?);
    assert_eq!(cursor.get_next()?, Some(row(10, 10)));
    assert_eq!(tree.buffer_pool().pinned_frames(), 1);

    accessor.search(&mut cursor, RangePredicate::all().with_low(key(48), true))?;
    assert_eq!(cursor.get_next()?, Some(row(48, 48)));
    assert_eq!(cursor.get_next()?, Some(row(49, 49)));
    assert_eq!(cursor.get_next()?, None);
    assert_eq!(tree.buffer_pool().pinned_frames(), 0);

    accessor.search(&mut cursor, RangePredicate::all())?;
    cursor.close();
    cursor.close();
    assert_eq!(cursor.get_next()?, None);
    assert_eq!(tree.buffer_pool().pinned_frames(), 0);
    Ok(())
}

#[test]
fn test_disk_order_scan_sees_every_tuple() -> Result<()> {
    let (tree, _dir) = create_tree(128, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    for k in (0..400).rev() {
        accessor.insert(&row(k, k))?;
    }
    for k in (0..400).step_by(3) {
        accessor.delete(&key(k))?;
    }

    let mut seen: Vec<i32> = Vec::new();
    for tuple in accessor.disk_order_scan() {
        seen.push(first_int(&tuple?));
    }
    seen.sort_unstable();
    let expected: Vec<i32> = (0..400).filter(|k| k % 3 != 0).collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Insert,
    Update,
    Upsert,
    Delete,
}

#[test]
fn test_random_operations_match_model() -> Result<()> {
    let (tree, _dir) = create_tree(256, &INT_PAIR, 1)?;
    let accessor = tree.create_accessor();
    let mut model: BTreeMap<i32, i32> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for step in 0..4000 {
        let k = rng.gen_range(0..600);
        let v = rng.gen_range(-1000..1000);
        let op = match rng.gen_range(0..10) {
            0..=3 => Op::Insert,
            4..=5 => Op::Delete,
            6..=7 => Op::Update,
            _ => Op::Upsert,
        };

        let outcome = match op {
            Op::Insert => accessor.insert(&row(k, v)),
            Op::Update => accessor.update(&row(k, v)),
            Op::Upsert => accessor.upsert(&row(k, v)),
            Op::Delete => accessor.delete(&key(k)),
        };
        let present = model.contains_key(&k);
        match (op, present) {
            (Op::Insert, true) => assert!(matches!(outcome, Err(IndexError::DuplicateKey))),
            (Op::Update, false) | (Op::Delete, false) => {
                assert!(matches!(outcome, Err(IndexError::NonexistentKey)))
            }
            (Op::Delete, true) => {
                outcome?;
                model.remove(&k);
            }
            _ => {
                outcome?;
                model.insert(k, v);
            }
        }

        if step % 500 == 0 {
            tree.verify()?;
        }
    }

    tree.verify()?;
    let scanned: Vec<(i32, i32)> = accessor
        .range(RangePredicate::all())?
        .map(|t| -> Result<(i32, i32)> {
            let t = t?;
            let values = t.to_values(&INT_PAIR)?;
            match (&values[0], &values[1]) {
                (Value::Int32(k), Value::Int32(v)) => Ok((*k, *v)),
                other => anyhow::bail!("unexpected values {:?}", other),
            }
        })
        .collect::<Result<_>>()?;
    assert_eq!(scanned, model.into_iter().collect::<Vec<_>>());
    assert_eq!(tree.buffer_pool().pinned_frames(), 0);
    Ok(())
}
