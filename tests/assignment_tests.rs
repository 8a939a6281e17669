use std::collections::{HashMap, HashSet};

use chime::coordinator::{decode_assignment, encode_assignment, rebalance, ShardRange};

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn covered(assignments: &HashMap<String, Vec<ShardRange>>) -> Vec<u32> {
    let mut shards: Vec<u32> = assignments
        .values()
        .flat_map(|ranges| ranges.iter().flat_map(|r| r.shards()))
        .collect();
    shards.sort();
    shards
}

fn assert_partition(assignments: &HashMap<String, Vec<ShardRange>>, shard_count: u32) {
    let shards = covered(assignments);
    assert_eq!(
        shards.len(),
        shard_count as usize,
        "every shard assigned exactly once"
    );
    let unique: HashSet<u32> = shards.iter().copied().collect();
    assert_eq!(unique.len(), shard_count as usize, "no overlaps");
    assert_eq!(*shards.first().unwrap(), 0);
    assert_eq!(*shards.last().unwrap(), shard_count - 1);
}

#[test]
fn test_single_picker_owns_everything() {
    let assignments = rebalance(1024, &ids(&["p0"]), &HashMap::new());
    assert_partition(&assignments, 1024);
    assert_eq!(assignments["p0"], vec![ShardRange { start: 0, end: 1024 }]);
}

#[test]
fn test_even_split_with_remainder() {
    let assignments = rebalance(10, &ids(&["a", "b", "c"]), &HashMap::new());
    assert_partition(&assignments, 10);

    let mut sizes: Vec<u32> = assignments
        .values()
        .map(|ranges| ranges.iter().map(ShardRange::len).sum())
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![3, 3, 4]);
}

#[test]
fn test_stable_when_membership_unchanged() {
    let live = ids(&["a", "b", "c"]);
    let first = rebalance(1024, &live, &HashMap::new());
    let second = rebalance(1024, &live, &first);
    assert_eq!(first, second);
}

#[test]
fn test_join_moves_minimal_shards() {
    let first = rebalance(100, &ids(&["a", "b"]), &HashMap::new());
    let second = rebalance(100, &ids(&["a", "b", "c"]), &first);
    assert_partition(&second, 100);

    // The incumbents keep their first 33/34 shards; only the surrendered
    // tail moves to the newcomer.
    for picker in ["a", "b"] {
        let before: HashSet<u32> = first[picker]
            .iter()
            .flat_map(|r| r.shards())
            .collect();
        let after: HashSet<u32> = second[picker]
            .iter()
            .flat_map(|r| r.shards())
            .collect();
        assert!(after.is_subset(&before), "{picker} only shrinks on join");
    }
}

#[test]
fn test_departed_picker_shards_redistributed() {
    let first = rebalance(100, &ids(&["a", "b", "c"]), &HashMap::new());
    let second = rebalance(100, &ids(&["a", "b"]), &first);
    assert_partition(&second, 100);

    for picker in ["a", "b"] {
        let before: HashSet<u32> = first[picker]
            .iter()
            .flat_map(|r| r.shards())
            .collect();
        let after: HashSet<u32> = second[picker]
            .iter()
            .flat_map(|r| r.shards())
            .collect();
        assert!(before.is_subset(&after), "{picker} keeps what it had");
    }
    assert!(!second.contains_key("c"));
}

#[test]
fn test_overlapping_previous_ranges_resolved() {
    // Handoff windows can leave two pickers claiming the same range.
    let mut previous = HashMap::new();
    previous.insert("a".to_string(), vec![ShardRange { start: 0, end: 8 }]);
    previous.insert("b".to_string(), vec![ShardRange { start: 0, end: 8 }]);

    let assignments = rebalance(8, &ids(&["a", "b"]), &previous);
    assert_partition(&assignments, 8);
}

#[test]
fn test_no_pickers_yields_no_assignments() {
    let assignments = rebalance(64, &[], &HashMap::new());
    assert!(assignments.is_empty());
}

#[test]
fn test_assignment_wire_roundtrip() {
    let ranges = vec![
        ShardRange { start: 0, end: 10 },
        ShardRange { start: 20, end: 32 },
    ];
    let encoded = encode_assignment(&ranges).unwrap();
    assert_eq!(decode_assignment(&encoded).unwrap(), ranges);
    assert!(decode_assignment("nonsense").is_err());
}
