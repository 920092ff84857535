#![cfg(feature = "serde")]

use scurry::IntMap;

#[test]
fn serialize_then_deserialize() {
    let map = IntMap::<String>::new();
    let guard = map.guard();
    map.insert(1, String::from("one"), &guard);
    map.insert(-2, String::from("minus two"), &guard);
    map.insert(300, String::from("three hundred"), &guard);

    let json = serde_json::to_string(&map).unwrap();
    let restored: IntMap<String> = serde_json::from_str(&json).unwrap();

    let guard = restored.guard();
    assert_eq!(restored.len(), 3);
    assert_eq!(restored.get(1, &guard), Some(&String::from("one")));
    assert_eq!(restored.get(-2, &guard), Some(&String::from("minus two")));
    assert_eq!(
        restored.get(300, &guard),
        Some(&String::from("three hundred"))
    );
}

#[test]
fn empty_map_round_trips() {
    let map = IntMap::<u64>::new();
    let json = serde_json::to_string(&map).unwrap();
    let restored: IntMap<u64> = serde_json::from_str(&json).unwrap();
    assert!(restored.is_empty());
}
