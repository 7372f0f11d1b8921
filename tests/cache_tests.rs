use scalead::cache::RecencyCache;
use scalead::config::ConfigError;

#[test]
fn evicts_least_recently_used_and_reorders_on_reinsert() {
    let mut c: RecencyCache<&str> = RecencyCache::new(2).unwrap();
    assert_eq!(c.insert("A"), None);
    assert_eq!(c.insert("B"), None);
    assert_eq!(c.insert("C"), Some("A"));
    assert_eq!(c.to_list(), vec!["B", "C"]);

    assert_eq!(c.insert("B"), None);
    assert_eq!(c.to_list(), vec!["C", "B"]);
}

#[test]
fn length_never_exceeds_capacity() {
    let mut c: RecencyCache<u32> = RecencyCache::new(5).unwrap();
    for i in 0..100u32 {
        c.insert((i * 7) % 13);
        assert!(c.len() <= 5);
    }
    assert_eq!(c.len(), 5);
}

#[test]
fn reinserting_present_key_does_not_grow() {
    let mut c: RecencyCache<u32> = RecencyCache::new(3).unwrap();
    c.insert(1);
    c.insert(2);
    c.insert(1);
    c.insert(1);
    assert_eq!(c.len(), 2);
    assert_eq!(c.to_list(), vec![2, 1]);
}

#[test]
fn zero_capacity_is_a_config_error() {
    let err = RecencyCache::<u32>::new(0).unwrap_err();
    assert!(matches!(err, ConfigError::NonPositiveCapacity { capacity: 0, .. }));
}

#[test]
fn values_are_kept_and_replaced() {
    let mut c: RecencyCache<u64, String> = RecencyCache::new(2).unwrap();
    c.put(1, "first".to_string());
    c.put(2, "second".to_string());
    assert_eq!(c.put(1, "first again".to_string()), None);
    let values: Vec<&String> = c.values_oldest_first().collect();
    assert_eq!(values, vec!["second", "first again"]);

    let evicted = c.put(3, "third".to_string());
    assert_eq!(evicted, Some((2, "second".to_string())));
    assert_eq!(c.get(&1).map(String::as_str), Some("first again"));
}

#[test]
fn touch_promotes_without_changing_value() {
    let mut c: RecencyCache<&str, u8> = RecencyCache::new(2).unwrap();
    c.put("a", 1);
    c.put("b", 2);
    assert!(c.touch(&"a"));
    assert!(!c.touch(&"zzz"));
    c.put("c", 3);
    assert!(c.contains(&"a"));
    assert!(!c.contains(&"b"));
    assert_eq!(c.capacity(), 2);
}
