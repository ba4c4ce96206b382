use std::cmp::Ordering;

use peerwire::rating::{Rating, select_unchoked};

#[test]
fn test_both_unsent_compare_received() {
    assert!(Rating::new(10, 0) > Rating::new(5, 0));
    assert!(Rating::new(0, 0) < Rating::new(1, 0));
    assert_eq!(Rating::new(3, 0).cmp(&Rating::new(3, 0)), Ordering::Equal);
}

#[test]
fn test_unsent_beats_any_sent() {
    assert!(Rating::new(0, 0) > Rating::new(1_000_000, 1));
    assert!(Rating::new(1, 1) < Rating::new(0, 0));
}

#[test]
fn test_ratio_comparison() {
    // 2/1 against 3/2
    assert!(Rating::new(2, 1) > Rating::new(3, 2));
    assert!(Rating::new(1, 4) < Rating::new(1, 3));
}

#[test]
fn test_equal_ratio_smaller_volume_is_smaller() {
    assert!(Rating::new(1, 1) < Rating::new(2, 2));
    assert!(Rating::new(6, 3) > Rating::new(2, 1));
}

#[test]
fn test_large_counters_do_not_overflow() {
    let a = Rating::new(u64::MAX, u64::MAX - 1);
    let b = Rating::new(u64::MAX - 1, u64::MAX);
    assert!(a > b);
}

#[test]
fn test_irreflexive_and_consistent_with_eq() {
    let samples = [
        Rating::new(0, 0),
        Rating::new(5, 0),
        Rating::new(1, 1),
        Rating::new(2, 2),
        Rating::new(3, 7),
    ];
    for r in samples {
        assert!(!(r < r));
        assert_eq!(r.cmp(&r), Ordering::Equal);
    }
    for a in samples {
        for b in samples {
            assert_eq!(a == b, a.cmp(&b) == Ordering::Equal, "{} vs {}", a, b);
            assert_eq!(a.cmp(&b), b.cmp(&a).reverse(), "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_transitive() {
    let samples = [
        Rating::new(0, 0),
        Rating::new(9, 0),
        Rating::new(1, 1),
        Rating::new(2, 2),
        Rating::new(1, 2),
        Rating::new(5, 3),
        Rating::new(0, 4),
    ];
    for a in samples {
        for b in samples {
            for c in samples {
                if a < b && b < c {
                    assert!(a < c, "{} < {} < {}", a, b, c);
                }
            }
        }
    }
}

#[test]
fn test_record_updates() {
    let mut r = Rating::default();
    r.record_received(100);
    r.record_sent(40);
    r.record_sent(10);
    assert_eq!(r.received(), 100);
    assert_eq!(r.sent(), 50);

    r.record_received(u64::MAX);
    assert_eq!(r.received(), u64::MAX);
}

#[test]
fn test_select_unchoked() {
    let candidates = vec![
        ("a", Rating::new(1, 4)),
        ("b", Rating::new(8, 2)),
        ("c", Rating::new(0, 0)),
        ("d", Rating::new(4, 1)),
        ("e", Rating::new(3, 3)),
    ];

    assert_eq!(select_unchoked(&candidates, 3), vec!["c", "b", "d"]);
    assert_eq!(select_unchoked(&candidates, 0), Vec::<&str>::new());
    assert_eq!(select_unchoked(&candidates, 10).len(), 5);
}

#[test]
fn test_select_unchoked_keeps_order_of_ties() {
    let candidates = vec![(1, Rating::new(2, 1)), (2, Rating::new(2, 1)), (3, Rating::new(2, 1))];
    assert_eq!(select_unchoked(&candidates, 2), vec![1, 2]);
}

#[test]
fn test_reference_orderings() {
    assert!(Rating::new(1, 2) < Rating::new(100, 200));
    assert!(Rating::new(1, 1) < Rating::new(100, 100));
    assert!(Rating::new(1, 0) < Rating::new(100, 0));
    assert!(Rating::new(5, 10) < Rating::new(50, 100));
    assert!(Rating::new(100, 1) < Rating::new(100, 0));
}
