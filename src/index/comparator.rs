//! Key comparators used by the B+tree. The tree never compares keys
//! directly; every ordering decision goes through the comparator it was
//! constructed with.

use std::cmp::Ordering;

pub type KeyComparator<K> = fn(&K, &K) -> Ordering;

pub fn default_comparator<K: Ord>(a: &K, b: &K) -> Ordering {
    a.cmp(b)
}

pub fn reverse_comparator<K: Ord>(a: &K, b: &K) -> Ordering {
    b.cmp(a)
}
