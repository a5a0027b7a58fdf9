//! flotilla-join — matching elements of two sequences, in the spirit of a
//! database join.
//!
//! Every reconciler in the system is built on the same primitive: diff a
//! sequence of desired things against a sequence of observed things and act
//! on the difference. [`hash_join`] pairs elements whose keys are equal;
//! [`score_join`] pairs elements by a cost function when no natural key
//! exists (for example matching database containers against runtime
//! containers whose ID may not be recorded yet).
//!
//! Both joins consume their matches one-to-one: an element appears in
//! exactly one of `pairs`, `lefts`, or `rights`. Neither join promises
//! anything about output order.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// The outcome of a join: matched pairs plus the unmatched leftovers from
/// each side.
#[derive(Debug)]
pub struct JoinResult<L, R> {
    /// Elements matched across the two sequences.
    pub pairs: Vec<(L, R)>,
    /// Left elements with no match.
    pub lefts: Vec<L>,
    /// Right elements with no match.
    pub rights: Vec<R>,
}

impl<L, R> Default for JoinResult<L, R> {
    fn default() -> Self {
        JoinResult {
            pairs: Vec::new(),
            lefts: Vec::new(),
            rights: Vec::new(),
        }
    }
}

/// Match each left element with a right element whose key is equal.
///
/// The hash table is built over the shorter side to bound memory. Elements
/// sharing a key queue up in first-seen order, so duplicates pair off
/// one-to-one rather than being dropped: `pairs.len() + lefts.len()`
/// always equals the left input length, and likewise on the right.
pub fn hash_join<L, R, K, KL, KR>(
    lefts: Vec<L>,
    rights: Vec<R>,
    lkey: KL,
    rkey: KR,
) -> JoinResult<L, R>
where
    K: Hash + Eq,
    KL: Fn(&L) -> K,
    KR: Fn(&R) -> K,
{
    if rights.len() < lefts.len() {
        let flipped = hash_join_inner(rights, lefts, rkey, lkey);
        JoinResult {
            pairs: flipped.pairs.into_iter().map(|(r, l)| (l, r)).collect(),
            lefts: flipped.rights,
            rights: flipped.lefts,
        }
    } else {
        hash_join_inner(lefts, rights, lkey, rkey)
    }
}

fn hash_join_inner<L, R, K, KL, KR>(
    lefts: Vec<L>,
    rights: Vec<R>,
    lkey: KL,
    rkey: KR,
) -> JoinResult<L, R>
where
    K: Hash + Eq,
    KL: Fn(&L) -> K,
    KR: Fn(&R) -> K,
{
    let mut table: HashMap<K, VecDeque<L>> = HashMap::new();
    for l in lefts {
        table.entry(lkey(&l)).or_default().push_back(l);
    }

    let mut result = JoinResult::default();
    for r in rights {
        match table.get_mut(&rkey(&r)).and_then(VecDeque::pop_front) {
            Some(l) => result.pairs.push((l, r)),
            None => result.rights.push(r),
        }
    }

    // Whatever is still queued never found a partner.
    for queue in table.into_values() {
        result.lefts.extend(queue);
    }

    result
}

/// Match each left element with the right element it scores best against.
///
/// `score` returns `Some(cost)` for a permissible match or `None` for an
/// impossible one. A zero cost is taken greedily without scanning further;
/// otherwise the lowest cost wins, ties going to the right element seen
/// first. `None` never pairs.
pub fn score_join<L, R, F>(lefts: Vec<L>, mut rights: Vec<R>, score: F) -> JoinResult<L, R>
where
    F: Fn(&L, &R) -> Option<u32>,
{
    let mut pairs = Vec::new();
    let mut lonely_lefts = Vec::new();

    for l in lefts {
        let mut best: Option<(usize, u32)> = None;
        for (i, r) in rights.iter().enumerate() {
            match score(&l, r) {
                None => {}
                Some(0) => {
                    best = Some((i, 0));
                    break;
                }
                Some(s) => {
                    if best.map_or(true, |(_, b)| s < b) {
                        best = Some((i, s));
                    }
                }
            }
        }

        match best {
            Some((i, _)) => pairs.push((l, rights.swap_remove(i))),
            None => lonely_lefts.push(l),
        }
    }

    JoinResult {
        pairs,
        lefts: lonely_lefts,
        rights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_join_basic() {
        let res = hash_join(
            vec![1, 2, 3],
            vec![2, 3, 4],
            |l: &i32| *l,
            |r: &i32| *r,
        );

        let mut pairs = res.pairs;
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(2, 2), (3, 3)]);
        assert_eq!(res.lefts, vec![1]);
        assert_eq!(res.rights, vec![4]);
    }

    #[test]
    fn hash_join_mixed_types() {
        let res = hash_join(
            vec!["one", "two"],
            vec![3usize, 5],
            |l: &&str| l.len(),
            |r: &usize| *r,
        );

        assert_eq!(res.pairs.len(), 2);
        assert!(res.lefts.is_empty());
        assert!(res.rights.is_empty());
    }

    #[test]
    fn hash_join_counts_add_up() {
        // The shorter-side swap must not lose elements either way around.
        for (nl, nr) in [(5usize, 2usize), (2, 5), (4, 4), (0, 3), (3, 0)] {
            let lefts: Vec<u32> = (0..nl as u32).collect();
            let rights: Vec<u32> = (2..2 + nr as u32).collect();
            let res = hash_join(lefts, rights, |l| *l, |r| *r);

            assert_eq!(res.pairs.len() + res.lefts.len(), nl);
            assert_eq!(res.pairs.len() + res.rights.len(), nr);
        }
    }

    #[test]
    fn hash_join_duplicate_keys_pair_one_to_one() {
        let res = hash_join(
            vec![("a", 1), ("a", 2), ("b", 3)],
            vec![("a", 10), ("a", 20)],
            |l: &(&str, i32)| l.0,
            |r: &(&str, i32)| r.0,
        );

        assert_eq!(res.pairs.len(), 2);
        assert_eq!(res.lefts, vec![("b", 3)]);
        assert!(res.rights.is_empty());
    }

    #[test]
    fn hash_join_empty_sides() {
        let res = hash_join(Vec::<i32>::new(), vec![1, 2], |l| *l, |r| *r);
        assert!(res.pairs.is_empty());
        assert!(res.lefts.is_empty());
        assert_eq!(res.rights, vec![1, 2]);
    }

    #[test]
    fn score_join_basic() {
        let res = score_join(vec![1, 2], vec![1, 2, 3], |l, r| {
            if l == r {
                Some(0)
            } else {
                None
            }
        });

        assert_eq!(res.pairs, vec![(1, 1), (2, 2)]);
        assert!(res.lefts.is_empty());
        assert_eq!(res.rights, vec![3]);
    }

    #[test]
    fn score_join_prefers_lowest_score() {
        // 10 scores 1 against 11 and 2 against 12; it must take 11.
        let res = score_join(vec![10], vec![12, 11], |l, r| Some((r - l) as u32));
        assert_eq!(res.pairs, vec![(10, 11)]);
        assert_eq!(res.rights, vec![12]);
    }

    #[test]
    fn score_join_never_pairs_impossible() {
        let res = score_join(vec![1, 2, 3], vec![4, 5, 6], |_, _| None::<u32>);
        assert!(res.pairs.is_empty());
        assert_eq!(res.lefts, vec![1, 2, 3]);
        assert_eq!(res.rights, vec![4, 5, 6]);
    }

    #[test]
    fn score_join_zero_exits_early() {
        // Once a zero is found the rest of the right side is not consulted.
        let res = score_join(vec![0], vec![0, 0], |_, _| Some(0));
        assert_eq!(res.pairs.len(), 1);
        assert_eq!(res.rights.len(), 1);
    }

    #[test]
    fn score_join_ties_go_to_first_seen() {
        let res = score_join(vec!["l"], vec!["r1", "r2"], |_, _| Some(7));
        assert_eq!(res.pairs, vec![("l", "r1")]);
        assert_eq!(res.rights, vec!["r2"]);
    }

    #[test]
    fn score_join_each_right_consumed_once() {
        let res = score_join(vec![1, 2, 3], vec![0], |_, _| Some(1));
        assert_eq!(res.pairs.len(), 1);
        assert_eq!(res.lefts.len(), 2);
        assert!(res.rights.is_empty());
    }
}
