//! stratus-join: pair up two lists by score.
//!
//! The reconciler uses [`join`] to match declared machines against the
//! machines a cloud reports, and the policy engine uses it to match newly
//! resolved machines against existing rows. Both supply a scoring function
//! where lower is better and a negative score forbids the pair.
//!
//! # Components
//!
//! - **`join`**: optimal assignment: the most feasible pairs, then the
//!   lowest total score among those
//! - **`hash_join`**: exact-key matching

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Outcome of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult<L, R> {
    /// Matched pairs, in the order of their left element.
    pub pairs: Vec<(L, R)>,
    /// Left elements with no partner, in input order.
    pub lonely_lefts: Vec<L>,
    /// Right elements with no partner, in input order.
    pub lonely_rights: Vec<R>,
}

/// Match `lefts` against `rights`.
///
/// `score` ranks a candidate pair: lower is better, negative is forbidden.
/// The result maximises the number of pairs and, among assignments with
/// that many pairs, minimises the summed score. Every element appears in
/// exactly one of the three output lists, and the outcome depends only on
/// the inputs, never on hashing or iteration order of internal state.
pub fn join<L, R>(
    lefts: Vec<L>,
    rights: Vec<R>,
    score: impl Fn(&L, &R) -> i32,
) -> JoinResult<L, R> {
    let n = lefts.len();
    let m = rights.len();

    let scores: Vec<Vec<i32>> = lefts
        .iter()
        .map(|l| rights.iter().map(|r| score(l, r)).collect())
        .collect();

    // A forbidden pair must cost more than any full set of feasible pairs,
    // so fewer forbidden pairs always wins over a lower feasible total.
    let worst = scores
        .iter()
        .flatten()
        .filter(|s| **s >= 0)
        .map(|s| i64::from(*s))
        .max()
        .unwrap_or(0);
    let forbidden = (worst + 1) * (n.min(m) as i64) + 1;

    let k = n.max(m);
    let cost: Vec<Vec<i64>> = (0..k)
        .map(|i| {
            (0..k)
                .map(|j| {
                    if i >= n || j >= m {
                        // Padding: leaving an element alone is free.
                        0
                    } else if scores[i][j] < 0 {
                        forbidden
                    } else {
                        i64::from(scores[i][j])
                    }
                })
                .collect()
        })
        .collect();

    let assignment = hungarian(&cost);

    let mut partner: Vec<Option<usize>> = vec![None; n];
    let mut taken = vec![false; m];
    for (i, j) in assignment.into_iter().enumerate().take(n) {
        if j < m && scores[i][j] >= 0 {
            partner[i] = Some(j);
            taken[j] = true;
        }
    }

    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut pairs = Vec::new();
    let mut lonely_lefts = Vec::new();
    for (l, p) in lefts.into_iter().zip(partner) {
        match p.and_then(|j| rights[j].take()) {
            Some(r) => pairs.push((l, r)),
            None => lonely_lefts.push(l),
        }
    }
    let lonely_rights = rights
        .into_iter()
        .zip(taken)
        .filter_map(|(r, t)| if t { None } else { r })
        .collect();

    JoinResult {
        pairs,
        lonely_lefts,
        lonely_rights,
    }
}

/// Match elements whose keys are equal. Duplicate keys pair up in input
/// order.
pub fn hash_join<L, R, K: Eq + Hash>(
    lefts: Vec<L>,
    rights: Vec<R>,
    left_key: impl Fn(&L) -> K,
    right_key: impl Fn(&R) -> K,
) -> JoinResult<L, R> {
    let mut by_key: HashMap<K, VecDeque<usize>> = HashMap::new();
    for (j, r) in rights.iter().enumerate() {
        by_key.entry(right_key(r)).or_default().push_back(j);
    }

    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut pairs = Vec::new();
    let mut lonely_lefts = Vec::new();
    for l in lefts {
        let matched = by_key
            .get_mut(&left_key(&l))
            .and_then(|q| q.pop_front())
            .and_then(|j| rights[j].take());
        match matched {
            Some(r) => pairs.push((l, r)),
            None => lonely_lefts.push(l),
        }
    }

    JoinResult {
        pairs,
        lonely_lefts,
        lonely_rights: rights.into_iter().flatten().collect(),
    }
}

/// Minimum-cost perfect assignment on a square matrix (Kuhn-Munkres with
/// potentials, O(k³)). Returns the column assigned to each row.
fn hungarian(cost: &[Vec<i64>]) -> Vec<usize> {
    let k = cost.len();
    if k == 0 {
        return Vec::new();
    }

    let inf = i64::MAX / 4;
    // 1-indexed; index 0 is the virtual root column.
    let mut u = vec![0i64; k + 1];
    let mut v = vec![0i64; k + 1];
    let mut row_of = vec![0usize; k + 1];
    let mut way = vec![0usize; k + 1];

    for i in 1..=k {
        row_of[0] = i;
        let mut j0 = 0;
        let mut min_v = vec![inf; k + 1];
        let mut used = vec![false; k + 1];

        loop {
            used[j0] = true;
            let i0 = row_of[j0];
            let mut delta = inf;
            let mut j1 = 0;

            for j in 1..=k {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < min_v[j] {
                    min_v[j] = cur;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }

            for j in 0..=k {
                if used[j] {
                    u[row_of[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }

            j0 = j1;
            if row_of[j0] == 0 {
                break;
            }
        }

        // Augment along the alternating path.
        loop {
            let j1 = way[j0];
            row_of[j0] = row_of[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0usize; k];
    for j in 1..=k {
        if row_of[j] != 0 {
            assignment[row_of[j] - 1] = j - 1;
        }
    }
    assignment
}
