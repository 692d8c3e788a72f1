//! Load balancing methods
//!
//! Pure selection functions over (name, weight) candidate slices so both
//! the server level and the group-of-groups level share one implementation.

use crate::{Error, Result};
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;

/// Load balancing method of a server group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Weighted round robin
    Wrr,
    /// Weighted least connection
    Wlc,
    /// Source address hashing
    Source,
}

impl Default for Method {
    fn default() -> Self {
        Method::Wrr
    }
}

impl TryFrom<&str> for Method {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "wrr" => Ok(Method::Wrr),
            "wlc" => Ok(Method::Wlc),
            "source" => Ok(Method::Source),
            _ => Err(Error::invalid_argument(format!(
                "unknown load balancing method {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Wrr => write!(f, "wrr"),
            Method::Wlc => write!(f, "wlc"),
            Method::Source => write!(f, "source"),
        }
    }
}

/// Per-selector running state for weighted round robin.
pub type WrrState = HashMap<String, i64>;

/// Smooth weighted round robin over `(name, weight)` candidates.
///
/// Over one full cycle of sum(weights) calls against a stable candidate set
/// each candidate is picked exactly `weight` times, and the sequence is the
/// same for every identical starting state. Returns None when no candidate
/// carries positive weight.
pub fn smooth_wrr(state: &mut WrrState, candidates: &[(&str, u32)]) -> Option<usize> {
    let total: i64 = candidates.iter().map(|(_, w)| *w as i64).sum();
    if total == 0 {
        return None;
    }

    // Forget entries for candidates that have left the set.
    state.retain(|name, _| candidates.iter().any(|(n, _)| n == name));

    for (name, weight) in candidates {
        if *weight > 0 {
            *state.entry((*name).to_string()).or_insert(0) += *weight as i64;
        }
    }

    let mut best: Option<(usize, i64)> = None;
    for (idx, (name, weight)) in candidates.iter().enumerate() {
        if *weight == 0 {
            continue;
        }
        let current = state[*name];
        match best {
            Some((_, top)) if current <= top => {}
            _ => best = Some((idx, current)),
        }
    }

    let (idx, _) = best?;
    *state.get_mut(candidates[idx].0).expect("winner tracked") -= total;
    Some(idx)
}

/// Weighted least connection over `(active, weight)` candidates; ties keep
/// the earliest candidate. Compares active/weight via cross multiplication.
pub fn weighted_least_connection(candidates: &[(u64, u32)]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, (active, weight)) in candidates.iter().enumerate() {
        if *weight == 0 {
            continue;
        }
        match best {
            None => best = Some(idx),
            Some(current) => {
                let (best_active, best_weight) = candidates[current];
                if (*active as u128) * (best_weight as u128)
                    < (best_active as u128) * (*weight as u128)
                {
                    best = Some(idx);
                }
            }
        }
    }
    best
}

/// Deterministic source hashing: the key maps to a slot in [0, sum(weights))
/// and the slot walks the cumulative weight ranges.
pub fn source_hash(key: &[u8], weights: &[u32]) -> Option<usize> {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return None;
    }

    let mut hasher = FnvHasher::default();
    hasher.write(key);
    let mut slot = hasher.finish() % total;

    for (idx, weight) in weights.iter().enumerate() {
        if slot < *weight as u64 {
            return Some(idx);
        }
        slot -= *weight as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(Method::try_from("wrr").unwrap(), Method::Wrr);
        assert_eq!(Method::try_from("WLC").unwrap(), Method::Wlc);
        assert_eq!(Method::try_from("source").unwrap(), Method::Source);
        assert!(Method::try_from("random").is_err());
    }

    #[test]
    fn test_wrr_full_cycle_matches_weights() {
        let candidates = [("a", 5), ("b", 3), ("c", 2)];
        let total: u32 = candidates.iter().map(|(_, w)| w).sum();

        let mut state = WrrState::new();
        let mut counts = HashMap::new();
        for _ in 0..total {
            let idx = smooth_wrr(&mut state, &candidates).unwrap();
            *counts.entry(candidates[idx].0).or_insert(0u32) += 1;
        }

        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 3);
        assert_eq!(counts["c"], 2);
    }

    #[test]
    fn test_wrr_sequence_is_stable() {
        let candidates = [("a", 2), ("b", 1)];
        let run = |state: &mut WrrState| {
            (0..6)
                .map(|_| candidates[smooth_wrr(state, &candidates).unwrap()].0)
                .collect::<Vec<_>>()
        };

        let first = run(&mut WrrState::new());
        let second = run(&mut WrrState::new());
        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|n| **n == "a").count(), 4);
    }

    #[test]
    fn test_wrr_skips_zero_weight() {
        let candidates = [("a", 0), ("b", 1)];
        let mut state = WrrState::new();
        for _ in 0..5 {
            assert_eq!(smooth_wrr(&mut state, &candidates), Some(1));
        }
        assert_eq!(smooth_wrr(&mut WrrState::new(), &[("a", 0)]), None);
    }

    #[test]
    fn test_wlc_picks_least_loaded_per_weight() {
        // 4 active at weight 2 (2.0) vs 3 active at weight 3 (1.0)
        assert_eq!(weighted_least_connection(&[(4, 2), (3, 3)]), Some(1));
        // tie: 2/1 == 4/2, earliest wins
        assert_eq!(weighted_least_connection(&[(2, 1), (4, 2)]), Some(0));
        assert_eq!(weighted_least_connection(&[(1, 0), (5, 1)]), Some(1));
        assert_eq!(weighted_least_connection(&[]), None);
    }

    #[test]
    fn test_source_hash_is_deterministic() {
        let weights = [5, 3, 2];
        let key = "10.0.0.7".as_bytes();
        let first = source_hash(key, &weights).unwrap();
        for _ in 0..10 {
            assert_eq!(source_hash(key, &weights), Some(first));
        }
    }

    #[test]
    fn test_source_hash_lands_in_range() {
        let weights = [1, 1, 1, 1];
        for i in 0..64u8 {
            let idx = source_hash(&[i], &weights).unwrap();
            assert!(idx < weights.len());
        }
        assert_eq!(source_hash(b"key", &[0, 0]), None);
    }
}
