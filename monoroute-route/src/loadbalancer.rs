//! Load-balancer core: endpoint selection across algorithms, with
//! fade-in weighting for newly detected endpoints.

use std::cell::Cell;
use std::rc::Rc;

use rand::Rng;

use crate::endpoint::EndpointRegistry;

pub const ALGORITHMS: &[&str] =
    &["roundRobin", "random", "consistentHash", "powerOfRandomNChoices"];

pub fn is_known_algorithm(name: &str) -> bool {
    ALGORITHMS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Algorithm {
    RoundRobin,
    Random,
    ConsistentHash,
    PowerOfRandomNChoices,
}

impl Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "roundRobin" => Some(Algorithm::RoundRobin),
            "random" => Some(Algorithm::Random),
            "consistentHash" => Some(Algorithm::ConsistentHash),
            "powerOfRandomNChoices" => Some(Algorithm::PowerOfRandomNChoices),
            _ => None,
        }
    }
}

/// Time-based ramp of an endpoint's selection probability. `exponent`
/// defaults to 1.
#[derive(Debug, Clone, Copy)]
pub struct FadeIn {
    pub duration_ms: u64,
    pub exponent: f64,
}

impl FadeIn {
    pub fn score(&self, age: std::time::Duration) -> f64 {
        if self.duration_ms == 0 {
            return 1.0;
        }
        let ratio = (age.as_millis() as f64 / self.duration_ms as f64).min(1.0);
        ratio.powf(self.exponent)
    }
}

/// A per-route load balancer over a fixed endpoint list, holding the
/// round-robin cursor and fade-in configuration for that route.
pub struct LoadBalancer {
    algorithm: Algorithm,
    endpoints: Vec<String>,
    fade_in: Option<FadeIn>,
    round_robin_cursor: Cell<usize>,
    registry: EndpointRegistry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoEndpointsError;

impl std::fmt::Display for NoEndpointsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no endpoints available")
    }
}
impl std::error::Error for NoEndpointsError {}

impl LoadBalancer {
    pub fn new(
        algorithm: Algorithm,
        endpoints: Vec<String>,
        fade_in: Option<FadeIn>,
        registry: EndpointRegistry,
    ) -> Self {
        for ep in &endpoints {
            registry.observe(ep);
        }
        Self { algorithm, endpoints, fade_in, round_robin_cursor: Cell::new(0), registry }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Apply fade-in filtering (if configured), then the algorithm,
    /// returning the selected endpoint URL.
    ///
    /// `hash_key` supplies the consistent-hash key. Fade-in filtering
    /// runs before hash selection, falling back to the full set if
    /// filtering empties it, so a ring over zero endpoints can't happen.
    pub fn select(&self, hash_key: &str) -> Result<&str, NoEndpointsError> {
        if self.endpoints.is_empty() {
            return Err(NoEndpointsError);
        }
        let candidates = self.fade_in_filtered();
        let pool: &[String] = if candidates.is_empty() { &self.endpoints } else { &candidates };

        let idx = match self.algorithm {
            Algorithm::RoundRobin => {
                let cur = self.round_robin_cursor.get();
                self.round_robin_cursor.set((cur + 1) % self.endpoints.len());
                cur % pool.len()
            }
            Algorithm::Random => rand::thread_rng().gen_range(0..pool.len()),
            Algorithm::ConsistentHash => consistent_hash_index(pool, hash_key),
            Algorithm::PowerOfRandomNChoices => self.power_of_two_index(pool),
        };
        let selected = &pool[idx];
        let pos = self
            .endpoints
            .iter()
            .position(|ep| ep == selected)
            .expect("selected endpoint must come from self.endpoints");
        Ok(&self.endpoints[pos])
    }

    fn fade_in_filtered(&self) -> Vec<String> {
        let Some(fade_in) = self.fade_in else {
            return Vec::new();
        };
        let mut rng = rand::thread_rng();
        let threshold: f64 = rng.gen_range(0.0..1.0);
        self.endpoints
            .iter()
            .filter(|ep| {
                let Some(detected) = self.registry.detected_time(ep) else {
                    return true;
                };
                let score = fade_in.score(detected.elapsed());
                score > threshold
            })
            .cloned()
            .collect()
    }

    fn power_of_two_index(&self, pool: &[String]) -> usize {
        if pool.len() == 1 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let i = rng.gen_range(0..pool.len());
        let mut j = rng.gen_range(0..pool.len() - 1);
        if j >= i {
            j += 1;
        }
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let in_flight_lo = self.registry.in_flight(&pool[lo]);
        let in_flight_hi = self.registry.in_flight(&pool[hi]);
        if in_flight_lo <= in_flight_hi {
            lo
        } else {
            hi
        }
    }
}

/// 1000-virtual-node hash ring over `pool`, keyed by `key`.
fn consistent_hash_index(pool: &[String], key: &str) -> usize {
    const VNODES_PER_ENDPOINT: u32 = 1000;
    let key_hash = fnv1a(key.as_bytes());
    let mut best: Option<(u64, usize)> = None;
    for (idx, ep) in pool.iter().enumerate() {
        for vnode in 0..VNODES_PER_ENDPOINT {
            let mut buf = ep.clone();
            buf.push(':');
            buf.push_str(&vnode.to_string());
            let ring_hash = fnv1a(buf.as_bytes());
            let distance = ring_hash.wrapping_sub(key_hash);
            if best.map_or(true, |(best_dist, _)| distance < best_dist) {
                best = Some((distance, idx));
            }
        }
    }
    best.map(|(_, idx)| idx).unwrap_or(0)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub type SharedLoadBalancer = Rc<LoadBalancer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_alternates_in_fixed_order() {
        let reg = EndpointRegistry::new();
        let lb = LoadBalancer::new(
            Algorithm::RoundRobin,
            vec!["a".into(), "b".into()],
            None,
            reg,
        );
        let picks: Vec<_> = (0..4).map(|_| lb.select("k").unwrap().to_string()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_fairness_within_one() {
        let reg = EndpointRegistry::new();
        let lb = LoadBalancer::new(
            Algorithm::RoundRobin,
            vec!["a".into(), "b".into(), "c".into()],
            None,
            reg,
        );
        let mut counts = std::collections::HashMap::new();
        for _ in 0..100 {
            *counts.entry(lb.select("k").unwrap().to_string()).or_insert(0) += 1;
        }
        let values: Vec<_> = counts.values().copied().collect();
        let max = *values.iter().max().unwrap();
        let min = *values.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn consistent_hash_is_deterministic_for_same_key() {
        let reg = EndpointRegistry::new();
        let lb = LoadBalancer::new(
            Algorithm::ConsistentHash,
            vec!["a".into(), "b".into(), "c".into()],
            None,
            reg,
        );
        let first = lb.select("client-1").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(lb.select("client-1").unwrap(), first);
        }
    }

    #[test]
    fn fade_in_score_is_monotonic_in_age() {
        let fade_in = FadeIn { duration_ms: 1000, exponent: 1.0 };
        let early = fade_in.score(std::time::Duration::from_millis(100));
        let late = fade_in.score(std::time::Duration::from_millis(900));
        assert!(late > early);
        assert_eq!(fade_in.score(std::time::Duration::from_millis(5000)), 1.0);
    }

    #[test]
    fn empty_fade_in_pool_falls_back_to_full_set() {
        let reg = EndpointRegistry::new();
        // duration 0 means score is always 1.0, so fade-in never empties the pool;
        // exercise the fallback path directly by using a registry with no entries
        // registered and a nonzero duration, forcing a fresh detected_time.
        let lb = LoadBalancer::new(
            Algorithm::RoundRobin,
            vec!["a".into()],
            Some(FadeIn { duration_ms: 60_000, exponent: 1.0 }),
            reg,
        );
        assert!(lb.select("k").is_ok());
    }
}
