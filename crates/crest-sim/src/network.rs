//! The in-memory radio and routed unicast fabric.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Network behavior for a run.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// One-way delivery latency for every packet.
    pub latency: Duration,
    /// Physical broadcast reach. Broadcast carriers are only delivered
    /// to nodes within this distance of the sender; unicasts are routed
    /// and ignore it.
    pub broadcast_range: f64,
    /// Independent loss probability per delivery.
    pub loss_probability: f64,
    /// Seed for the loss process.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_micros(500),
            broadcast_range: 100.0,
            loss_probability: 0.0,
            seed: 42,
        }
    }
}

/// Loss and latency state.
pub struct Network {
    config: NetworkConfig,
    rng: StdRng,
    // Forced per-link unicast drops, consumed before random loss.
    forced_unicast_drops: HashMap<(u64, u64), u32>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng, forced_unicast_drops: HashMap::new() }
    }

    pub fn latency(&self) -> Duration {
        self.config.latency
    }

    pub fn broadcast_range(&self) -> f64 {
        self.config.broadcast_range
    }

    /// Force the next `count` unicasts from `from` to `to` to be lost.
    pub fn drop_next_unicasts(&mut self, from: u64, to: u64, count: u32) {
        *self.forced_unicast_drops.entry((from, to)).or_insert(0) += count;
    }

    /// Whether a broadcast delivery to one receiver is lost.
    pub fn broadcast_lost(&mut self) -> bool {
        self.random_loss()
    }

    /// Whether a unicast from `from` to `to` is lost.
    pub fn unicast_lost(&mut self, from: u64, to: u64) -> bool {
        if let Some(remaining) = self.forced_unicast_drops.get_mut(&(from, to)) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        self.random_loss()
    }

    fn random_loss(&mut self) -> bool {
        self.config.loss_probability > 0.0 && self.rng.gen_bool(self.config.loss_probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_by_default() {
        let mut net = Network::new(NetworkConfig::default());
        for _ in 0..100 {
            assert!(!net.broadcast_lost());
            assert!(!net.unicast_lost(1, 2));
        }
    }

    #[test]
    fn forced_drops_are_consumed_in_order() {
        let mut net = Network::new(NetworkConfig::default());
        net.drop_next_unicasts(1, 2, 2);

        assert!(net.unicast_lost(1, 2));
        assert!(net.unicast_lost(1, 2));
        assert!(!net.unicast_lost(1, 2));
        // Other links are unaffected.
        assert!(!net.unicast_lost(2, 1));
    }

    #[test]
    fn random_loss_is_reproducible() {
        let cfg = NetworkConfig { loss_probability: 0.5, seed: 7, ..Default::default() };
        let run = |mut net: Network| -> Vec<bool> {
            (0..32).map(|_| net.broadcast_lost()).collect()
        };
        let a = run(Network::new(cfg.clone()));
        let b = run(Network::new(cfg));
        assert_eq!(a, b);
        assert!(a.iter().any(|&l| l) && a.iter().any(|&l| !l));
    }
}
