//! Agent configuration.

use std::time::Duration;

use thiserror::Error;

/// Fatal configuration problems, checked at agent construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_nodes {0} exceeds the supported limit of 10000")]
    TooManyNodes(u32),

    #[error("density map size must be a positive even number, got {0}")]
    BadMapSize(usize),
}

/// Tunables of the clustering protocol.
///
/// The TDMA quantities shape every schedule: the election probe and the
/// first aging tick fire after one full TDMA window
/// (`minimum_tdma_slot * max_nodes`), inter-cluster sends are spread in
/// 50-slot steps and unicast retries run every 1000 slots.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Upper bound on nodes sharing the broadcast domain.
    pub max_nodes: u32,
    /// Smallest scheduling quantum.
    pub minimum_tdma_slot: Duration,
    /// Beacon and table-aging period.
    pub interval: Duration,
    /// Delay before the first beacon after clustering starts.
    pub time_window: Duration,
    /// Physical radio range; beacons from farther away are dropped.
    pub omni_range: f64,
    /// Full opening angle of the forward sector, radians.
    pub propagation_theta: f64,
    /// Density grid is `distro_map_size` cells on a side.
    pub distro_map_size: usize,
    /// Cell edge length in meters.
    pub distro_map_scale: f32,
    /// Acceptance radius for inter-node propagation frames.
    pub bf_range: f64,
    /// Diagnostic oscillation mode instead of the forward wave.
    pub reverse_propagation: bool,
    /// Ignore starting-node designation unless explicitly flagged.
    pub disable_starting_node: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_nodes: 100,
            minimum_tdma_slot: Duration::from_millis(1),
            interval: Duration::from_millis(300),
            time_window: Duration::from_secs(1),
            omni_range: 100.0,
            propagation_theta: std::f64::consts::FRAC_PI_3,
            distro_map_size: 16,
            distro_map_scale: 10.0,
            bf_range: 50.0,
            reverse_propagation: false,
            disable_starting_node: false,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_nodes > 10_000 {
            return Err(ConfigError::TooManyNodes(self.max_nodes));
        }
        if self.distro_map_size == 0 || self.distro_map_size % 2 != 0 {
            return Err(ConfigError::BadMapSize(self.distro_map_size));
        }
        Ok(())
    }

    /// One full TDMA window: a slot for every possible node.
    pub fn tdma_window(&self) -> Duration {
        self.minimum_tdma_slot * self.max_nodes
    }

    #[must_use]
    pub fn with_omni_range(mut self, range: f64) -> Self {
        self.omni_range = range;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_density_map(mut self, size: usize, scale: f32) -> Self {
        self.distro_map_size = size;
        self.distro_map_scale = scale;
        self
    }

    #[must_use]
    pub fn with_reverse_propagation(mut self, enabled: bool) -> Self {
        self.reverse_propagation = enabled;
        self
    }

    #[must_use]
    pub fn with_disabled_starting_node(mut self, disabled: bool) -> Self {
        self.disable_starting_node = disabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ClusterConfig::default().validate(), Ok(()));
    }

    #[test]
    fn node_limit_is_enforced() {
        let cfg = ClusterConfig { max_nodes: 10_001, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::TooManyNodes(10_001)));
    }

    #[test]
    fn odd_map_size_rejected() {
        let cfg = ClusterConfig::default().with_density_map(15, 10.0);
        assert_eq!(cfg.validate(), Err(ConfigError::BadMapSize(15)));
    }

    #[test]
    fn tdma_window_scales_with_max_nodes() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.tdma_window(), Duration::from_millis(100));
    }
}
