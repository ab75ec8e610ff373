//! Tuning knobs for the crate's one stateful component, the demultiplexer.
//! Everything else (`Episode`, `Scenario`, `matcher`) is pure construction
//! and interpretation and takes no configuration of its own.

use std::time::Duration;

use serde::Deserialize;

/// Deserializable on its own -- buffer sizing and a couple of lifecycle
/// intervals -- even though this crate owns no wire format of its own; a
/// caller embedding these fields in its own config schema gets `serde`
/// support for free.
#[derive(Debug, Clone, Deserialize)]
pub struct DemuxConfig {
    /// Capacity of each conversation's inbound event channel. A
    /// conversation that falls behind (a slow `eval` effect, a long
    /// `within`) backs up its own channel without affecting others; once
    /// full, dispatch for that conversation alone degrades to an awaited
    /// send rather than blocking the demultiplexer's main loop.
    #[serde(default = "DemuxConfig::default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// How long a conversation may sit with a completed session and no new
    /// events before its bookkeeping entry is evicted.
    #[serde(default = "DemuxConfig::default_idle_eviction_interval_ms")]
    pub idle_eviction_interval_ms: u64,
    /// How often the idle sweep runs. Independent of the eviction interval
    /// itself so that a long idle interval does not require an equally
    /// long-lived timer to detect it promptly.
    #[serde(default = "DemuxConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl DemuxConfig {
    fn default_buffer_capacity() -> usize {
        64
    }

    fn default_idle_eviction_interval_ms() -> u64 {
        60_000
    }

    fn default_sweep_interval_ms() -> u64 {
        5_000
    }

    pub(crate) fn idle_eviction_interval(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_interval_ms)
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: Self::default_buffer_capacity(),
            idle_eviction_interval_ms: Self::default_idle_eviction_interval_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DemuxConfig::default();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.idle_eviction_interval_ms, 60_000);
        assert_eq!(config.sweep_interval_ms, 5_000);
    }

    #[test]
    fn deserializes_with_partial_overrides() {
        let config: DemuxConfig = serde_yaml::from_str("buffer_capacity: 8").unwrap();
        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.idle_eviction_interval_ms, 60_000);
    }
}
