//! Loudness metric and clap debouncing

use std::time::{Duration, Instant};

/// Normalized loudness of one tick: mean bin magnitude over 255, in [0, 1].
pub fn mean_loudness(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }

    let sum: u32 = bins.iter().map(|&b| b as u32).sum();
    sum as f32 / bins.len() as f32 / u8::MAX as f32
}

/// Threshold + cooldown gate deciding which loud ticks count as claps.
///
/// A tick is accepted when its loudness is strictly above the threshold and
/// strictly more than the cooldown has elapsed since the last accepted clap.
#[derive(Debug, Clone, Default)]
pub struct ClapGate {
    last_clap: Option<Instant>,
}

impl ClapGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick; returns true (and records `now`) if it is a clap.
    pub fn observe(
        &mut self,
        loudness: f32,
        threshold: f32,
        cooldown: Duration,
        now: Instant,
    ) -> bool {
        if loudness <= threshold {
            return false;
        }

        if let Some(last) = self.last_clap {
            if now.saturating_duration_since(last) <= cooldown {
                return false;
            }
        }

        self.last_clap = Some(now);
        true
    }

    pub fn last_clap(&self) -> Option<Instant> {
        self.last_clap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_loudness() {
        assert_eq!(mean_loudness(&[]), 0.0);
        assert_eq!(mean_loudness(&[0; 128]), 0.0);
        assert_eq!(mean_loudness(&[255; 128]), 1.0);

        let half: Vec<u8> = (0..128).map(|i| if i % 2 == 0 { 255 } else { 0 }).collect();
        assert!((mean_loudness(&half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gate_scenario() {
        // 0.5 @ 0ms, 0.6 @ 500ms, 0.5 @ 1100ms with threshold 0.15 / cooldown 1s
        let t0 = Instant::now();
        let cooldown = Duration::from_millis(1000);
        let mut gate = ClapGate::new();

        let fired: Vec<u64> = [(0u64, 0.5f32), (500, 0.6), (1100, 0.5)]
            .into_iter()
            .filter(|&(ms, level)| {
                gate.observe(level, 0.15, cooldown, t0 + Duration::from_millis(ms))
            })
            .map(|(ms, _)| ms)
            .collect();

        assert_eq!(fired, vec![0, 1100]);
        assert_eq!(gate.last_clap(), Some(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn test_gate_requires_strictly_louder() {
        let mut gate = ClapGate::new();
        let now = Instant::now();
        assert!(!gate.observe(0.15, 0.15, Duration::from_millis(100), now));
        assert!(gate.last_clap().is_none());
        assert!(gate.observe(0.1501, 0.15, Duration::from_millis(100), now));
    }

    #[test]
    fn test_gate_cooldown_boundary_is_exclusive() {
        let t0 = Instant::now();
        let cooldown = Duration::from_millis(100);
        let mut gate = ClapGate::new();

        assert!(gate.observe(1.0, 0.1, cooldown, t0));
        assert!(!gate.observe(1.0, 0.1, cooldown, t0 + Duration::from_millis(100)));
        assert!(gate.observe(1.0, 0.1, cooldown, t0 + Duration::from_millis(101)));
    }

    #[test]
    fn test_quiet_tick_does_not_reset_cooldown() {
        let t0 = Instant::now();
        let cooldown = Duration::from_millis(100);
        let mut gate = ClapGate::new();

        assert!(gate.observe(0.9, 0.2, cooldown, t0));
        assert!(!gate.observe(0.0, 0.2, cooldown, t0 + Duration::from_millis(150)));
        assert_eq!(gate.last_clap(), Some(t0));
    }
}
