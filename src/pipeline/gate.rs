//! Mode gate
//!
//! Decides per frame whether the detector chain runs. `should_run` is a pure
//! function of its inputs; `CameraGate` only remembers the two timestamps it
//! needs between frames.

use crate::config_store::{DetectionMode, EffectiveConfig};
use std::time::Duration;
use tokio::time::Instant;

/// Inputs to one gating decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInputs {
    pub motion_active: bool,
    /// Time since motion was last observed, None if never
    pub since_last_motion: Option<Duration>,
    /// Time since the chain last ran, None if never
    pub since_last_run: Option<Duration>,
}

/// Pure gating decision
pub fn should_run(
    mode: DetectionMode,
    inputs: GateInputs,
    motion_cooldown: Duration,
    schedule_interval: Duration,
) -> bool {
    let motion = || {
        inputs.motion_active
            || inputs
                .since_last_motion
                .map(|elapsed| elapsed < motion_cooldown)
                .unwrap_or(false)
    };
    let scheduled = || {
        inputs
            .since_last_run
            .map(|elapsed| elapsed >= schedule_interval)
            .unwrap_or(true)
    };

    match mode {
        DetectionMode::Disabled => false,
        DetectionMode::Continuous | DetectionMode::VisualOnly => true,
        DetectionMode::MotionTriggered => motion(),
        DetectionMode::Scheduled => scheduled(),
        DetectionMode::Hybrid => motion() || scheduled(),
    }
}

/// Whether a mode consults the motion signal at all
pub fn uses_motion(mode: DetectionMode) -> bool {
    matches!(mode, DetectionMode::MotionTriggered | DetectionMode::Hybrid)
}

/// Per-camera gate state
#[derive(Debug, Default, Clone)]
pub struct CameraGate {
    last_motion_at: Option<Instant>,
    last_run_at: Option<Instant>,
}

impl CameraGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide for a frame observed at `now`. A positive decision counts as a run.
    pub fn decide(&mut self, config: &EffectiveConfig, motion_active: bool, now: Instant) -> bool {
        if motion_active {
            self.last_motion_at = Some(now);
        }

        let inputs = GateInputs {
            motion_active,
            since_last_motion: self.last_motion_at.map(|t| now.saturating_duration_since(t)),
            since_last_run: self.last_run_at.map(|t| now.saturating_duration_since(t)),
        };
        let run = should_run(
            config.mode,
            inputs,
            config.motion_cooldown(),
            config.schedule_interval(),
        );
        if run {
            self.last_run_at = Some(now);
        }
        run
    }

    /// Forget timestamps, e.g. after a mode change
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::GlobalDetectionConfig;

    fn config(mode: DetectionMode) -> EffectiveConfig {
        let global = GlobalDetectionConfig {
            mode,
            motion_cooldown_ms: 2000,
            schedule_interval_ms: 5000,
            ..GlobalDetectionConfig::default()
        };
        EffectiveConfig::merge("cam1", &global, None)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_fixed_modes() {
        let inputs = GateInputs {
            motion_active: true,
            since_last_motion: Some(ms(0)),
            since_last_run: Some(ms(0)),
        };
        assert!(!should_run(DetectionMode::Disabled, inputs, ms(2000), ms(5000)));
        assert!(should_run(DetectionMode::Continuous, inputs, ms(2000), ms(5000)));
        assert!(should_run(DetectionMode::VisualOnly, inputs, ms(2000), ms(5000)));
    }

    #[test]
    fn test_same_inputs_same_decision() {
        let inputs = GateInputs {
            motion_active: false,
            since_last_motion: Some(ms(1500)),
            since_last_run: Some(ms(4999)),
        };
        for mode in [
            DetectionMode::MotionTriggered,
            DetectionMode::Scheduled,
            DetectionMode::Hybrid,
        ] {
            let first = should_run(mode, inputs, ms(2000), ms(5000));
            for _ in 0..10 {
                assert_eq!(should_run(mode, inputs, ms(2000), ms(5000)), first);
            }
        }
    }

    #[test]
    fn test_motion_with_cooldown() {
        // Motion active from t=0 through t=1s, then gone. Cooldown 2s.
        let cfg = config(DetectionMode::MotionTriggered);
        let mut gate = CameraGate::new();
        let t0 = Instant::now();

        for step in 0..=10u64 {
            assert!(gate.decide(&cfg, true, t0 + ms(step * 100)), "t={}ms", step * 100);
        }
        for t in [1100, 2000, 2500, 2999] {
            assert!(gate.decide(&cfg, false, t0 + ms(t)), "t={}ms", t);
        }
        for t in [3000, 3500, 10_000] {
            assert!(!gate.decide(&cfg, false, t0 + ms(t)), "t={}ms", t);
        }
    }

    #[test]
    fn test_no_motion_never_runs() {
        let cfg = config(DetectionMode::MotionTriggered);
        let mut gate = CameraGate::new();
        let t0 = Instant::now();
        assert!(!gate.decide(&cfg, false, t0));
        assert!(!gate.decide(&cfg, false, t0 + ms(60_000)));
    }

    #[test]
    fn test_scheduled_interval() {
        let cfg = config(DetectionMode::Scheduled);
        let mut gate = CameraGate::new();
        let t0 = Instant::now();

        assert!(gate.decide(&cfg, false, t0));
        assert!(!gate.decide(&cfg, false, t0 + ms(4999)));
        assert!(gate.decide(&cfg, false, t0 + ms(5000)));
        assert!(!gate.decide(&cfg, false, t0 + ms(6000)));
        assert!(gate.decide(&cfg, false, t0 + ms(10_000)));
    }

    #[test]
    fn test_hybrid_is_either_condition() {
        let cfg = config(DetectionMode::Hybrid);
        let mut gate = CameraGate::new();
        let t0 = Instant::now();

        // First frame: schedule condition holds
        assert!(gate.decide(&cfg, false, t0));
        // Within interval, no motion
        assert!(!gate.decide(&cfg, false, t0 + ms(1000)));
        // Motion makes it run
        assert!(gate.decide(&cfg, true, t0 + ms(1500)));
        // Cooldown still open
        assert!(gate.decide(&cfg, false, t0 + ms(3000)));
        // Cooldown over, interval since the last run not yet elapsed
        assert!(!gate.decide(&cfg, false, t0 + ms(4000)));
        // Interval elapsed
        assert!(gate.decide(&cfg, false, t0 + ms(8000)));
    }
}
