//! Turn Timeout Calculation
//!
//! Pure function from the last pass to the next holder's deadline.
//!
//! ```text
//! final = clamp(base × speed × vowel × cursed × pad_combo × extras, min, max)
//! speed = max(floor, 1 + (1 - response_time / base))
//! vowel = max(0, 1 - vowel_step × vowel_power[letter])   (vowel played)
//! ```

use serde::{Serialize, Deserialize};

use crate::game::state::TimeoutLog;

/// Constants of the timeout formula.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Base timeout (ms)
    pub base_ms: u64,
    /// Lower clamp (ms)
    pub min_ms: u64,
    /// Upper clamp (ms)
    pub max_ms: u64,
    /// Lowest speed multiplier for very slow responses
    pub speed_floor: f64,
    /// Vowel multiplier drop per point of vowel power
    pub vowel_step: f64,
    /// Multiplier when a cursed letter is played
    pub cursed_multiplier: f64,
    /// Multiplier when the next holder is under Attaque
    pub pad_combo_multiplier: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base_ms: 15_000,
            min_ms: 3_000,
            max_ms: 60_000,
            speed_floor: 0.0,
            vowel_step: 0.25,
            cursed_multiplier: 0.25,
            pad_combo_multiplier: 0.5,
        }
    }
}

/// Everything the calculator needs from one pass.
#[derive(Clone, Debug, Default)]
pub struct TimeoutInputs {
    /// How long the passer took (ms)
    pub response_time_ms: u64,
    /// The played vowel and the passer's power for it, if a vowel was played
    pub vowel: Option<(char, f64)>,
    /// The played letter was cursed
    pub cursed: bool,
    /// The next holder is under an Attaque
    pub pad_combo: bool,
    /// Further named multipliers (missions, turn bonuses, pace)
    pub extras: Vec<(String, f64)>,
}

/// Result of one computation.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeoutOutcome {
    /// Timeout granted to the next holder (ms)
    pub timeout_ms: u64,
    /// Names of every multiplier that took effect
    pub applied: Vec<String>,
    /// Full breakdown for the turn record
    pub log: TimeoutLog,
}

/// Computes turn deadlines.
#[derive(Clone, Debug, Default)]
pub struct TimeoutCalculator {
    policy: TimeoutPolicy,
}

impl TimeoutCalculator {
    /// Create a calculator for a policy.
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Speed multiplier for a response time.
    pub fn speed_multiplier(&self, response_time_ms: u64) -> f64 {
        let base = self.policy.base_ms.max(1) as f64;
        let raw = 1.0 + (1.0 - response_time_ms as f64 / base);
        raw.max(self.policy.speed_floor)
    }

    /// Vowel multiplier for a vowel power.
    pub fn vowel_multiplier(&self, power: f64) -> f64 {
        (1.0 - self.policy.vowel_step * power).max(0.0)
    }

    /// Compute the next holder's timeout.
    pub fn compute(&self, inputs: &TimeoutInputs) -> TimeoutOutcome {
        let policy = &self.policy;
        let mut applied = Vec::new();

        let speed = self.speed_multiplier(inputs.response_time_ms);
        if speed > 1.0 {
            applied.push("speed".to_string());
        }

        let vowel = match inputs.vowel {
            Some((letter, power)) => {
                applied.push(format!("vowel {}", letter));
                self.vowel_multiplier(power)
            }
            None => 1.0,
        };

        let cursed = if inputs.cursed {
            applied.push("cursed".to_string());
            policy.cursed_multiplier
        } else {
            1.0
        };

        let pad_combo = if inputs.pad_combo {
            applied.push("combo #".to_string());
            policy.pad_combo_multiplier
        } else {
            1.0
        };

        let mut extras = 1.0;
        for (name, factor) in &inputs.extras {
            applied.push(name.clone());
            extras *= factor;
        }

        let raw = policy.base_ms as f64 * speed * vowel * cursed * pad_combo * extras;
        let final_ms = clamp_ms(raw, policy.min_ms, policy.max_ms);

        TimeoutOutcome {
            timeout_ms: final_ms,
            applied,
            log: TimeoutLog {
                base: policy.base_ms,
                speed_bonus: speed,
                vowel_bonus: vowel,
                cursed_malus: cursed,
                pad_combo_malus: pad_combo,
                mission_bonus: extras,
                final_ms,
            },
        }
    }
}

/// Round and clamp a raw timeout. Non-finite input falls to the minimum.
fn clamp_ms(raw: f64, min_ms: u64, max_ms: u64) -> u64 {
    if !raw.is_finite() {
        return if raw == f64::INFINITY { max_ms } else { min_ms };
    }
    let rounded = raw.round();
    if rounded <= min_ms as f64 {
        min_ms
    } else if rounded >= max_ms as f64 {
        max_ms
    } else {
        rounded as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calc() -> TimeoutCalculator {
        TimeoutCalculator::default()
    }

    #[test]
    fn test_instant_response_doubles_base() {
        let out = calc().compute(&TimeoutInputs::default());
        assert_eq!(out.log.speed_bonus, 2.0);
        assert_eq!(out.timeout_ms, 30_000);
        assert_eq!(out.applied, vec!["speed".to_string()]);
    }

    #[test]
    fn test_cursed_letter_quarter_base() {
        let out = calc().compute(&TimeoutInputs {
            response_time_ms: 15_000,
            cursed: true,
            ..Default::default()
        });
        assert_eq!(out.log.speed_bonus, 1.0);
        assert_eq!(out.timeout_ms, 3_750);
        assert_eq!(out.applied, vec!["cursed".to_string()]);
    }

    #[test]
    fn test_one_second_response() {
        let out = calc().compute(&TimeoutInputs {
            response_time_ms: 1_000,
            ..Default::default()
        });
        assert!((out.log.speed_bonus - 1.9333).abs() < 0.001);
        assert!((28_995..=29_000).contains(&out.timeout_ms), "got {}", out.timeout_ms);
    }

    #[test]
    fn test_slow_response_clamps_to_minimum() {
        let out = calc().compute(&TimeoutInputs {
            response_time_ms: 100_000,
            ..Default::default()
        });
        // Negative multiplier floored at zero, result floored at min
        assert_eq!(out.log.speed_bonus, 0.0);
        assert_eq!(out.timeout_ms, 3_000);
    }

    #[test]
    fn test_vowel_and_attack() {
        let out = calc().compute(&TimeoutInputs {
            response_time_ms: 15_000,
            vowel: Some(('a', 1.0)),
            pad_combo: true,
            ..Default::default()
        });
        assert_eq!(out.log.vowel_bonus, 0.75);
        assert_eq!(out.log.pad_combo_malus, 0.5);
        assert_eq!(out.timeout_ms, 5_625);
        assert!(out.applied.contains(&"vowel a".to_string()));
        assert!(out.applied.contains(&"combo #".to_string()));
    }

    #[test]
    fn test_extras_are_recorded() {
        let out = calc().compute(&TimeoutInputs {
            response_time_ms: 15_000,
            extras: vec![("pace".to_string(), 0.5)],
            ..Default::default()
        });
        assert_eq!(out.timeout_ms, 7_500);
        assert_eq!(out.log.mission_bonus, 0.5);
        assert_eq!(out.applied, vec!["pace".to_string()]);
    }

    #[test]
    fn test_huge_extra_clamps_to_maximum() {
        let out = calc().compute(&TimeoutInputs {
            extras: vec![("bonus".to_string(), 100.0)],
            ..Default::default()
        });
        assert_eq!(out.timeout_ms, 60_000);
        assert_eq!(out.log.final_ms, 60_000);
    }

    #[test]
    fn test_non_finite_inputs() {
        assert_eq!(clamp_ms(f64::NAN, 3_000, 60_000), 3_000);
        assert_eq!(clamp_ms(f64::INFINITY, 3_000, 60_000), 60_000);
        assert_eq!(clamp_ms(f64::NEG_INFINITY, 3_000, 60_000), 3_000);
    }

    proptest! {
        #[test]
        fn prop_timeout_always_within_bounds(
            response_time_ms in 0u64..10_000_000,
            power in proptest::option::of(0.0f64..10.0),
            cursed in any::<bool>(),
            pad_combo in any::<bool>(),
            extra in proptest::option::of(0.0f64..100.0),
        ) {
            let inputs = TimeoutInputs {
                response_time_ms,
                vowel: power.map(|p| ('e', p)),
                cursed,
                pad_combo,
                extras: extra.map(|f| vec![("x".to_string(), f)]).unwrap_or_default(),
            };
            let out = calc().compute(&inputs);
            prop_assert!(out.timeout_ms >= 3_000);
            prop_assert!(out.timeout_ms <= 60_000);
            prop_assert_eq!(out.timeout_ms, out.log.final_ms);
        }
    }
}
