//! Peer capability records and scoring.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a device can contribute to the mesh.  `battery_level` is a
/// percentage in `0..=100`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub has_local_llm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub free_memory_gb: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f32>,
    pub is_charging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            has_local_llm: false,
            model_name: None,
            free_memory_gb: 0.0,
            battery_level: None,
            is_charging: false,
            cpu_cores: None,
        }
    }
}

impl Capability {
    /// Deterministic suitability score:
    /// `100·has_llm + 10·free_memory_GB + (50 if charging else 0.5·battery)`.
    pub fn score(&self) -> f32 {
        let llm = if self.has_local_llm { 100.0 } else { 0.0 };
        let memory = 10.0 * self.free_memory_gb;
        let power = if self.is_charging {
            50.0
        } else {
            0.5 * self.battery_level.unwrap_or(0.0)
        };
        llm + memory + power
    }
}

/// Client-side routing score: the capability score with a hop penalty and a
/// recency bonus for peers heard from lately.
pub fn routing_score(capability: &Capability, hop_count: usize, since_last_seen: Duration) -> f32 {
    let mut score = capability.score() - 10.0 * hop_count as f32;
    if since_last_seen < Duration::from_secs(60) {
        score += 20.0;
    } else if since_last_seen < Duration::from_secs(300) {
        score += 10.0;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(llm: bool, mem: f32, battery: Option<f32>, charging: bool) -> Capability {
        Capability {
            has_local_llm: llm,
            free_memory_gb: mem,
            battery_level: battery,
            is_charging: charging,
            ..Capability::default()
        }
    }

    #[test]
    fn score_is_pure() {
        let c = capability(true, 4.0, Some(80.0), false);
        assert_eq!(c.score(), c.score());
        assert_eq!(c.score(), 100.0 + 40.0 + 40.0);
    }

    #[test]
    fn charging_beats_battery() {
        let charging = capability(false, 2.0, Some(100.0), true);
        let on_battery = capability(false, 2.0, Some(100.0), false);
        assert_eq!(charging.score(), 20.0 + 50.0);
        assert_eq!(on_battery.score(), 20.0 + 50.0);
        let low_battery = capability(false, 2.0, Some(20.0), false);
        assert!(low_battery.score() < charging.score());
    }

    #[test]
    fn monotonic_in_memory_and_llm() {
        for mem in [0.0f32, 1.0, 2.5, 8.0, 64.0] {
            let without = capability(false, mem, Some(50.0), false);
            let with = capability(true, mem, Some(50.0), false);
            assert!(with.score() > without.score());

            let more_memory = capability(false, mem + 1.0, Some(50.0), false);
            assert!(more_memory.score() > without.score());
        }
    }

    #[test]
    fn routing_score_penalizes_hops_and_rewards_recency() {
        let c = capability(true, 4.0, None, true);
        let near = routing_score(&c, 1, Duration::from_secs(5));
        let far = routing_score(&c, 3, Duration::from_secs(5));
        assert!(near > far);
        assert_eq!(near - far, 20.0);

        let fresh = routing_score(&c, 1, Duration::from_secs(30));
        let warm = routing_score(&c, 1, Duration::from_secs(120));
        let cold = routing_score(&c, 1, Duration::from_secs(400));
        assert_eq!(fresh - warm, 10.0);
        assert_eq!(warm - cold, 10.0);
    }
}
