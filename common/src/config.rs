use serde::{Deserialize, Serialize};

use crate::types::MAX_PROBES;

/// Which of the duplicated firmware variants this build behaves as: probe
/// slot count and which actuators are wired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProfile {
    pub probe_slots: usize,
    pub has_power: bool,
    pub has_servo: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            probe_slots: MAX_PROBES,
            has_power: true,
            has_servo: true,
        }
    }
}

impl DeviceProfile {
    pub fn sanitize(&mut self) {
        self.probe_slots = self.probe_slots.clamp(1, MAX_PROBES);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub telemetry_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub link_max_attempts: u8,
    pub link_retry_delay_ms: u64,
    pub http_timeout_ms: u64,
    pub loop_delay_ms: u64,
    /// Reading reported for every slot when no probes were detected at
    /// startup.
    pub simulated_temp_c: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 1_000,
            poll_interval_ms: 3_000,
            link_max_attempts: 20,
            link_retry_delay_ms: 500,
            http_timeout_ms: 5_000,
            loop_delay_ms: 100,
            simulated_temp_c: 1.0,
        }
    }
}

impl AgentConfig {
    pub fn sanitize(&mut self) {
        if self.link_max_attempts == 0 {
            self.link_max_attempts = 1;
        }
        self.telemetry_interval_ms = self.telemetry_interval_ms.max(self.loop_delay_ms);
        self.poll_interval_ms = self.poll_interval_ms.max(self.loop_delay_ms);
        if !self.simulated_temp_c.is_finite() {
            self.simulated_temp_c = 1.0;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_url: String,
    pub device_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            server_url: "http://192.168.0.70:4200".to_string(),
            device_id: "esp32-001".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        while self.server_url.ends_with('/') {
            self.server_url.pop();
        }
        if self.device_id.trim().is_empty() {
            self.device_id = "esp32-001".to_string();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub profile: DeviceProfile,
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.agent.sanitize();
        self.profile.sanitize();
        self.network.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn profile_slots_clamp_to_supported_range() {
        let mut profile = DeviceProfile {
            probe_slots: 7,
            has_power: false,
            has_servo: false,
        };
        profile.sanitize();
        assert_eq!(profile.probe_slots, MAX_PROBES);

        profile.probe_slots = 0;
        profile.sanitize();
        assert_eq!(profile.probe_slots, 1);
    }

    #[test]
    fn network_sanitize_strips_trailing_slash() {
        let mut network = NetworkConfig {
            server_url: "http://10.0.0.2:4200/".to_string(),
            ..NetworkConfig::default()
        };
        network.sanitize();
        assert_eq!(network.server_url, "http://10.0.0.2:4200");
    }

    #[test]
    fn zero_retry_budget_is_bumped_to_one() {
        let mut agent = AgentConfig {
            link_max_attempts: 0,
            ..AgentConfig::default()
        };
        agent.sanitize();
        assert_eq!(agent.link_max_attempts, 1);
    }
}
