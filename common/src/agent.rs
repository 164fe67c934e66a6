use std::net::Ipv4Addr;

use crate::{
    config::{AgentConfig, DeviceProfile},
    error::DeviceError,
    types::{
        servo_angle, Command, CommandAction, LinkState, PollOutcome, ReportOutcome,
        StatusSnapshot, TelemetryPayload, MAX_PROBES, PROBE_FAULT_C,
    },
};

/// Physical output writes emitted while executing a command batch. The
/// platform layer maps these onto the relay line and the servo PWM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorAction {
    SetPower(bool),
    /// Angle in 0-180, already remapped from the command's 0-100 domain.
    SetServoAngle(u8),
}

/// Seam between command execution and the platform. `apply` drives hardware;
/// `ack` confirms one command to the backend. The agent calls them strictly
/// interleaved: apply, ack, apply, ack, ... in batch order.
pub trait CommandSink {
    fn apply(&mut self, action: ActuatorAction) -> Result<(), DeviceError>;
    fn ack(&mut self, command_id: i64) -> Result<(), DeviceError>;
}

/// Per-cycle engine owning the whole device state. The platform loop feeds
/// it readings, outcomes, and command batches; it never does I/O itself.
#[derive(Debug, Clone)]
pub struct DeviceAgent {
    config: AgentConfig,
    profile: DeviceProfile,

    readings: [f32; MAX_PROBES],
    probe_count: usize,
    power_on: bool,
    servo_position: u8,

    link: LinkState,
    telemetry: ReportOutcome,
    poll: PollOutcome,
    last_command: Option<String>,
    last_error: Option<DeviceError>,

    last_telemetry_ms: Option<u64>,
    last_poll_ms: Option<u64>,
}

impl DeviceAgent {
    pub fn new(config: AgentConfig, profile: DeviceProfile) -> Self {
        Self {
            config,
            profile,
            readings: [PROBE_FAULT_C; MAX_PROBES],
            probe_count: 0,
            power_on: false,
            servo_position: 0,
            link: LinkState::Down,
            telemetry: ReportOutcome::Pending,
            poll: PollOutcome::Pending,
            last_command: None,
            last_error: None,
            last_telemetry_ms: None,
            last_poll_ms: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    pub fn readings(&self) -> &[f32; MAX_PROBES] {
        &self.readings
    }

    pub fn power_on(&self) -> bool {
        self.power_on
    }

    pub fn servo_position(&self) -> u8 {
        self.servo_position
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    /// Records the startup bus scan. Probes beyond the profile's slot count
    /// are ignored even if physically present.
    pub fn set_probe_count(&mut self, detected: usize) {
        self.probe_count = detected.min(self.profile.probe_slots);
    }

    /// Applies the sentinel rules to one conversion pass. Slots at or beyond
    /// the detected count always read the sentinel; with no probes at all,
    /// every profile slot reports the fixed simulated value.
    pub fn ingest_readings(&mut self, raw: &[Option<f32>]) {
        if self.probe_count == 0 {
            for slot in 0..self.profile.probe_slots {
                self.readings[slot] = self.config.simulated_temp_c;
            }
            return;
        }

        for slot in 0..MAX_PROBES {
            self.readings[slot] = if slot >= self.probe_count {
                PROBE_FAULT_C
            } else {
                match raw.get(slot).copied().flatten() {
                    Some(celsius) if celsius.is_finite() => celsius,
                    _ => PROBE_FAULT_C,
                }
            };
        }
    }

    pub fn telemetry_due(&self, now_ms: u64) -> bool {
        match self.last_telemetry_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.config.telemetry_interval_ms,
            None => true,
        }
    }

    pub fn poll_due(&self, now_ms: u64) -> bool {
        match self.last_poll_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.config.poll_interval_ms,
            None => true,
        }
    }

    pub fn telemetry_payload(&self, device_id: &str) -> TelemetryPayload {
        let slot = |index: usize| (index < self.profile.probe_slots).then(|| self.readings[index]);
        TelemetryPayload {
            device_id: device_id.to_string(),
            temperature1: slot(0),
            temperature2: slot(1),
            temperature3: slot(2),
            sensor_count: self.probe_count,
            status: "online",
        }
    }

    /// A positive HTTP code counts as delivered; everything else leaves the
    /// fixed failure marker and the error. The timestamp advances either
    /// way, so a failed report waits out the full interval (skip, not queue).
    pub fn record_telemetry(&mut self, now_ms: u64, outcome: Result<u16, DeviceError>) {
        self.last_telemetry_ms = Some(now_ms);
        match outcome {
            Ok(code) => {
                self.telemetry = ReportOutcome::Sent(code);
                self.last_error = None;
            }
            Err(err) => {
                self.telemetry = ReportOutcome::Failed;
                self.last_error = Some(err);
            }
        }
    }

    pub fn record_poll(&mut self, now_ms: u64, outcome: Result<usize, DeviceError>) {
        self.last_poll_ms = Some(now_ms);
        match outcome {
            Ok(_) => {
                self.poll = PollOutcome::Received;
                self.last_error = None;
            }
            Err(err) => {
                self.poll = PollOutcome::Failed;
                self.last_error = Some(err);
            }
        }
    }

    /// Executes one poll response strictly in array order. Every applied
    /// command is acknowledged through the sink before the next one runs.
    /// Unknown kinds and actuator faults are recorded, skip their ack, and
    /// leave the rest of the batch untouched. Returns how many commands
    /// were applied.
    pub fn execute_batch(&mut self, commands: &[Command], sink: &mut dyn CommandSink) -> usize {
        let mut applied = 0;

        for command in commands {
            let action = match self.decode(command) {
                Ok(action) => action,
                Err(err) => {
                    self.last_error = Some(err);
                    continue;
                }
            };

            let output = match action {
                CommandAction::PowerOn => ActuatorAction::SetPower(true),
                CommandAction::PowerOff => ActuatorAction::SetPower(false),
                CommandAction::SetServo(position) => {
                    ActuatorAction::SetServoAngle(servo_angle(position))
                }
            };

            if let Err(err) = sink.apply(output) {
                self.last_error = Some(err);
                continue;
            }

            match action {
                CommandAction::PowerOn => self.power_on = true,
                CommandAction::PowerOff => self.power_on = false,
                // Display and telemetry keep the un-remapped 0-100 value.
                CommandAction::SetServo(position) => self.servo_position = position,
            }
            self.last_command = Some(command.describe());
            applied += 1;

            if let Err(err) = sink.ack(command.id) {
                self.last_error = Some(err);
            }
        }

        applied
    }

    fn decode(&self, command: &Command) -> Result<CommandAction, DeviceError> {
        let action = command.decode()?;
        let supported = match action {
            CommandAction::PowerOn | CommandAction::PowerOff => self.profile.has_power,
            CommandAction::SetServo(_) => self.profile.has_servo,
        };
        if supported {
            Ok(action)
        } else {
            Err(DeviceError::UnknownCommand {
                id: command.id,
                kind: command.kind.clone(),
            })
        }
    }

    pub fn link_attempt(&mut self, attempt: u8) {
        self.link = LinkState::Connecting {
            attempt,
            max: self.config.link_max_attempts,
        };
    }

    pub fn link_up(&mut self, ip: Ipv4Addr) {
        self.link = LinkState::Up(ip);
    }

    pub fn link_down(&mut self) {
        self.link = LinkState::Down;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            readings: self.readings,
            probe_slots: self.profile.probe_slots,
            probe_count: self.probe_count,
            power: self.profile.has_power.then_some(self.power_on),
            servo_position: self.profile.has_servo.then_some(self.servo_position),
            link: self.link,
            telemetry: self.telemetry,
            poll: self.poll,
            last_command: self.last_command.clone(),
            last_error: self.last_error.as_ref().map(|err| err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkEvent {
        Apply(ActuatorAction),
        Ack(i64),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<SinkEvent>,
        fail_apply: bool,
        fail_ack: bool,
    }

    impl CommandSink for RecordingSink {
        fn apply(&mut self, action: ActuatorAction) -> Result<(), DeviceError> {
            if self.fail_apply {
                return Err(DeviceError::Actuator {
                    reason: "relay write failed".to_string(),
                });
            }
            self.events.push(SinkEvent::Apply(action));
            Ok(())
        }

        fn ack(&mut self, command_id: i64) -> Result<(), DeviceError> {
            if self.fail_ack {
                return Err(DeviceError::Rejected { status: 500 });
            }
            self.events.push(SinkEvent::Ack(command_id));
            Ok(())
        }
    }

    fn agent() -> DeviceAgent {
        DeviceAgent::new(AgentConfig::default(), DeviceProfile::default())
    }

    fn command(id: i64, kind: &str, value: Option<f64>) -> Command {
        Command {
            id,
            kind: kind.to_string(),
            value,
        }
    }

    #[test]
    fn slots_beyond_detected_count_always_read_sentinel() {
        let mut agent = agent();
        agent.set_probe_count(2);
        agent.ingest_readings(&[Some(20.0), Some(21.0), Some(22.0)]);

        assert_eq!(agent.readings()[0], 20.0);
        assert_eq!(agent.readings()[1], 21.0);
        assert_eq!(agent.readings()[2], PROBE_FAULT_C);
    }

    #[test]
    fn nan_and_missing_readings_become_sentinel() {
        let mut agent = agent();
        agent.set_probe_count(3);
        agent.ingest_readings(&[Some(f32::NAN), None, Some(19.25)]);

        assert_eq!(agent.readings()[0], PROBE_FAULT_C);
        assert_eq!(agent.readings()[1], PROBE_FAULT_C);
        assert_eq!(agent.readings()[2], 19.25);
    }

    #[test]
    fn zero_probes_report_the_simulated_value() {
        let mut agent = agent();
        agent.set_probe_count(0);
        agent.ingest_readings(&[]);

        assert_eq!(agent.readings()[0], 1.0);
        assert_eq!(agent.readings()[1], 1.0);
        assert_eq!(agent.readings()[2], 1.0);
        assert_eq!(agent.probe_count(), 0);
    }

    #[test]
    fn detected_count_is_capped_by_profile_slots() {
        let profile = DeviceProfile {
            probe_slots: 1,
            has_power: true,
            has_servo: true,
        };
        let mut agent = DeviceAgent::new(AgentConfig::default(), profile);
        agent.set_probe_count(3);

        assert_eq!(agent.probe_count(), 1);

        agent.ingest_readings(&[Some(18.0), Some(19.0), Some(20.0)]);
        assert_eq!(agent.readings()[0], 18.0);
        assert_eq!(agent.readings()[1], PROBE_FAULT_C);
    }

    #[test]
    fn batch_runs_fifo_with_ack_after_each_apply() {
        let mut agent = agent();
        let mut sink = RecordingSink::default();

        let applied = agent.execute_batch(
            &[
                command(1, "power_on", None),
                command(2, "power_off", None),
            ],
            &mut sink,
        );

        assert_eq!(applied, 2);
        assert!(!agent.power_on());
        assert_eq!(
            sink.events,
            vec![
                SinkEvent::Apply(ActuatorAction::SetPower(true)),
                SinkEvent::Ack(1),
                SinkEvent::Apply(ActuatorAction::SetPower(false)),
                SinkEvent::Ack(2),
            ]
        );
    }

    #[test]
    fn servo_command_stores_unmapped_value_and_applies_angle() {
        let mut agent = agent();
        let mut sink = RecordingSink::default();

        let applied = agent.execute_batch(&[command(5, "servo", Some(57.9))], &mut sink);

        assert_eq!(applied, 1);
        assert_eq!(agent.servo_position(), 57);
        assert_eq!(
            sink.events,
            vec![
                SinkEvent::Apply(ActuatorAction::SetServoAngle(102)),
                SinkEvent::Ack(5),
            ]
        );
    }

    #[test]
    fn unknown_command_sets_error_skips_ack_and_keeps_batch_going() {
        let mut agent = agent();
        let mut sink = RecordingSink::default();

        let applied = agent.execute_batch(
            &[
                command(1, "reboot", None),
                command(2, "power_on", None),
            ],
            &mut sink,
        );

        assert_eq!(applied, 1);
        assert!(agent.power_on());
        assert_eq!(
            agent.last_error(),
            Some(&DeviceError::UnknownCommand {
                id: 1,
                kind: "reboot".to_string(),
            })
        );
        // No ack for the unknown command; the backend keeps it visible.
        assert_eq!(
            sink.events,
            vec![
                SinkEvent::Apply(ActuatorAction::SetPower(true)),
                SinkEvent::Ack(2),
            ]
        );
    }

    #[test]
    fn actuator_fault_suppresses_ack_and_state_change() {
        let mut agent = agent();
        let mut sink = RecordingSink {
            fail_apply: true,
            ..RecordingSink::default()
        };

        let applied = agent.execute_batch(&[command(3, "power_on", None)], &mut sink);

        assert_eq!(applied, 0);
        assert!(!agent.power_on());
        assert!(sink.events.is_empty());
        assert!(matches!(
            agent.last_error(),
            Some(DeviceError::Actuator { .. })
        ));
    }

    #[test]
    fn failed_ack_is_recorded_but_command_stays_applied() {
        let mut agent = agent();
        let mut sink = RecordingSink {
            fail_ack: true,
            ..RecordingSink::default()
        };

        let applied = agent.execute_batch(&[command(6, "power_on", None)], &mut sink);

        assert_eq!(applied, 1);
        assert!(agent.power_on());
        assert_eq!(agent.last_error(), Some(&DeviceError::Rejected { status: 500 }));
    }

    #[test]
    fn profile_without_servo_treats_servo_as_unknown() {
        let profile = DeviceProfile {
            probe_slots: 2,
            has_power: true,
            has_servo: false,
        };
        let mut agent = DeviceAgent::new(AgentConfig::default(), profile);
        let mut sink = RecordingSink::default();

        let applied = agent.execute_batch(&[command(8, "servo", Some(50.0))], &mut sink);

        assert_eq!(applied, 0);
        assert!(sink.events.is_empty());
        assert_eq!(
            agent.last_error(),
            Some(&DeviceError::UnknownCommand {
                id: 8,
                kind: "servo".to_string(),
            })
        );
    }

    #[test]
    fn telemetry_gating_skips_missed_periods_instead_of_queueing() {
        let mut agent = agent();

        assert!(agent.telemetry_due(0));
        agent.record_telemetry(0, Ok(200));
        assert!(!agent.telemetry_due(999));
        assert!(agent.telemetry_due(1_000));

        // The loop stalled well past two periods; one report happens and the
        // next is a full interval away.
        agent.record_telemetry(2_500, Ok(200));
        assert!(!agent.telemetry_due(3_400));
        assert!(agent.telemetry_due(3_500));
    }

    #[test]
    fn poll_gating_follows_its_own_interval() {
        let mut agent = agent();

        assert!(agent.poll_due(0));
        agent.record_poll(0, Ok(0));
        assert!(!agent.poll_due(2_999));
        assert!(agent.poll_due(3_000));
    }

    #[test]
    fn telemetry_outcome_formats_code_on_success_and_marker_on_failure() {
        let mut agent = agent();

        agent.record_telemetry(0, Ok(200));
        assert_eq!(agent.snapshot().telemetry.status_line(), "OK (200)");
        assert_eq!(agent.snapshot().last_error, None);

        agent.record_telemetry(
            1_000,
            Err(DeviceError::Transport {
                reason: "connection refused".to_string(),
            }),
        );
        let snapshot = agent.snapshot();
        assert_eq!(snapshot.telemetry.status_line(), "ERR");
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("send failed: connection refused")
        );
    }

    #[test]
    fn connect_sequence_exhausts_after_max_attempts_with_fixed_marker() {
        let mut agent = agent();
        let max = agent.config().link_max_attempts;

        let mut attempts = 0;
        for attempt in 1..=max {
            agent.link_attempt(attempt);
            attempts += 1;
            assert_eq!(
                agent.link().status_line(),
                format!("attempt {attempt}/{max}")
            );
        }
        agent.link_down();

        assert_eq!(attempts, 20);
        assert_eq!(agent.link().status_line(), "offline");
        assert!(!agent.link().is_up());
    }

    #[test]
    fn payload_tracks_profile_slots_and_detected_count() {
        let profile = DeviceProfile {
            probe_slots: 2,
            has_power: true,
            has_servo: true,
        };
        let mut agent = DeviceAgent::new(AgentConfig::default(), profile);
        agent.set_probe_count(1);
        agent.ingest_readings(&[Some(23.75)]);

        let payload = agent.telemetry_payload("esp32-001");
        assert_eq!(payload.temperature1, Some(23.75));
        assert_eq!(payload.temperature2, Some(PROBE_FAULT_C));
        assert_eq!(payload.temperature3, None);
        assert_eq!(payload.sensor_count, 1);
        assert_eq!(payload.status, "online");
    }
}
