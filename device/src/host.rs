use std::{
    net::Ipv4Addr,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use reqwest::blocking::Client;
use tracing::{info, warn};

use tempmon_common::{
    display::{render_status, render_welcome},
    ActuatorAction, Command, CommandAck, CommandBatch, CommandSink, DeviceAgent, DeviceError,
    NetworkConfig, RuntimeConfig, TelemetryPayload,
};

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = RuntimeConfig::default();
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let client = Client::builder()
        .timeout(Duration::from_millis(runtime.agent.http_timeout_ms))
        .build()
        .context("failed to build http client")?;

    let simulated = std::env::var("TEMPMON_SIM_PROBES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(2);
    let mut probes = SimProbeBus::new(simulated.min(runtime.profile.probe_slots));

    let mut agent = DeviceAgent::new(runtime.agent.clone(), runtime.profile.clone());
    agent.set_probe_count(probes.count());
    info!("simulating {} probe(s)", agent.probe_count());

    // The workstation build has no radio to associate; the link starts up
    // but keeps the same status plumbing as the esp32 target.
    agent.link_up(Ipv4Addr::LOCALHOST);

    let mut panel = LogPanel::default();
    panel.draw(&render_welcome());

    info!(
        "reporting to {} as {}",
        runtime.network.server_url, runtime.network.device_id
    );

    let started = Instant::now();
    loop {
        let now_ms = started.elapsed().as_millis() as u64;

        if agent.telemetry_due(now_ms) {
            let raw = probes.read_all();
            agent.ingest_readings(&raw);
            let payload = agent.telemetry_payload(&runtime.network.device_id);
            let outcome = send_telemetry(&client, &runtime.network, &payload);
            if let Err(err) = &outcome {
                warn!("telemetry failed: {err}");
            }
            agent.record_telemetry(now_ms, outcome);
        }

        if agent.poll_due(now_ms) {
            match fetch_commands(&client, &runtime.network) {
                Ok(commands) => {
                    agent.record_poll(now_ms, Ok(commands.len()));
                    if !commands.is_empty() {
                        info!("executing {} command(s)", commands.len());
                        let mut sink = HostSink {
                            client: &client,
                            network: &runtime.network,
                        };
                        agent.execute_batch(&commands, &mut sink);
                    }
                }
                Err(err) => {
                    warn!("command poll failed: {err}");
                    agent.record_poll(now_ms, Err(err));
                }
            }
        }

        panel.draw(&render_status(&agent.snapshot()));
        thread::sleep(Duration::from_millis(runtime.agent.loop_delay_ms));
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("TEMPMON_SERVER_URL") {
        runtime.network.server_url = url;
    }
    if let Ok(id) = std::env::var("TEMPMON_DEVICE_ID") {
        runtime.network.device_id = id;
    }
    if let Some(interval) = env_u64("TEMPMON_TELEMETRY_MS") {
        runtime.agent.telemetry_interval_ms = interval;
    }
    if let Some(interval) = env_u64("TEMPMON_POLL_MS") {
        runtime.agent.poll_interval_ms = interval;
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn send_telemetry(
    client: &Client,
    network: &NetworkConfig,
    payload: &TelemetryPayload,
) -> Result<u16, DeviceError> {
    let body = serde_json::to_vec(payload).map_err(|err| DeviceError::Malformed {
        reason: err.to_string(),
    })?;
    let response = client
        .post(format!("{}/api/esp32/data", network.server_url))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .map_err(transport)?;
    Ok(response.status().as_u16())
}

fn fetch_commands(client: &Client, network: &NetworkConfig) -> Result<Vec<Command>, DeviceError> {
    let response = client
        .get(format!("{}/api/esp32/commands", network.server_url))
        .query(&[("deviceId", network.device_id.as_str())])
        .send()
        .map_err(transport)?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(DeviceError::Rejected { status });
    }

    let body = response.text().map_err(transport)?;
    CommandBatch::parse(&body)
}

fn transport(err: reqwest::Error) -> DeviceError {
    DeviceError::Transport {
        reason: err.to_string(),
    }
}

struct HostSink<'a> {
    client: &'a Client,
    network: &'a NetworkConfig,
}

impl CommandSink for HostSink<'_> {
    fn apply(&mut self, action: ActuatorAction) -> Result<(), DeviceError> {
        // No relay or servo on a workstation; applying is logging.
        match action {
            ActuatorAction::SetPower(on) => info!("relay -> {}", if on { "ON" } else { "OFF" }),
            ActuatorAction::SetServoAngle(angle) => info!("servo -> {angle} deg"),
        }
        Ok(())
    }

    fn ack(&mut self, command_id: i64) -> Result<(), DeviceError> {
        let ack = CommandAck::new(&self.network.device_id, command_id);
        let response = self
            .client
            .post(format!("{}/api/esp32/commands/ack", self.network.server_url))
            .json(&ack)
            .send()
            .map_err(transport)?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(DeviceError::Rejected { status })
        }
    }
}

/// Stand-in for the one-wire bus, same shape as the esp32 probe suite.
struct SimProbeBus {
    count: usize,
    tick: u64,
}

impl SimProbeBus {
    fn new(count: usize) -> Self {
        Self { count, tick: 0 }
    }

    fn count(&self) -> usize {
        self.count
    }

    fn read_all(&mut self) -> Vec<Option<f32>> {
        self.tick = self.tick.wrapping_add(1);
        (0..self.count)
            .map(|slot| Some(20.0 + slot as f32 + (self.tick % 8) as f32 * 0.2))
            .collect()
    }
}

/// Logs the OLED frame whenever its contents change.
#[derive(Default)]
struct LogPanel {
    last: Vec<String>,
}

impl LogPanel {
    fn draw(&mut self, frame: &[String]) {
        if frame == self.last.as_slice() {
            return;
        }
        for line in frame {
            info!(target: "display", "{line}");
        }
        self.last = frame.to_vec();
    }
}
