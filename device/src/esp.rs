use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_graphics::{
    mono_font::{ascii::FONT_5X8, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution as PwmResolution, CHANNEL0, TIMER0},
    prelude::*,
};
use esp_idf_hal::delay::Ets;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use tempmon_common::{
    display::{render_connect_progress, render_status, render_welcome},
    ActuatorAction, Command, CommandAck, CommandBatch, CommandSink, DeviceAgent, DeviceError,
    DeviceProfile, NetworkConfig, RuntimeConfig, TelemetryPayload, MAX_PROBES,
};

const ONE_WIRE_PIN: i32 = 4;
const MAX_HTTP_BODY: usize = 4096;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    ensure_network_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals {
        modem,
        pins,
        i2c0,
        ledc,
        ..
    } = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )?;
    let mut panel = StatusPanel::new(i2c)?;
    panel.draw(&render_welcome())?;

    let mut probes = ProbeBus::new(pins.gpio4.downgrade())?;
    let mut actuators = Actuators::new(
        &runtime.profile,
        pins.gpio26.downgrade_output(),
        ledc.timer0,
        ledc.channel0,
        pins.gpio18.downgrade_output(),
    )?;

    let mut agent = DeviceAgent::new(runtime.agent.clone(), runtime.profile.clone());
    agent.set_probe_count(probes.count());
    info!("detected {} DS18B20 probe(s)", agent.probe_count());

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    configure_station(&mut wifi, &runtime.network)?;
    wifi.start()?;
    info!("wifi started, joining `{}`", runtime.network.wifi_ssid);
    connect_link(&mut wifi, &mut agent, &mut panel)?;

    let mut backend = BackendClient::new(runtime.network.clone(), runtime.agent.http_timeout_ms)?;

    let started = Instant::now();
    loop {
        let now_ms = started.elapsed().as_millis() as u64;

        // A down link skips everything else this cycle.
        if !wifi.is_connected().unwrap_or(false) {
            agent.link_down();
            connect_link(&mut wifi, &mut agent, &mut panel)?;
            panel.draw(&render_status(&agent.snapshot()))?;
            thread::sleep(Duration::from_millis(agent.config().loop_delay_ms));
            continue;
        }

        if agent.telemetry_due(now_ms) {
            let raw = probes.read_all();
            agent.ingest_readings(&raw);
            let payload = agent.telemetry_payload(&runtime.network.device_id);
            let outcome = backend.send_telemetry(&payload);
            if let Err(err) = &outcome {
                warn!("telemetry failed: {err}");
            }
            agent.record_telemetry(now_ms, outcome);
        }

        if agent.poll_due(now_ms) {
            match backend.fetch_commands() {
                Ok(commands) => {
                    agent.record_poll(now_ms, Ok(commands.len()));
                    if !commands.is_empty() {
                        info!("executing {} command(s)", commands.len());
                        let mut sink = EspSink {
                            backend: &mut backend,
                            actuators: &mut actuators,
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

        panel.draw(&render_status(&agent.snapshot()))?;
        thread::sleep(Duration::from_millis(agent.config().loop_delay_ms));
    }
}

fn ensure_network_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("TEMPMON_WIFI_SSID")
            .unwrap_or("CHANGE_ME")
            .to_string();
    }
    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("TEMPMON_WIFI_PASS")
            .unwrap_or("CHANGE_ME")
            .to_string();
    }
    if let Some(url) = option_env!("TEMPMON_SERVER_URL") {
        runtime.network.server_url = url.to_string();
    }
    if let Some(id) = option_env!("TEMPMON_DEVICE_ID") {
        runtime.network.device_id = id.to_string();
    }
}

fn configure_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    Ok(())
}

/// One full retry sequence: up to the configured attempt budget, progress on
/// the panel after every try. Exhaustion leaves the link down and returns
/// normally; the caller's next cycle starts the sequence over.
fn connect_link(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    agent: &mut DeviceAgent,
    panel: &mut StatusPanel,
) -> anyhow::Result<()> {
    let max = agent.config().link_max_attempts;
    let delay = Duration::from_millis(agent.config().link_retry_delay_ms);

    for attempt in 1..=max {
        agent.link_attempt(attempt);
        panel.draw(&render_connect_progress(attempt, max))?;

        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip = wifi.wifi().sta_netif().get_ip_info()?.ip;
                agent.link_up(ip);
                info!("wifi connected ({ip})");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{max} failed: {err}");
                let _ = wifi.disconnect();
            }
        }

        thread::sleep(delay);
    }

    agent.link_down();
    warn!("wifi unavailable after {max} attempts");
    Ok(())
}

/// DS18B20 probes on the one-wire bus, enumerated once at startup.
struct ProbeBus {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    addresses: Vec<Address>,
    delay: Ets,
}

impl ProbeBus {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut bus_pin = PinDriver::input_output_od(pin)?;
        bus_pin.set_pull(Pull::Up)?;
        bus_pin.set_high()?;

        let one_wire = OneWire::new(bus_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut bus = Self {
            one_wire,
            addresses: Vec::new(),
            delay: Ets,
        };
        bus.scan();
        Ok(bus)
    }

    fn scan(&mut self) {
        self.addresses.clear();

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    if self.addresses.len() < MAX_PROBES {
                        self.addresses.push(address);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire scan failed: {err:?}");
                    break;
                }
            }
        }

        if self.addresses.is_empty() {
            warn!("no DS18B20 found on GPIO{ONE_WIRE_PIN}");
        }
    }

    fn count(&self) -> usize {
        self.addresses.len()
    }

    /// One bus-wide conversion, then a read per enumerated probe. A failed
    /// read yields `None` for that slot only.
    fn read_all(&mut self) -> Vec<Option<f32>> {
        if self.addresses.is_empty() {
            return Vec::new();
        }

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            return vec![None; self.addresses.len()];
        }
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        self.addresses
            .iter()
            .map(|address| {
                let sensor = Ds18b20::new::<core::convert::Infallible>(*address).ok()?;
                match sensor.read_data(&mut self.one_wire, &mut self.delay) {
                    Ok(data) => Some(data.temperature),
                    Err(err) => {
                        warn!("DS18B20 read failed at {address:?}: {err:?}");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Relay line plus servo PWM channel, wired per the device profile.
struct Actuators {
    relay: Option<PinDriver<'static, AnyOutputPin, Output>>,
    servo: Option<ServoDrive>,
}

impl Actuators {
    fn new(
        profile: &DeviceProfile,
        relay_pin: AnyOutputPin,
        timer: TIMER0,
        channel: CHANNEL0,
        servo_pin: AnyOutputPin,
    ) -> anyhow::Result<Self> {
        let relay = if profile.has_power {
            let mut pin = PinDriver::output(relay_pin)?;
            pin.set_low()?;
            Some(pin)
        } else {
            None
        };

        let servo = if profile.has_servo {
            let timer_driver = LedcTimerDriver::new(
                timer,
                &TimerConfig::new()
                    .frequency(50.Hz().into())
                    .resolution(PwmResolution::Bits14),
            )?;
            let channel = LedcDriver::new(channel, timer_driver, servo_pin)?;
            Some(ServoDrive::new(channel)?)
        } else {
            None
        };

        Ok(Self { relay, servo })
    }

    fn apply(&mut self, action: ActuatorAction) -> Result<(), DeviceError> {
        let outcome = match action {
            ActuatorAction::SetPower(on) => match self.relay.as_mut() {
                Some(relay) => {
                    let write = if on { relay.set_high() } else { relay.set_low() };
                    write.map_err(|err| err.to_string())
                }
                None => Err("no relay wired".to_string()),
            },
            ActuatorAction::SetServoAngle(angle) => match self.servo.as_mut() {
                Some(servo) => servo.set_angle(angle).map_err(|err| format!("{err:#}")),
                None => Err("no servo wired".to_string()),
            },
        };

        outcome.map_err(|reason| DeviceError::Actuator { reason })
    }
}

/// Hobby servo on LEDC at 50 Hz: 500-2500 microsecond pulse over a 20 ms
/// period spans 0-180 degrees.
struct ServoDrive {
    channel: LedcDriver<'static>,
    max_duty: u32,
}

impl ServoDrive {
    const PERIOD_US: u64 = 20_000;
    const MIN_PULSE_US: u32 = 500;
    const MAX_PULSE_US: u32 = 2_500;

    fn new(channel: LedcDriver<'static>) -> anyhow::Result<Self> {
        let max_duty = channel.get_max_duty();
        let mut drive = Self { channel, max_duty };
        drive.channel.enable().context("failed to enable servo pwm")?;
        drive.set_angle(0)?;
        Ok(drive)
    }

    fn set_angle(&mut self, angle: u8) -> anyhow::Result<()> {
        let angle = angle.min(180) as u32;
        let pulse_us =
            Self::MIN_PULSE_US + angle * (Self::MAX_PULSE_US - Self::MIN_PULSE_US) / 180;
        let duty = (self.max_duty as u64 * pulse_us as u64 / Self::PERIOD_US) as u32;
        self.channel
            .set_duty(duty)
            .context("failed to set servo duty")?;
        Ok(())
    }
}

type Oled = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;

/// SSD1306 over I2C; every draw is a full clear + repaint + flush.
struct StatusPanel {
    display: Oled,
}

impl StatusPanel {
    fn new(i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display
            .init()
            .map_err(|err| anyhow!("display init failed: {err:?}"))?;
        Ok(Self { display })
    }

    fn draw(&mut self, frame: &[String]) -> anyhow::Result<()> {
        self.display
            .clear(BinaryColor::Off)
            .map_err(|err| anyhow!("display clear failed: {err:?}"))?;

        let style = MonoTextStyle::new(&FONT_5X8, BinaryColor::On);
        for (row, line) in frame.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            Text::with_baseline(line, Point::new(0, row as i32 * 8), style, Baseline::Top)
                .draw(&mut self.display)
                .map_err(|err| anyhow!("display draw failed: {err:?}"))?;
        }

        self.display
            .flush()
            .map_err(|err| anyhow!("display flush failed: {err:?}"))?;
        Ok(())
    }
}

/// Blocking HTTP client against the backend, one request in flight at most.
struct BackendClient {
    client: HttpClient<EspHttpConnection>,
    network: NetworkConfig,
}

impl BackendClient {
    fn new(network: NetworkConfig, timeout_ms: u64) -> anyhow::Result<Self> {
        let conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(timeout_ms)),
            ..Default::default()
        };
        let client = HttpClient::wrap(EspHttpConnection::new(&conf)?);
        Ok(Self { client, network })
    }

    fn send_telemetry(&mut self, payload: &TelemetryPayload) -> Result<u16, DeviceError> {
        let body = serde_json::to_vec(payload).map_err(|err| DeviceError::Malformed {
            reason: err.to_string(),
        })?;
        let url = format!("{}/api/esp32/data", self.network.server_url);
        self.post_json(&url, &body)
    }

    fn fetch_commands(&mut self) -> Result<Vec<Command>, DeviceError> {
        let url = format!(
            "{}/api/esp32/commands?deviceId={}",
            self.network.server_url, self.network.device_id
        );
        let request = self
            .client
            .request(Method::Get, &url, &[])
            .map_err(transport)?;
        let mut response = request.submit().map_err(transport)?;

        let status = response.status();
        if status != 200 {
            return Err(DeviceError::Rejected { status });
        }

        let body = read_body(&mut response)?;
        CommandBatch::parse(&body)
    }

    fn ack(&mut self, command_id: i64) -> Result<(), DeviceError> {
        let ack = CommandAck::new(&self.network.device_id, command_id);
        let body = serde_json::to_vec(&ack).map_err(|err| DeviceError::Malformed {
            reason: err.to_string(),
        })?;
        let url = format!("{}/api/esp32/commands/ack", self.network.server_url);

        let status = self.post_json(&url, &body)?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(DeviceError::Rejected { status })
        }
    }

    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<u16, DeviceError> {
        let length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", length.as_str()),
        ];

        let mut request = self
            .client
            .request(Method::Post, url, &headers)
            .map_err(transport)?;
        request.write_all(body).map_err(transport)?;
        let response = request.submit().map_err(transport)?;
        Ok(response.status())
    }
}

fn read_body(
    response: &mut embedded_svc::http::client::Response<&mut EspHttpConnection>,
) -> Result<String, DeviceError> {
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 256];

    loop {
        let read = response.read(&mut chunk).map_err(transport)?;
        if read == 0 {
            break;
        }
        if raw.len() + read > MAX_HTTP_BODY {
            return Err(DeviceError::Malformed {
                reason: "response body too large".to_string(),
            });
        }
        raw.extend_from_slice(&chunk[..read]);
    }

    String::from_utf8(raw).map_err(|err| DeviceError::Malformed {
        reason: err.to_string(),
    })
}

fn transport<E: core::fmt::Debug>(err: E) -> DeviceError {
    DeviceError::Transport {
        reason: format!("{err:?}"),
    }
}

struct EspSink<'a> {
    backend: &'a mut BackendClient,
    actuators: &'a mut Actuators,
}

impl CommandSink for EspSink<'_> {
    fn apply(&mut self, action: ActuatorAction) -> Result<(), DeviceError> {
        self.actuators.apply(action)
    }

    fn ack(&mut self, command_id: i64) -> Result<(), DeviceError> {
        self.backend.ack(command_id)
    }
}
