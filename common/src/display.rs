//! Text layout for the 128x64 OLED. The frame is plain lines here; the esp32
//! layer rasterizes them with a 5x8 font and the host layer logs them.

use crate::types::{is_fault, StatusSnapshot};

pub const COLS: usize = 25;
pub const ROWS: usize = 8;

/// Full status screen, one repaint per call. Fixed layout: probe lines,
/// actuator line, link, telemetry, poll + last command, last error.
pub fn render_status(snapshot: &StatusSnapshot) -> Vec<String> {
    let mut lines = Vec::with_capacity(ROWS);

    for slot in 0..snapshot.probe_slots {
        let value = snapshot.readings[slot];
        if is_fault(value) {
            lines.push(format!("T{}: --", slot + 1));
        } else {
            lines.push(format!("T{}: {:.1} C", slot + 1, value));
        }
    }

    let mut actuators = Vec::new();
    if let Some(power) = snapshot.power {
        actuators.push(format!("PWR {}", if power { "ON" } else { "OFF" }));
    }
    if let Some(position) = snapshot.servo_position {
        actuators.push(format!("SRV {position}"));
    }
    if !actuators.is_empty() {
        lines.push(actuators.join("  "));
    }

    lines.push(format!("NET {}", snapshot.link.status_line()));
    lines.push(format!("TX {}", snapshot.telemetry.status_line()));
    match &snapshot.last_command {
        Some(command) => lines.push(format!("RX {} {command}", snapshot.poll.status_line())),
        None => lines.push(format!("RX {}", snapshot.poll.status_line())),
    }
    match &snapshot.last_error {
        Some(error) => lines.push(format!("E {error}")),
        None => lines.push(String::new()),
    }

    framed(lines)
}

pub fn render_welcome() -> Vec<String> {
    framed(vec![
        String::new(),
        "tempmon".to_string(),
        "temperature monitor".to_string(),
        String::new(),
        "starting...".to_string(),
    ])
}

/// Shown while the connectivity manager walks its retry budget.
pub fn render_connect_progress(attempt: u8, max: u8) -> Vec<String> {
    let width = COLS - 2;
    let filled = if max == 0 {
        0
    } else {
        (attempt as usize * width / max as usize).min(width)
    };

    let mut bar = String::with_capacity(COLS);
    bar.push('[');
    for cell in 0..width {
        bar.push(if cell < filled { '#' } else { '.' });
    }
    bar.push(']');

    framed(vec![
        "connecting to wifi".to_string(),
        format!("attempt {attempt}/{max}"),
        String::new(),
        bar,
    ])
}

fn framed(mut lines: Vec<String>) -> Vec<String> {
    lines.truncate(ROWS);
    while lines.len() < ROWS {
        lines.push(String::new());
    }
    lines.iter().map(|line| fit(line)).collect()
}

fn fit(line: &str) -> String {
    line.chars().take(COLS).collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::{LinkState, PollOutcome, ReportOutcome, PROBE_FAULT_C};

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            readings: [21.5, PROBE_FAULT_C, PROBE_FAULT_C],
            probe_slots: 3,
            probe_count: 1,
            power: Some(true),
            servo_position: Some(40),
            link: LinkState::Up(Ipv4Addr::new(192, 168, 0, 50)),
            telemetry: ReportOutcome::Sent(200),
            poll: PollOutcome::Received,
            last_command: Some("servo 40".to_string()),
            last_error: None,
        }
    }

    #[test]
    fn status_frame_has_fixed_dimensions() {
        let frame = render_status(&snapshot());
        assert_eq!(frame.len(), ROWS);
        assert!(frame.iter().all(|line| line.chars().count() <= COLS));
    }

    #[test]
    fn status_frame_lays_out_every_field() {
        let frame = render_status(&snapshot());
        assert_eq!(frame[0], "T1: 21.5 C");
        assert_eq!(frame[1], "T2: --");
        assert_eq!(frame[2], "T3: --");
        assert_eq!(frame[3], "PWR ON  SRV 40");
        assert_eq!(frame[4], "NET 192.168.0.50");
        assert_eq!(frame[5], "TX OK (200)");
        assert_eq!(frame[6], "RX OK servo 40");
        assert_eq!(frame[7], "");
    }

    #[test]
    fn long_error_text_is_truncated_to_fit() {
        let mut snapshot = snapshot();
        snapshot.last_error =
            Some("send failed: connection refused by 192.168.0.70:4200".to_string());

        let frame = render_status(&snapshot);
        assert_eq!(frame[7].chars().count(), COLS);
        assert!(frame[7].starts_with("E send failed"));
    }

    #[test]
    fn single_probe_profile_pads_with_blank_lines() {
        let mut snapshot = snapshot();
        snapshot.probe_slots = 1;
        snapshot.power = None;
        snapshot.servo_position = None;
        snapshot.last_command = None;

        let frame = render_status(&snapshot);
        assert_eq!(frame.len(), ROWS);
        assert_eq!(frame[0], "T1: 21.5 C");
        assert_eq!(frame[1], "NET 192.168.0.50");
        assert_eq!(frame[4], "");
        assert_eq!(frame[7], "");
    }

    #[test]
    fn progress_bar_tracks_the_attempt_counter() {
        let early = render_connect_progress(1, 20);
        let done = render_connect_progress(20, 20);

        assert_eq!(early[1], "attempt 1/20");
        assert_eq!(early[3].chars().filter(|c| *c == '#').count(), 1);
        assert_eq!(done[3], format!("[{}]", "#".repeat(COLS - 2)));
    }

    #[test]
    fn welcome_banner_fits_the_panel() {
        let frame = render_welcome();
        assert_eq!(frame.len(), ROWS);
        assert_eq!(frame[1], "tempmon");
    }
}
