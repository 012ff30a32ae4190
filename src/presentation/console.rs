//! Operator console: text commands in place of the touch controls, and a
//! dashboard fed by [`AppEvent`]s.

use crate::domain::control::{ControlOutput, ControlSettings, SLIDER_MAX};
use crate::domain::models::{
    AppEvent, LinkState, MessageSeverity, StatusMessage, TelemetrySample,
};
use crate::infrastructure::bluetooth::protocol::{HEADING_RANGE, THROTTLE_MAX};
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  scan                      Search for the robot and connect
  disconnect                Drop the link (or stop scanning)
  trim <0-1000>             Radius trim slider
  fine <0-1000>             Fine trim slider (500 = centre)
  throttle <0-100>          Throttle
  heading <0-99|+|->        Heading LED offset
  tilt-steer on|off         Steer by tilting sideways
  heartbeat on|off          Heartbeat marker
  foreground on|off         Console visibility
  tilt <fwd_g> <steer_g>    Feed an accelerometer sample, in G
  status                    Show the dashboard
  help                      This text
  quit                      Exit";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserCommand {
    Scan,
    Disconnect,
    Trim(u16),
    FineTrim(u16),
    Throttle(u8),
    Heading(u8),
    HeadingUp,
    HeadingDown,
    TiltSteer(bool),
    Heartbeat(bool),
    Foreground(bool),
    Tilt { forward_back_g: f32, steer_g: f32 },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}'. Type 'help' for a list.")]
    Unknown(String),
    #[error("'{command}' expects {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },
    #[error("Invalid value '{value}' for '{command}': expected {expected}")]
    InvalidArgument {
        command: &'static str,
        value: String,
        expected: &'static str,
    },
}

fn argument<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    expected: &'static str,
) -> Result<&'a str, CommandError> {
    args.next()
        .ok_or(CommandError::MissingArgument { command, expected })
}

fn bounded<T>(value: &str, max: T, command: &'static str, expected: &'static str) -> Result<T, CommandError>
where
    T: FromStr + PartialOrd,
{
    match value.parse::<T>() {
        Ok(v) if v <= max => Ok(v),
        _ => Err(CommandError::InvalidArgument {
            command,
            value: value.to_string(),
            expected,
        }),
    }
}

fn switch(value: &str, command: &'static str) -> Result<bool, CommandError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(CommandError::InvalidArgument {
            command,
            value: value.to_string(),
            expected: "on or off",
        }),
    }
}

fn g_value(value: &str, command: &'static str) -> Result<f32, CommandError> {
    value
        .parse::<f32>()
        .ok()
        .filter(|g| g.is_finite())
        .ok_or_else(|| CommandError::InvalidArgument {
            command,
            value: value.to_string(),
            expected: "a number of G",
        })
}

impl FromStr for UserCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "scan" => Self::Scan,
            "disconnect" => Self::Disconnect,
            "trim" => {
                let v = argument(&mut words, "trim", "a slider position")?;
                Self::Trim(bounded(v, SLIDER_MAX, "trim", "0-1000")?)
            }
            "fine" => {
                let v = argument(&mut words, "fine", "a slider position")?;
                Self::FineTrim(bounded(v, SLIDER_MAX, "fine", "0-1000")?)
            }
            "throttle" => {
                let v = argument(&mut words, "throttle", "a throttle value")?;
                Self::Throttle(bounded(v, THROTTLE_MAX, "throttle", "0-100")?)
            }
            "heading" => match argument(&mut words, "heading", "an offset, + or -")? {
                "+" => Self::HeadingUp,
                "-" => Self::HeadingDown,
                v => Self::Heading(bounded(v, HEADING_RANGE - 1, "heading", "0-99, + or -")?),
            },
            "tilt-steer" => {
                let v = argument(&mut words, "tilt-steer", "on or off")?;
                Self::TiltSteer(switch(v, "tilt-steer")?)
            }
            "heartbeat" => {
                let v = argument(&mut words, "heartbeat", "on or off")?;
                Self::Heartbeat(switch(v, "heartbeat")?)
            }
            "foreground" => {
                let v = argument(&mut words, "foreground", "on or off")?;
                Self::Foreground(switch(v, "foreground")?)
            }
            "tilt" => {
                let fwd = argument(&mut words, "tilt", "forward/back and steer tilt")?;
                let steer = argument(&mut words, "tilt", "forward/back and steer tilt")?;
                Self::Tilt {
                    forward_back_g: g_value(fwd, "tilt")?,
                    steer_g: g_value(steer, "tilt")?,
                }
            }
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// Everything the operator sees, rebuilt from the event stream.
#[derive(Debug, Default)]
pub struct Dashboard {
    link_state: LinkState,
    status: Option<StatusMessage>,
    telemetry: Option<TelemetrySample>,
    output: Option<ControlOutput>,
}

impl Dashboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns the status message to show, if any.
    pub fn apply(&mut self, event: AppEvent) -> Option<&StatusMessage> {
        match event {
            AppEvent::LinkState(state) => {
                // A stale speed must never outlive the link it came from
                self.telemetry = None;
                self.link_state = state;
                None
            }
            AppEvent::Telemetry(sample) => {
                self.telemetry = Some(sample);
                None
            }
            AppEvent::LogMessage(msg) => {
                self.status = Some(msg);
                self.status.as_ref()
            }
        }
    }

    pub fn set_output(&mut self, output: ControlOutput) {
        self.output = Some(output);
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn rpm_text(&self) -> String {
        match self.telemetry {
            Some(t) if t.rpm > 0.0 => format!("{:.0}", t.rpm),
            _ => "---".to_string(),
        }
    }

    pub fn voltage_text(&self) -> String {
        match self.telemetry {
            Some(t) => format!("{:.1} V", t.battery_voltage),
            None => "---".to_string(),
        }
    }

    pub fn render(&self, settings: &ControlSettings) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Link:      {}", self.link_state);
        if let Some(status) = &self.status {
            let _ = writeln!(out, "Status:    {}", format_status(status));
        }
        let _ = writeln!(
            out,
            "RPM:       {}    Battery: {}",
            self.rpm_text(),
            self.voltage_text()
        );
        let _ = writeln!(
            out,
            "Trim:      {:.0}  Fine: {:+.3}  Throttle: {}  Heading: {}",
            settings.trim_fraction() * SLIDER_MAX as f32,
            settings.fine_trim_fraction(),
            settings.throttle(),
            settings.heading_offset()
        );
        let _ = writeln!(
            out,
            "Tilt steer: {}  Heartbeat: {}  Foreground: {}",
            on_off(settings.tilt_steer_enabled()),
            on_off(settings.heartbeat_enabled()),
            on_off(settings.foreground())
        );
        match &self.output {
            Some(o) => {
                let _ = write!(
                    out,
                    "Radius:    {:.3} cm  Direction: {}  Heartbeat: {}{}",
                    o.radius,
                    o.direction,
                    o.heartbeat,
                    if o.connected { "" } else { "  (not connected)" }
                );
            }
            None => {
                let _ = write!(out, "Radius:    ---");
            }
        }
        out
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn format_status(msg: &StatusMessage) -> String {
    let tag = match msg.severity {
        MessageSeverity::Info => "info",
        MessageSeverity::Success => "ok",
        MessageSeverity::Warning => "warn",
        MessageSeverity::Error => "error",
    };
    format!("[{}] {}", tag, msg.message)
}
