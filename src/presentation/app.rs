use crate::domain::control::{ControlOutput, ControlSettings};
use crate::domain::models::AppEvent;
use crate::infrastructure::bluetooth::LinkHandle;
use crate::infrastructure::sensor::SampleFeed;
use crate::presentation::console::{format_status, Dashboard, UserCommand, HELP};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct ConsoleApp {
    // Services
    settings: Arc<Mutex<ControlSettings>>,
    link: LinkHandle,
    sensor: SampleFeed,

    // Event streams
    app_events: mpsc::UnboundedReceiver<AppEvent>,
    outputs: watch::Receiver<Option<ControlOutput>>,

    // State
    dashboard: Dashboard,
}

impl ConsoleApp {
    pub fn new(
        settings: Arc<Mutex<ControlSettings>>,
        link: LinkHandle,
        sensor: SampleFeed,
        app_events: mpsc::UnboundedReceiver<AppEvent>,
        outputs: watch::Receiver<Option<ControlOutput>>,
    ) -> Self {
        Self {
            settings,
            link,
            sensor,
            app_events,
            outputs,
            dashboard: Dashboard::new(),
        }
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    fn with_settings<R>(&self, f: impl FnOnce(&mut ControlSettings) -> R) -> R {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings)
    }

    /// Apply one operator command. Returns `false` when the operator quits.
    pub fn execute(&mut self, command: UserCommand) -> bool {
        debug!("Command: {:?}", command);
        match command {
            UserCommand::Scan => self.link.scan(),
            UserCommand::Disconnect => self.link.disconnect(),
            UserCommand::Trim(position) => self.with_settings(|s| s.set_trim_slider(position)),
            UserCommand::FineTrim(position) => {
                self.with_settings(|s| s.set_fine_trim_slider(position))
            }
            UserCommand::Throttle(throttle) => self.with_settings(|s| s.set_throttle(throttle)),
            UserCommand::Heading(heading) => {
                self.with_settings(|s| s.set_heading_offset(heading))
            }
            UserCommand::HeadingUp => self.with_settings(|s| s.increment_heading()),
            UserCommand::HeadingDown => self.with_settings(|s| s.decrement_heading()),
            UserCommand::TiltSteer(on) => self.with_settings(|s| s.set_tilt_steer(on)),
            UserCommand::Heartbeat(on) => self.with_settings(|s| s.set_heartbeat_enabled(on)),
            UserCommand::Foreground(on) => self.with_settings(|s| s.set_foreground(on)),
            UserCommand::Tilt {
                forward_back_g,
                steer_g,
            } => self.sensor.publish_tilt(forward_back_g, steer_g),
            UserCommand::Status => println!("{}", self.render()),
            UserCommand::Help => println!("{}", HELP),
            UserCommand::Quit => return false,
        }
        true
    }

    /// Fold pending events into the dashboard without blocking.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.app_events.try_recv() {
            self.on_event(event);
        }
    }

    fn on_event(&mut self, event: AppEvent) {
        if let Some(status) = self.dashboard.apply(event) {
            println!("{}", format_status(status));
        }
    }

    fn render(&mut self) -> String {
        if let Some(output) = *self.outputs.borrow_and_update() {
            self.dashboard.set_output(output);
        }
        let settings = self.with_settings(|s| *s);
        self.dashboard.render(&settings)
    }

    /// Read commands line by line until `quit` or end of input.
    pub async fn run<R>(mut self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        println!("{}", HELP);
        let mut lines = input.lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(event) = self.app_events.recv() => {
                    self.on_event(event);
                    continue;
                }
            };

            let Some(line) = line else {
                info!("Console input closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<UserCommand>() {
                Ok(command) => {
                    if !self.execute(command) {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }

        self.drain_events();
        Ok(())
    }
}
