//! Bluetooth Service Module
//!
//! Runs the link state machine on its own task. Every request, timer
//! expiry and transport callback is funnelled through one channel, so
//! link state is only ever mutated from this task.

use crate::domain::control::FrameSink;
use crate::domain::error::{LinkError, TransportError};
use crate::domain::models::{AppEvent, LinkState, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::link::{LinkEvent, LinkStateMachine, Timer};
use crate::infrastructure::bluetooth::protocol::ConfigFrame;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Sender handed to a transport so its callbacks land on the link task.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl TransportEventSender {
    pub fn send(&self, event: TransportEvent) {
        let _ = self.sender.send(LinkEvent::Transport(event));
    }
}

/// Cheap cloneable handle used by the control loop and the console.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn scan(&self) {
        let _ = self.commands.send(LinkEvent::Scan);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(LinkEvent::Disconnect);
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

impl FrameSink for LinkHandle {
    fn is_connected(&self) -> bool {
        self.state().is_ready()
    }

    fn send(&self, frame: ConfigFrame) {
        let _ = self.commands.send(LinkEvent::Send(frame));
    }
}

/// Main Bluetooth service driving the link state machine
pub struct LinkService<T: GattTransport> {
    machine: LinkStateMachine<T>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    state_tx: watch::Sender<LinkState>,
    app_events: mpsc::UnboundedSender<AppEvent>,
}

impl<T: GattTransport> LinkService<T> {
    /// Create the service. `build_transport` receives the sender its
    /// callbacks must use; failing to build it disables the link.
    pub fn new<F>(
        build_transport: F,
        config: ConnectionConfig,
        app_events: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<(Self, LinkHandle), LinkError>
    where
        F: FnOnce(TransportEventSender) -> Result<T, TransportError>,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = build_transport(TransportEventSender {
            sender: events_tx.clone(),
        })
        .map_err(|e| match e {
            TransportError::AdapterUnavailable(reason) => LinkError::TransportUnavailable(reason),
            other => LinkError::TransportUnavailable(other.to_string()),
        })?;

        let machine = LinkStateMachine::new(transport, config, app_events.clone());
        let (state_tx, state_rx) = watch::channel(machine.state());

        let handle = LinkHandle {
            commands: events_tx.clone(),
            state: state_rx,
        };

        Ok((
            Self {
                machine,
                events_tx,
                events_rx,
                state_tx,
                app_events,
            },
            handle,
        ))
    }

    /// Process link events until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Link service started");
        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match event {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }

        if self.machine.state() != LinkState::Idle {
            self.machine.disconnect();
        }
        info!("Link service stopped");
    }

    fn dispatch(&mut self, event: LinkEvent) {
        match self.machine.handle(event) {
            Ok(Some(timer)) => self.arm(timer),
            Ok(None) => {}
            Err(e) => self.report(e),
        }

        let current = self.machine.state();
        self.state_tx.send_if_modified(|state| {
            if *state != current {
                *state = current;
                true
            } else {
                false
            }
        });
    }

    fn arm(&self, timer: Timer) {
        debug!("Arming {:?} in {:?}", timer.event, timer.after);
        let sender = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer.after).await;
            let _ = sender.send(LinkEvent::Timer(timer.event));
        });
    }

    fn report(&self, e: LinkError) {
        let severity = e.severity();
        match severity {
            MessageSeverity::Error => error!("{}", e),
            _ => warn!("{}", e),
        }
        let _ = self
            .app_events
            .send(AppEvent::LogMessage(StatusMessage::new(e.to_string(), severity)));
    }
}
