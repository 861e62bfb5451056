//! Controller core
//!
//! A [`Controller`] serves one instance lifetime: it multiplexes input from
//! every registered client, runs each request as an independent dispatch unit
//! and stops once a command raises a [`ControlSignal`]. The host then either
//! builds a fresh instance (restart) or exits (shutdown).

pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use dispatch::{Command, CommandPolicy, Dispatched, Dispatcher};
pub use error::{ControllerError, DispatchError, RegistryError, Result, TransportError};
pub use lifecycle::{Lifecycle, LifecycleState, Outcome, TeardownReport};
pub use message::{ControlSignal, Inbound, Params, Reply, Request};
pub use registry::{ClientId, ClientRegistry, RegisteredClient};
pub use watch::{DeliveryReport, Signaller, WatchEvent, WatchMultiplexer};

use crate::interface::Interface;
use crate::provider::Provider;

/// Per-instance settings
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Command enablement
    pub policy: CommandPolicy,
    /// Upper bound for each teardown step
    pub shutdown_timeout: Duration,
    /// File served by the `motd` command
    pub motd_file: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: CommandPolicy::default(),
            shutdown_timeout: Duration::from_secs(5),
            motd_file: None,
        }
    }
}

/// One controller instance
pub struct Controller<P> {
    dispatcher: Dispatcher<P>,
    registry: ClientRegistry,
    lifecycle: Lifecycle,
    shutdown_timeout: Duration,
}

impl<P: Provider> Controller<P> {
    /// Build an instance around a registry shared with the transports
    pub fn new(settings: ControllerSettings, registry: ClientRegistry, provider: P) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(provider)),
            settings.policy,
            settings.motd_file,
        );
        Self {
            dispatcher,
            registry,
            lifecycle: Lifecycle::new(),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Serve until a control signal, then tear down.
    ///
    /// The instance stops starting watches as soon as a handler raises a
    /// signal; in-flight units then get `shutdown_timeout` to deliver their
    /// replies. On a fatal multiplexer error teardown is still attempted
    /// before the error is returned.
    pub async fn start(mut self, mut interfaces: Vec<Box<dyn Interface>>) -> Result<Outcome> {
        info!(
            interfaces = interfaces.len(),
            clients = self.registry.len(),
            disabled = ?self.dispatcher.policy().disabled().collect::<Vec<_>>(),
            "controller started"
        );

        let mut watches = WatchMultiplexer::new(self.registry.clone());
        let served = match self.serve(&mut watches).await {
            Ok(()) => self.drain(&mut watches).await,
            Err(error) => Err(error),
        };
        drop(watches);

        let report = lifecycle::teardown(
            self.dispatcher.provider(),
            &mut interfaces,
            &self.registry,
            self.shutdown_timeout,
        )
        .await;
        if !report.is_clean() {
            warn!(?report, "teardown was not clean");
        }

        match served {
            Ok(()) => {
                let outcome = self.lifecycle.complete()?;
                info!(outcome = %outcome, "controller stopped");
                Ok(outcome)
            }
            Err(error) => {
                error!(error = %error, "controller failed");
                Err(error)
            }
        }
    }

    async fn serve(&mut self, watches: &mut WatchMultiplexer) -> Result<()> {
        let mut round: u64 = 0;
        while self.lifecycle.is_running() {
            round += 1;
            let reconciled = watches.reconcile().await?;
            debug!(round, watching = reconciled.watching, "round started");

            for event in watches.wait().await? {
                match event {
                    WatchEvent::Changed => {
                        self.registry.reset_changed();
                    }
                    WatchEvent::Input { client, inbound } => {
                        self.spawn_unit(watches, client, inbound);
                    }
                    WatchEvent::Signalled { client, signal } => {
                        info!(client = %client, signal = %signal, "control signal raised");
                        self.lifecycle.observe(signal)?;
                    }
                    WatchEvent::Delivered(report) => {
                        debug!(client = %report.client, command = %report.command, "reply delivered");
                    }
                }
            }
        }
        Ok(())
    }

    async fn drain(&mut self, watches: &mut WatchMultiplexer) -> Result<()> {
        info!(
            state = ?self.lifecycle.state(),
            in_flight = watches.in_flight_len(),
            "draining"
        );
        for event in watches.drain(self.shutdown_timeout).await? {
            if let WatchEvent::Signalled { client, signal } = event {
                info!(client = %client, signal = %signal, "control signal raised while draining");
                self.lifecycle.observe(signal)?;
            }
        }
        Ok(())
    }

    fn spawn_unit(&self, watches: &mut WatchMultiplexer, client: RegisteredClient, inbound: Inbound) {
        let dispatcher = self.dispatcher.clone();
        let id = client.id;
        watches.track_dispatch(id, move |signaller| async move {
            let (command, reply) = match inbound {
                Inbound::Request(request) => {
                    let command = request.command.clone();
                    debug!(client = %id, command = %command, "dispatching");
                    let (reply, signal) = dispatcher.dispatch(request).await.into_parts();
                    if let Some(signal) = signal {
                        signaller.raise(signal);
                    }
                    (command, reply)
                }
                Inbound::Malformed { reason } => {
                    warn!(client = %id, reason = %reason, "malformed input from client");
                    (String::new(), Dispatcher::<P>::malformed(&reason))
                }
                Inbound::Closed => {
                    return DeliveryReport {
                        client: id,
                        command: String::new(),
                        delivered: Err(TransportError::Closed),
                    };
                }
            };
            let delivered = client.handle.send_reply(reply).await;
            DeliveryReport {
                client: id,
                command,
                delivered,
            }
        });
    }
}
