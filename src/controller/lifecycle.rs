//! Controller lifecycle and teardown
//!
//! `Running → Draining(signal) → Restarting | ShuttingDown`. Teardown releases
//! the provider, then each interface, then any handle still registered. Every
//! step is bounded by a timeout and a failing step never stops the next one.

use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ControllerError, Result};
use super::message::ControlSignal;
use super::registry::ClientRegistry;
use crate::interface::Interface;
use crate::provider::Provider;

/// Where a controller instance is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Serving requests
    Running,
    /// A signal was observed; watches are cancelled and in-flight work drains
    Draining(ControlSignal),
    /// Torn down; the host starts a fresh instance
    Restarting,
    /// Torn down; the host exits
    ShuttingDown,
}

/// What the host should do once the controller returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Start a fresh controller instance
    Restart,
    /// Exit the process
    Shutdown,
}

impl From<ControlSignal> for Outcome {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Restart => Outcome::Restart,
            ControlSignal::Shutdown => Outcome::Shutdown,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Restart => "restart",
            Outcome::Shutdown => "shutdown",
        })
    }
}

/// State machine consuming control signals
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A running instance
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Running,
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether requests are still being served
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Record a control signal; signals seen while draining are merged
    pub fn observe(&mut self, signal: ControlSignal) -> Result<()> {
        self.state = match self.state {
            LifecycleState::Running => LifecycleState::Draining(signal),
            LifecycleState::Draining(pending) => LifecycleState::Draining(pending.merge(signal)),
            terminal => {
                return Err(ControllerError::Lifecycle(format!(
                    "{} observed after the instance reached {:?}",
                    signal, terminal
                )));
            }
        };
        debug!(state = ?self.state, "lifecycle advanced");
        Ok(())
    }

    /// Leave the draining state once teardown is done
    pub fn complete(&mut self) -> Result<Outcome> {
        let LifecycleState::Draining(signal) = self.state else {
            return Err(ControllerError::Lifecycle(format!(
                "cannot complete from {:?}",
                self.state
            )));
        };
        self.state = match signal {
            ControlSignal::Restart => LifecycleState::Restarting,
            ControlSignal::Shutdown => LifecycleState::ShuttingDown,
        };
        Ok(Outcome::from(signal))
    }
}

/// What teardown managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The provider shut down cleanly
    pub provider_closed: bool,
    /// Interfaces that shut down cleanly
    pub interfaces_closed: usize,
    /// Leftover handles closed directly
    pub handles_closed: usize,
    /// Steps that returned an error
    pub failures: usize,
    /// Steps that ran out of time
    pub timeouts: usize,
}

impl TeardownReport {
    /// Whether every step succeeded in time
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.timeouts == 0
    }
}

/// Release the provider, the interfaces and leftover handles, in that order
pub async fn teardown<P: Provider>(
    provider: &Mutex<P>,
    interfaces: &mut [Box<dyn Interface>],
    registry: &ClientRegistry,
    limit: Duration,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    let closing = async {
        let mut provider = provider.lock().await;
        let name = provider.name().to_string();
        (name, provider.shutdown().await)
    };
    match timeout(limit, closing).await {
        Ok((name, Ok(()))) => {
            debug!(provider = %name, "provider shut down");
            report.provider_closed = true;
        }
        Ok((name, Err(error))) => {
            warn!(provider = %name, error = %error, "provider shutdown failed");
            report.failures += 1;
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "provider shutdown timed out");
            report.timeouts += 1;
        }
    }

    for interface in interfaces.iter_mut() {
        let name = interface.name().to_string();
        match timeout(limit, interface.shutdown()).await {
            Ok(Ok(())) => {
                debug!(interface = %name, "interface shut down");
                report.interfaces_closed += 1;
            }
            Ok(Err(error)) => {
                warn!(interface = %name, error = %error, "interface shutdown failed");
                report.failures += 1;
            }
            Err(_) => {
                warn!(interface = %name, timeout_ms = limit.as_millis() as u64, "interface shutdown timed out");
                report.timeouts += 1;
            }
        }
    }

    for client in registry.clear() {
        match timeout(limit, client.handle.close()).await {
            Ok(()) => report.handles_closed += 1,
            Err(_) => {
                warn!(client = %client.id, label = client.handle.label(), "closing client timed out");
                report.timeouts += 1;
            }
        }
    }

    info!(
        provider_closed = report.provider_closed,
        interfaces_closed = report.interfaces_closed,
        handles_closed = report.handles_closed,
        failures = report.failures,
        timeouts = report.timeouts,
        "teardown finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::error::TransportError;
    use crate::provider::{MemoryProvider, ProviderResult};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signals_drive_the_state_machine() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.is_running());
        lifecycle.observe(ControlSignal::Restart).unwrap();
        lifecycle.observe(ControlSignal::Shutdown).unwrap();
        lifecycle.observe(ControlSignal::Restart).unwrap();
        assert_eq!(
            lifecycle.state(),
            LifecycleState::Draining(ControlSignal::Shutdown)
        );
        assert_eq!(lifecycle.complete().unwrap(), Outcome::Shutdown);
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.complete(),
            Err(ControllerError::Lifecycle(_))
        ));
        lifecycle.observe(ControlSignal::Restart).unwrap();
        assert_eq!(lifecycle.complete().unwrap(), Outcome::Restart);
        assert!(lifecycle.observe(ControlSignal::Shutdown).is_err());
        assert!(lifecycle.complete().is_err());
    }

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
        hang: bool,
    }

    impl Interface for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn shutdown(&mut self) -> BoxFuture<'_, std::result::Result<(), TransportError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            let hang = self.hang;
            async move {
                if hang {
                    futures::future::pending::<()>().await;
                }
                if fail {
                    Err(TransportError::Task("listener already gone".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    struct Stubborn;

    impl Provider for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn shutdown(&mut self) -> ProviderResult<()> {
            Err(crate::provider::ProviderError::Unavailable)
        }
    }

    fn counting(name: &'static str, calls: &Arc<AtomicUsize>, fail: bool, hang: bool) -> Box<dyn Interface> {
        Box::new(Counting {
            name,
            calls: Arc::clone(calls),
            fail,
            hang,
        })
    }

    #[tokio::test]
    async fn every_step_runs_once_despite_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut interfaces = vec![
            counting("broken", &calls, true, false),
            counting("stuck", &calls, false, true),
            counting("fine", &calls, false, false),
        ];
        let provider = Mutex::new(Stubborn);
        let registry = ClientRegistry::new();

        let report = teardown(
            &provider,
            &mut interfaces,
            &registry,
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!report.provider_closed);
        assert_eq!(report.interfaces_closed, 1);
        assert_eq!(report.failures, 2);
        assert_eq!(report.timeouts, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn clean_teardown_closes_the_provider() {
        let provider = Mutex::new(MemoryProvider::with_toy_data());
        let report = teardown(
            &provider,
            &mut [],
            &ClientRegistry::new(),
            Duration::from_secs(1),
        )
        .await;
        assert!(report.is_clean());
        assert!(report.provider_closed);
        assert!(provider.lock().await.is_closed());
    }
}
