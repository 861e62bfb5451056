//! Watch multiplexer: one outstanding read per registered client
//!
//! Each round the multiplexer reconciles its watch set against the registry,
//! waits for the first of {any client input, any finished dispatch unit, the
//! registry's changed signal}, then drains everything else that is already
//! ready before handing the batch to the controller.
//!
//! A client whose request is being dispatched is *busy* and gets no new watch
//! until its reply has been delivered, which gives per-client FIFO ordering.
//!
//! Control signals travel on their own channel: a dispatch unit raises its
//! signal through a [`Signaller`] as soon as the handler returns, before the
//! acknowledgement is delivered, so a slow client cannot hold the instance open.

use std::collections::{HashMap, HashSet};
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use super::error::{ControllerError, Result, TransportError};
use super::message::{ControlSignal, Inbound};
use super::registry::{ClientId, ClientRegistry, RegisteredClient};

/// Outcome of one dispatch unit (dispatch + reply delivery)
#[derive(Debug)]
pub struct DeliveryReport {
    /// Client the reply was addressed to
    pub client: ClientId,
    /// Command that was dispatched
    pub command: String,
    /// Whether the transport accepted the reply
    pub delivered: std::result::Result<(), TransportError>,
}

/// Something the multiplexer observed during a round
#[derive(Debug)]
pub enum WatchEvent {
    /// Registry membership changed; the next round reconciles
    Changed,
    /// A client produced input (a request or malformed data)
    Input {
        /// The originating client
        client: RegisteredClient,
        /// What it sent
        inbound: Inbound,
    },
    /// A handler raised a control signal; its acknowledgement may still be
    /// on the way
    Signalled {
        /// Client whose command raised the signal
        client: ClientId,
        /// The signal
        signal: ControlSignal,
    },
    /// A dispatch unit finished
    Delivered(DeliveryReport),
}

/// Raises control signals on behalf of one dispatch unit
#[derive(Debug, Clone)]
pub struct Signaller {
    client: ClientId,
    tx: mpsc::UnboundedSender<(ClientId, ControlSignal)>,
}

impl Signaller {
    /// Hand `signal` to the multiplexer without waiting for delivery
    pub fn raise(&self, signal: ControlSignal) {
        if self.tx.send((self.client, signal)).is_err() {
            debug!(client = %self.client, signal = %signal, "multiplexer gone; signal dropped");
        }
    }
}

/// Summary of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Watches cancelled because their client left
    pub cancelled: usize,
    /// Watches started for idle clients
    pub started: usize,
    /// Watches outstanding after the pass
    pub watching: usize,
}

struct PendingWatch {
    client: RegisteredClient,
    task: JoinHandle<Inbound>,
}

impl PendingWatch {
    fn start(client: RegisteredClient) -> Self {
        let handle = Arc::clone(&client.handle);
        let task = tokio::spawn(async move { handle.next_request().await });
        Self { client, task }
    }
}

enum FirstReady {
    Watch(usize, std::result::Result<Inbound, JoinError>),
    Delivery(std::result::Result<(Id, DeliveryReport), JoinError>),
    Signal(ClientId, ControlSignal),
    Changed,
}

/// Multiplexes input from a changing set of client handles
pub struct WatchMultiplexer {
    registry: ClientRegistry,
    pending: Vec<PendingWatch>,
    in_flight: JoinSet<DeliveryReport>,
    dispatching: HashMap<Id, ClientId>,
    busy: HashSet<ClientId>,
    closed: HashSet<ClientId>,
    signal_tx: mpsc::UnboundedSender<(ClientId, ControlSignal)>,
    signal_rx: mpsc::UnboundedReceiver<(ClientId, ControlSignal)>,
}

impl WatchMultiplexer {
    /// Create a multiplexer reading from `registry`
    pub fn new(registry: ClientRegistry) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            pending: Vec::new(),
            in_flight: JoinSet::new(),
            dispatching: HashMap::new(),
            busy: HashSet::new(),
            closed: HashSet::new(),
            signal_tx,
            signal_rx,
        }
    }

    /// Number of outstanding watches
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of dispatch units not yet finished
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a watch is outstanding for the client
    pub fn is_watching(&self, client: ClientId) -> bool {
        self.pending.iter().any(|w| w.client.id == client)
    }

    /// Bring the watch set in line with the registry.
    ///
    /// Watches of deregistered clients are cancelled and the cancellation is
    /// awaited before any new watch starts.
    pub async fn reconcile(&mut self) -> Result<Reconciled> {
        let members = self.registry.snapshot();
        let registered: HashSet<ClientId> = members.iter().map(|c| c.id).collect();

        let (keep, stale): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|w| registered.contains(&w.client.id));
        self.pending = keep;

        let cancelled = stale.len();
        for watch in stale {
            cancel_watch(watch).await;
        }
        self.closed.retain(|id| registered.contains(id));

        let mut started = 0;
        for client in members {
            if self.busy.contains(&client.id)
                || self.closed.contains(&client.id)
                || self.is_watching(client.id)
            {
                continue;
            }
            self.pending.push(PendingWatch::start(client));
            started += 1;
        }

        self.check_invariants()?;

        debug!(
            cancelled,
            started,
            watching = self.pending.len(),
            in_flight = self.in_flight.len(),
            "watch set reconciled"
        );

        Ok(Reconciled {
            cancelled,
            started,
            watching: self.pending.len(),
        })
    }

    fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for watch in &self.pending {
            if !seen.insert(watch.client.id) {
                return Err(ControllerError::Invariant(format!(
                    "client {} has more than one outstanding watch",
                    watch.client.id
                )));
            }
            if self.busy.contains(&watch.client.id) {
                return Err(ControllerError::Invariant(format!(
                    "client {} is watched while its dispatch is in flight",
                    watch.client.id
                )));
            }
        }
        Ok(())
    }

    /// Wait until something is ready, then drain everything that is.
    pub async fn wait(&mut self) -> Result<Vec<WatchEvent>> {
        let mut events = Vec::new();

        let first = tokio::select! {
            (index, result) = next_completed(&mut self.pending) => FirstReady::Watch(index, result),
            Some(joined) = self.in_flight.join_next_with_id() => FirstReady::Delivery(joined),
            Some((client, signal)) = self.signal_rx.recv() => FirstReady::Signal(client, signal),
            () = self.registry.changed() => FirstReady::Changed,
        };

        match first {
            FirstReady::Watch(index, result) => {
                let watch = self.pending.swap_remove(index);
                self.accept_watch(watch.client, result, &mut events);
            }
            FirstReady::Delivery(joined) => {
                if let Some(report) = self.accept_delivery(joined)? {
                    events.push(WatchEvent::Delivered(report));
                }
            }
            FirstReady::Signal(client, signal) => {
                events.push(WatchEvent::Signalled { client, signal });
            }
            FirstReady::Changed => {}
        }

        while let Ok((client, signal)) = self.signal_rx.try_recv() {
            events.push(WatchEvent::Signalled { client, signal });
        }

        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].task.is_finished() {
                let watch = self.pending.swap_remove(index);
                let result = watch.task.await;
                self.accept_watch(watch.client, result, &mut events);
            } else {
                index += 1;
            }
        }

        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            if let Some(report) = self.accept_delivery(joined)? {
                events.push(WatchEvent::Delivered(report));
            }
        }

        if self.registry.is_changed() {
            events.insert(0, WatchEvent::Changed);
        }

        Ok(events)
    }

    fn accept_watch(
        &mut self,
        client: RegisteredClient,
        result: std::result::Result<Inbound, JoinError>,
        events: &mut Vec<WatchEvent>,
    ) {
        match result {
            Ok(Inbound::Closed) => {
                debug!(client = %client.id, label = client.handle.label(), "client closed");
                self.closed.insert(client.id);
            }
            Ok(inbound) => {
                if !self.registry.contains(client.id) {
                    warn!(
                        client = %client.id,
                        label = client.handle.label(),
                        "discarding input from deregistered client"
                    );
                    return;
                }
                self.busy.insert(client.id);
                events.push(WatchEvent::Input { client, inbound });
            }
            Err(error) => {
                warn!(
                    client = %client.id,
                    label = client.handle.label(),
                    error = %error,
                    "client watch failed; no longer watching client"
                );
                self.closed.insert(client.id);
            }
        }
    }

    fn accept_delivery(
        &mut self,
        joined: std::result::Result<(Id, DeliveryReport), JoinError>,
    ) -> Result<Option<DeliveryReport>> {
        match joined {
            Ok((task, report)) => {
                self.dispatching.remove(&task);
                self.busy.remove(&report.client);
                if let Err(error) = &report.delivered {
                    warn!(
                        client = %report.client,
                        command = %report.command,
                        error = %error,
                        "reply delivery failed"
                    );
                    self.closed.insert(report.client);
                }
                Ok(Some(report))
            }
            Err(join_error) => {
                let client = self.dispatching.remove(&join_error.id()).ok_or_else(|| {
                    ControllerError::Invariant(format!(
                        "finished dispatch unit {} was never tracked",
                        join_error.id()
                    ))
                })?;
                self.busy.remove(&client);
                self.closed.insert(client);
                if join_error.is_cancelled() {
                    warn!(client = %client, "dispatch unit aborted; reply not delivered");
                } else {
                    error!(client = %client, error = %join_error, "dispatch unit failed");
                }
                Ok(None)
            }
        }
    }

    /// Run a dispatch unit for `client`; the client stays busy until it ends.
    ///
    /// `unit` receives a [`Signaller`] for raising control signals ahead of
    /// its reply delivery.
    pub fn track_dispatch<F, Fut>(&mut self, client: ClientId, unit: F)
    where
        F: FnOnce(Signaller) -> Fut,
        Fut: Future<Output = DeliveryReport> + Send + 'static,
    {
        let signaller = Signaller {
            client,
            tx: self.signal_tx.clone(),
        };
        self.busy.insert(client);
        let task = self.in_flight.spawn(unit(signaller));
        self.dispatching.insert(task.id(), client);
    }

    /// Cancel every watch and let in-flight dispatch units finish.
    ///
    /// Units still running after `limit` are aborted; their clients are
    /// marked closed. Signals raised meanwhile are returned alongside the
    /// deliveries.
    pub async fn drain(&mut self, limit: Duration) -> Result<Vec<WatchEvent>> {
        let watches: Vec<_> = self.pending.drain(..).collect();
        for watch in watches {
            cancel_watch(watch).await;
        }

        let deadline = Instant::now() + limit;
        let mut events = Vec::new();
        loop {
            match timeout_at(deadline, self.in_flight.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    if let Some(report) = self.accept_delivery(joined)? {
                        events.push(WatchEvent::Delivered(report));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        in_flight = self.in_flight.len(),
                        timeout_ms = limit.as_millis() as u64,
                        "aborting dispatch units that did not finish in time"
                    );
                    self.in_flight.abort_all();
                    while let Some(joined) = self.in_flight.join_next_with_id().await {
                        if let Some(report) = self.accept_delivery(joined)? {
                            events.push(WatchEvent::Delivered(report));
                        }
                    }
                    break;
                }
            }
        }

        while let Ok((client, signal)) = self.signal_rx.try_recv() {
            events.push(WatchEvent::Signalled { client, signal });
        }
        Ok(events)
    }
}

impl Drop for WatchMultiplexer {
    fn drop(&mut self) {
        for watch in &self.pending {
            watch.task.abort();
        }
    }
}

async fn cancel_watch(watch: PendingWatch) {
    watch.task.abort();
    match watch.task.await {
        Err(error) if error.is_cancelled() => {
            debug!(client = %watch.client.id, "watch cancelled");
        }
        Ok(_) => {
            warn!(
                client = %watch.client.id,
                label = watch.client.handle.label(),
                "discarding input that completed after deregistration"
            );
        }
        Err(error) => {
            warn!(client = %watch.client.id, error = %error, "watch failed while cancelling");
        }
    }
}

fn next_completed(
    pending: &mut [PendingWatch],
) -> impl Future<Output = (usize, std::result::Result<Inbound, JoinError>)> + '_ {
    poll_fn(move |cx| {
        for (index, watch) in pending.iter_mut().enumerate() {
            if let Poll::Ready(result) = Pin::new(&mut watch.task).poll(cx) {
                return Poll::Ready((index, result));
            }
        }
        Poll::Pending
    })
}
