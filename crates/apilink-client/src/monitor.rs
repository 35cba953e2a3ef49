//! Connectivity monitor: the single writer of connectivity state and of the
//! degraded flag.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use apilink_core::{
    Clock, ConnectivityMachine, ConnectivityState, DegradedDirective, ErrorClass, EventBus,
    EventBusError, LinkEvent, LinkStatus, ProbeOutcome, Transition, next_event,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{degraded::DegradedFlag, probe::ReachabilityProbe};

/// Read-only view of the monitor's state for other collaborators.
#[derive(Clone)]
pub struct ConnectivityHandle {
    machine: Arc<Mutex<ConnectivityMachine>>,
}

impl ConnectivityHandle {
    pub fn state(&self) -> ConnectivityState {
        lock_machine(&self.machine).state()
    }

    pub fn status(&self) -> LinkStatus {
        lock_machine(&self.machine).status()
    }
}

pub struct ConnectivityMonitor<P> {
    machine: Arc<Mutex<ConnectivityMachine>>,
    probe: P,
    events: EventBus,
    degraded: DegradedFlag,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl<P: ReachabilityProbe> ConnectivityMonitor<P> {
    pub fn new(
        probe: P,
        events: EventBus,
        degraded: DegradedFlag,
        clock: Arc<dyn Clock>,
        interval: Duration,
        unreachable_threshold: u32,
    ) -> Self {
        let machine = ConnectivityMachine::new(unreachable_threshold).with_degraded(degraded.is_set());
        Self {
            machine: Arc::new(Mutex::new(machine)),
            probe,
            events,
            degraded,
            clock,
            interval,
        }
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            machine: self.machine.clone(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        lock_machine(&self.machine).state()
    }

    pub fn status(&self) -> LinkStatus {
        lock_machine(&self.machine).status()
    }

    pub fn degraded(&self) -> &DegradedFlag {
        &self.degraded
    }

    /// Host reported the network went away.
    pub fn handle_offline(&self) {
        let now = self.clock.now_ms();
        self.update(|machine| machine.on_offline(now));
    }

    /// Host reported the network is back; probes immediately.
    pub async fn handle_online(&self) -> LinkStatus {
        let now = self.clock.now_ms();
        self.update(|machine| machine.on_online(now));
        self.probe_now().await
    }

    /// Run one probe and apply its result.
    pub async fn probe_now(&self) -> LinkStatus {
        let outcome = self.probe.probe().await;
        self.record(outcome)
    }

    /// Apply an observation made elsewhere (a probe or a failed request).
    pub fn record(&self, outcome: ProbeOutcome) -> LinkStatus {
        let now = self.clock.now_ms();
        self.update(|machine| machine.on_probe(outcome, now))
    }

    /// A request terminally failed with `class`; counts as a failed observation.
    pub fn report_failure(&self, class: ErrorClass) -> LinkStatus {
        self.record(ProbeOutcome::Failed(class))
    }

    fn update<F>(&self, step: F) -> LinkStatus
    where
        F: FnOnce(&mut ConnectivityMachine) -> Transition,
    {
        let mut machine = lock_machine(&self.machine);
        let transition = step(&mut machine);
        self.apply(transition);
        machine.status()
    }

    // Runs under the machine lock so published events keep transition order.
    fn apply(&self, transition: Transition) {
        match transition.degraded {
            Some(DegradedDirective::Enter) => {
                info!("entering degraded mode");
                self.degraded.set(self.clock.now_ms());
            }
            Some(DegradedDirective::Exit) => {
                info!("leaving degraded mode");
                self.degraded.clear();
            }
            None => {}
        }
        for notice in transition.notices() {
            info!(?notice, "connectivity notice");
        }
        for event in transition.events {
            self.events.emit(event);
        }
    }

    /// Start periodic probing and failure intake from the event bus.
    ///
    /// The task stops when the returned [`MonitorTask`] is shut down or
    /// dropped; probe results that land after that are discarded.
    pub fn spawn(self: Arc<Self>) -> MonitorTask {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let mut stream = self.events.subscribe();
        let monitor = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut listening = true;
            debug!(interval_ms = monitor.interval.as_millis() as u64, "connectivity monitor started");

            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => {
                        if !monitor.state().browser_online {
                            debug!("host offline; skipping periodic probe");
                            continue;
                        }
                        // Runs detached so shutdown never aborts a request
                        // mid-flight; a late result is dropped instead.
                        let probe_task = tokio::spawn({
                            let monitor = monitor.clone();
                            let stop = stop_child.clone();
                            async move {
                                let outcome = monitor.probe.probe().await;
                                if stop.is_cancelled() {
                                    debug!(?outcome, "discarding probe result after shutdown");
                                } else {
                                    monitor.record(outcome);
                                }
                            }
                        });
                        tokio::select! {
                            _ = stop_child.cancelled() => break,
                            _ = probe_task => {}
                        }
                    }
                    received = next_event(&mut stream), if listening => match received {
                        Ok(LinkEvent::NetworkError { .. }) => {
                            monitor.report_failure(ErrorClass::NetworkUnreachable);
                        }
                        Ok(LinkEvent::CorsError { .. }) => {
                            monitor.report_failure(ErrorClass::CorsBlocked);
                        }
                        Ok(_) => {}
                        Err(EventBusError::Lagged(skipped)) => {
                            warn!(skipped, "connectivity monitor lagged behind event bus");
                        }
                        Err(EventBusError::Closed) => listening = false,
                    },
                }
            }

            debug!("connectivity monitor stopped");
        });

        MonitorTask {
            stop,
            task: Some(task),
        }
    }
}

/// Owner of a running monitor loop.
#[derive(Debug)]
pub struct MonitorTask {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorTask {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn lock_machine(machine: &Mutex<ConnectivityMachine>) -> MutexGuard<'_, ConnectivityMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}
