use tracing::debug;

use crate::types::{ConnectivityState, ErrorClass, LinkEvent, LinkStatus, Notice};

/// Result of one backend observation (periodic probe, on-demand probe, or a
/// terminally failed request reported by the pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Failed(ErrorClass),
}

/// Instruction for the persisted degraded-mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedDirective {
    Enter,
    Exit,
}

/// Side effects produced by one transition. The caller publishes `events` in
/// order and applies `degraded` to the persisted flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub events: Vec<LinkEvent>,
    pub degraded: Option<DegradedDirective>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.degraded.is_none()
    }

    pub fn notices(&self) -> impl Iterator<Item = Notice> + '_ {
        self.events.iter().filter_map(|event| match event {
            LinkEvent::Notify { notice } => Some(*notice),
            _ => None,
        })
    }
}

/// Connectivity state machine over two axes (host network, backend
/// reachability) with one combined notification policy.
///
/// An outage notice (`WentOffline`, `BackendUnreachable`,
/// `BackendMisconfigured`) is emitted only while no outage notice is live, and
/// `BackOnline` only while one is; each re-arms the other.
#[derive(Debug, Clone)]
pub struct ConnectivityMachine {
    state: ConnectivityState,
    status: LinkStatus,
    consecutive_failures: u32,
    unreachable_threshold: u32,
    outage_notice_live: bool,
    degraded: bool,
}

impl Default for ConnectivityMachine {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ConnectivityMachine {
    /// `unreachable_threshold` is the number of consecutive failures needed to
    /// leave `OnlineReachable`.
    pub fn new(unreachable_threshold: u32) -> Self {
        Self {
            state: ConnectivityState::default(),
            status: LinkStatus::OnlineReachable,
            consecutive_failures: 0,
            unreachable_threshold: unreachable_threshold.max(1),
            outage_notice_live: false,
            degraded: false,
        }
    }

    /// Restore a degraded flag persisted by a previous run.
    pub fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Host reported loss of network.
    pub fn on_offline(&mut self, now_ms: u64) -> Transition {
        let mut transition = Transition::default();
        self.state.browser_online = false;
        self.state.last_checked_at_ms = Some(now_ms);

        self.move_to(LinkStatus::Offline, &mut transition);
        self.raise_outage(Notice::WentOffline, &mut transition);
        transition
    }

    /// Host reported network is back. The caller must follow up with an
    /// immediate probe; status stays unchanged until that result arrives.
    pub fn on_online(&mut self, now_ms: u64) -> Transition {
        self.state.browser_online = true;
        self.state.last_checked_at_ms = Some(now_ms);
        Transition::default()
    }

    /// Apply one backend observation. Observations made while the host is
    /// offline are ignored.
    pub fn on_probe(&mut self, outcome: ProbeOutcome, now_ms: u64) -> Transition {
        let mut transition = Transition::default();
        if !self.state.browser_online {
            debug!(?outcome, "ignoring backend observation while offline");
            return transition;
        }

        self.state.last_checked_at_ms = Some(now_ms);
        match outcome {
            ProbeOutcome::Reachable => self.on_reachable(&mut transition),
            ProbeOutcome::Failed(class) => self.on_failure(class, &mut transition),
        }
        transition
    }

    fn on_reachable(&mut self, transition: &mut Transition) {
        self.consecutive_failures = 0;
        self.state.backend_reachable = true;
        self.state.last_error = None;

        self.move_to(LinkStatus::OnlineReachable, transition);
        if self.outage_notice_live {
            self.outage_notice_live = false;
            transition.events.push(LinkEvent::Notify {
                notice: Notice::BackOnline,
            });
        }
        if self.degraded {
            self.degraded = false;
            transition.degraded = Some(DegradedDirective::Exit);
        }
    }

    fn on_failure(&mut self, class: ErrorClass, transition: &mut Transition) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state.last_error = Some(class);

        if self.status == LinkStatus::OnlineReachable
            && self.consecutive_failures < self.unreachable_threshold
        {
            debug!(
                failures = self.consecutive_failures,
                threshold = self.unreachable_threshold,
                "backend failure below unreachable threshold"
            );
            return;
        }

        self.state.backend_reachable = false;
        let (target, notice) = if class == ErrorClass::CorsBlocked {
            (LinkStatus::OnlineMisconfigured, Notice::BackendMisconfigured)
        } else {
            (LinkStatus::OnlineUnreachable, Notice::BackendUnreachable)
        };

        self.move_to(target, transition);
        self.raise_outage(notice, transition);
        if !self.degraded {
            self.degraded = true;
            transition.degraded = Some(DegradedDirective::Enter);
        }
    }

    fn move_to(&mut self, next: LinkStatus, transition: &mut Transition) {
        if self.status == next {
            return;
        }
        debug!(from = ?self.status, to = ?next, "connectivity status transition");
        self.status = next;
        transition
            .events
            .push(LinkEvent::ConnectivityChanged { status: next });
    }

    fn raise_outage(&mut self, notice: Notice, transition: &mut Transition) {
        if self.outage_notice_live {
            return;
        }
        self.outage_notice_live = true;
        transition.events.push(LinkEvent::Notify { notice });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAIL: ProbeOutcome = ProbeOutcome::Failed(ErrorClass::NetworkUnreachable);

    fn run(sm: &mut ConnectivityMachine, outcomes: &[ProbeOutcome]) -> Vec<Notice> {
        outcomes
            .iter()
            .enumerate()
            .flat_map(|(i, outcome)| {
                sm.on_probe(*outcome, i as u64)
                    .notices()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn repeated_failures_notify_once_and_recovery_once() {
        let mut sm = ConnectivityMachine::default();
        let notices = run(
            &mut sm,
            &[FAIL, FAIL, FAIL, ProbeOutcome::Reachable],
        );
        assert_eq!(
            notices,
            vec![Notice::BackendUnreachable, Notice::BackOnline]
        );
        assert_eq!(sm.status(), LinkStatus::OnlineReachable);
        assert!(!sm.is_degraded());
    }

    #[test]
    fn first_failure_enters_degraded_mode_and_success_exits() {
        let mut sm = ConnectivityMachine::default();
        let entered = sm.on_probe(FAIL, 10);
        assert_eq!(entered.degraded, Some(DegradedDirective::Enter));
        assert_eq!(sm.status(), LinkStatus::OnlineUnreachable);
        assert_eq!(sm.state().last_error, Some(ErrorClass::NetworkUnreachable));
        assert!(!sm.state().backend_reachable);

        let repeated = sm.on_probe(FAIL, 20);
        assert!(repeated.is_empty());

        let exited = sm.on_probe(ProbeOutcome::Reachable, 30);
        assert_eq!(exited.degraded, Some(DegradedDirective::Exit));
        assert_eq!(sm.state().last_checked_at_ms, Some(30));
        assert_eq!(sm.state().last_error, None);
    }

    #[test]
    fn threshold_absorbs_momentary_blips() {
        let mut sm = ConnectivityMachine::new(2);
        let notices = run(
            &mut sm,
            &[FAIL, ProbeOutcome::Reachable, FAIL, ProbeOutcome::Reachable],
        );
        assert!(notices.is_empty());
        assert_eq!(sm.status(), LinkStatus::OnlineReachable);

        let notices = run(&mut sm, &[FAIL, FAIL]);
        assert_eq!(notices, vec![Notice::BackendUnreachable]);
        assert!(sm.is_degraded());
    }

    #[test]
    fn repeated_offline_events_notify_once() {
        let mut sm = ConnectivityMachine::default();
        let first = sm.on_offline(1);
        assert_eq!(
            first.events,
            vec![
                LinkEvent::ConnectivityChanged {
                    status: LinkStatus::Offline
                },
                LinkEvent::Notify {
                    notice: Notice::WentOffline
                },
            ]
        );
        assert!(sm.on_offline(2).is_empty());
        assert!(!sm.state().browser_online);
    }

    #[test]
    fn probes_while_offline_are_ignored() {
        let mut sm = ConnectivityMachine::default();
        sm.on_offline(1);
        assert!(sm.on_probe(FAIL, 2).is_empty());
        assert!(sm.on_probe(ProbeOutcome::Reachable, 3).is_empty());
        assert_eq!(sm.status(), LinkStatus::Offline);
    }

    #[test]
    fn coming_back_online_with_healthy_backend_notifies_once() {
        let mut sm = ConnectivityMachine::default();
        sm.on_offline(1);
        assert!(sm.on_online(2).is_empty());
        let back = sm.on_probe(ProbeOutcome::Reachable, 3);
        assert_eq!(back.notices().collect::<Vec<_>>(), vec![Notice::BackOnline]);
        assert_eq!(sm.status(), LinkStatus::OnlineReachable);
        assert!(sm.on_probe(ProbeOutcome::Reachable, 4).is_empty());
    }

    #[test]
    fn coming_back_online_with_dead_backend_keeps_single_outage_notice() {
        let mut sm = ConnectivityMachine::new(3);
        sm.on_offline(1);
        sm.on_online(2);
        let failed = sm.on_probe(FAIL, 3);
        assert_eq!(
            failed.events,
            vec![LinkEvent::ConnectivityChanged {
                status: LinkStatus::OnlineUnreachable
            }]
        );
        assert_eq!(failed.degraded, Some(DegradedDirective::Enter));
    }

    #[test]
    fn cors_failures_report_misconfiguration() {
        let mut sm = ConnectivityMachine::default();
        let t = sm.on_probe(ProbeOutcome::Failed(ErrorClass::CorsBlocked), 1);
        assert_eq!(sm.status(), LinkStatus::OnlineMisconfigured);
        assert_eq!(
            t.notices().collect::<Vec<_>>(),
            vec![Notice::BackendMisconfigured]
        );

        let t = sm.on_probe(FAIL, 2);
        assert_eq!(sm.status(), LinkStatus::OnlineUnreachable);
        assert_eq!(t.notices().count(), 0);
    }

    #[test]
    fn restored_degraded_flag_clears_on_first_success_without_notice() {
        let mut sm = ConnectivityMachine::default().with_degraded(true);
        let t = sm.on_probe(ProbeOutcome::Reachable, 1);
        assert!(t.events.is_empty());
        assert_eq!(t.degraded, Some(DegradedDirective::Exit));
    }
}
