//! Session façade over the rule managers
//!
//! The [`Orchestrator`] is what callers talk to. Every mutation is queued on a
//! [`SequentialQueue`] and runs in submission order, one at a time. Outcomes
//! come back as [`OrchestratorEvent`]s on the channel returned by
//! [`Orchestrator::new`]: one `Failed` per failed step and one `Completed`
//! each time the queue drains on its own.
//!
//! # Degradation
//!
//! IPv4 and IPv6 fail independently. A stack whose rule change fails is
//! *halted* until the next `cleanup`/`cancel`:
//!
//! - IPv4 halted: nothing is attempted anymore, since bypass cannot work.
//! - IPv6 halted: operations go to the IPv4 manager only, and selected UIDs
//!   get an IPv6 REJECT rule instead of the bypass mark so their IPv6
//!   traffic is dropped rather than silently sent through the tunnel. Whether
//!   that fallback is in place is tracked as a [`RejectState`].

use crate::core::error::{Error, Result, Severity};
use crate::core::queue::SequentialQueue;
use crate::core::shell::CommandRunner;
use crate::core::stack::{CombinedRuleManager, RuleManager, StackRuleManager};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome notifications of queued work
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// The queue ran dry without being cancelled
    Completed,
    /// One queued step failed
    Failed(Error),
}

/// Whether IPv6 traffic of bypassed UIDs is being rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum RejectState {
    #[strum(serialize = "installed")]
    Installed,
    #[strum(serialize = "failed")]
    Failed,
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
}

/// Per-session stack health
///
/// `reject_state` only leaves `Unknown` once `v6_halted` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub v4_halted: bool,
    pub v6_halted: bool,
    pub reject_state: RejectState,
}

/// Human-readable summary of a [`SessionStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub severity: Severity,
    pub lines: Vec<String>,
}

impl SessionStatus {
    pub fn ipv4_ok(&self) -> bool {
        !self.v4_halted
    }

    pub fn ipv6_ok(&self) -> bool {
        !self.v6_halted
    }

    /// Halts the stack `error` belongs to
    fn halt_for(&mut self, error: &Error) {
        if error.is_ipv6_rule() {
            self.v6_halted = true;
        } else {
            self.v4_halted = true;
        }
    }

    /// Summarises the session for `selected` bypassed apps
    pub fn report(&self, selected: usize) -> StatusReport {
        let bypassing = format!(
            "{selected} app{} bypassing the VPN",
            if selected == 1 { "" } else { "s" }
        );

        if self.v4_halted {
            return StatusReport {
                severity: Severity::Error,
                lines: vec![
                    "Failed to apply iptables rules; no app is bypassing the VPN".to_string(),
                ],
            };
        }
        if !self.v6_halted {
            return StatusReport {
                severity: Severity::Success,
                lines: vec![bypassing],
            };
        }

        let (severity, ipv6) = match self.reject_state {
            RejectState::Installed => (
                Severity::Warning,
                "IPv6 bypass is unsupported; IPv6 traffic of bypassed apps is rejected",
            ),
            RejectState::Failed => (
                Severity::Error,
                "IPv6 bypass and IPv6 reject both failed; IPv6 traffic of bypassed apps may leak through the VPN",
            ),
            RejectState::Unknown => (
                Severity::Warning,
                "IPv6 bypass is unsupported; state of IPv6 traffic of bypassed apps is unknown",
            ),
        };
        StatusReport {
            severity,
            lines: vec![bypassing, ipv6.to_string()],
        }
    }
}

#[derive(Default)]
struct Shared {
    status: SessionStatus,
    /// Bumped on cancel; steps from an older generation may no longer write
    generation: u64,
}

pub struct Orchestrator<R: CommandRunner> {
    rules: Arc<CombinedRuleManager<R>>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    queue: SequentialQueue,
}

impl<R: CommandRunner> Orchestrator<R> {
    /// Creates a session and the receiving end of its event channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        rules: Arc<CombinedRuleManager<R>>,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let idle_events = events.clone();
        let queue = SequentialQueue::new(move || {
            let _ = idle_events.send(OrchestratorEvent::Completed);
        });
        let orchestrator = Self {
            rules,
            shared: Arc::new(Mutex::new(Shared::default())),
            events,
            queue,
        };
        (orchestrator, receiver)
    }

    pub fn rules(&self) -> &Arc<CombinedRuleManager<R>> {
        &self.rules
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.shared).status
    }

    pub fn ipv4_ok(&self) -> bool {
        self.status().ipv4_ok()
    }

    pub fn ipv6_ok(&self) -> bool {
        self.status().ipv6_ok()
    }

    pub fn ipv6_reject_state(&self) -> RejectState {
        self.status().reject_state
    }

    /// Whether nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Waits for everything submitted so far to run, returning the failures
    /// reported on `events` along the way.
    ///
    /// Units submitted back to back may still drain the queue in between, so
    /// a `Completed` only ends the wait once the queue is actually idle. Call
    /// this after submitting; on a queue that never had work it waits forever.
    pub async fn wait_idle(
        &self,
        events: &mut mpsc::UnboundedReceiver<OrchestratorEvent>,
    ) -> Vec<Error> {
        let mut failures = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                OrchestratorEvent::Failed(err) => failures.push(err),
                OrchestratorEvent::Completed if self.is_idle() => break,
                OrchestratorEvent::Completed => {}
            }
        }
        // Units finishing after an earlier drain have already sent their failures
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::Failed(err) = event {
                failures.push(err);
            }
        }
        failures
    }

    fn step(&self) -> Step<R> {
        Step {
            rules: Arc::clone(&self.rules),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            generation: lock(&self.shared).generation,
        }
    }

    pub fn add_uid(&self, uid: u32) {
        let step = self.step();
        self.queue.submit(async move {
            step.add_or_reject(&AddRequest::Single(uid)).await;
        });
    }

    /// Replaces the whole selection with `uids`, in order
    pub fn clear_and_add_uids(&self, uids: Vec<u32>) {
        let step = self.step();
        self.queue.submit(async move {
            step.add_or_reject(&AddRequest::Batch(uids)).await;
        });
    }

    pub fn remove_uid(&self, uid: u32) {
        let step = self.step();
        self.queue.submit(async move {
            step.remove(uid).await;
        });
    }

    pub fn enable(&self) {
        let step = self.step();
        self.queue.submit(async move {
            step.enable().await;
        });
    }

    pub fn masquerade(&self) {
        let step = self.step();
        self.queue.submit(async move {
            step.masquerade().await;
        });
    }

    /// Drops all pending work, resets the session and removes every chain
    pub fn cleanup(&self) {
        self.cancel();
        let step = self.step();
        self.queue.submit(async move {
            step.cleanup().await;
        });
    }

    /// Drops all pending work and resets the session
    pub fn cancel(&self) {
        {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.status = SessionStatus::default();
        }
        self.queue.cancel();
        debug!("orchestrator queue cancelled");
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

enum AddRequest {
    Single(u32),
    Batch(Vec<u32>),
}

impl AddRequest {
    async fn mark<R: CommandRunner>(&self, stack: &StackRuleManager<R>) -> Result<()> {
        match self {
            Self::Single(uid) => stack.add_uid(*uid).await,
            Self::Batch(uids) => stack.clear_and_add_uids(uids).await,
        }
    }

    async fn reject<R: CommandRunner>(&self, stack: &StackRuleManager<R>) -> Result<()> {
        match self {
            Self::Single(uid) => stack.reject_uid(*uid).await?,
            Self::Batch(uids) => stack.clear_and_reject_uids(uids).await?,
        }
        stack.enable_reject().await
    }
}

/// Manager matching the current halted flags
enum Active<'a, R> {
    Both(&'a CombinedRuleManager<R>),
    Ipv4Only(&'a StackRuleManager<R>),
}

impl<R: CommandRunner> Active<'_, R> {
    /// Drops the bypass mark first, then any reject rule of the same UID
    async fn remove_and_unreject(&self, uid: u32) -> Result<()> {
        self.remove_uid(uid).await?;
        self.unreject_uid(uid).await
    }

    async fn remove_uid(&self, uid: u32) -> Result<()> {
        match self {
            Self::Both(rules) => rules.remove_uid(uid).await,
            Self::Ipv4Only(rules) => rules.remove_uid(uid).await,
        }
    }

    async fn unreject_uid(&self, uid: u32) -> Result<()> {
        match self {
            Self::Both(rules) => rules.unreject_uid(uid).await,
            Self::Ipv4Only(rules) => rules.unreject_uid(uid).await,
        }
    }

    async fn enable(&self) -> Result<()> {
        match self {
            Self::Both(rules) => rules.enable().await,
            Self::Ipv4Only(rules) => rules.enable().await,
        }
    }

    async fn masquerade(&self) -> Result<()> {
        match self {
            Self::Both(rules) => rules.masquerade().await,
            Self::Ipv4Only(rules) => rules.masquerade().await,
        }
    }
}

/// Everything one queued unit needs, detached from the orchestrator
struct Step<R> {
    rules: Arc<CombinedRuleManager<R>>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    generation: u64,
}

impl<R: CommandRunner> Step<R> {
    fn status(&self) -> SessionStatus {
        lock(&self.shared).status
    }

    /// Applies `change` unless the session was reset since this step was queued
    fn update(&self, change: impl FnOnce(&mut SessionStatus)) {
        let mut shared = lock(&self.shared);
        if shared.generation == self.generation {
            change(&mut shared.status);
        }
    }

    fn report(&self, error: Error) {
        if lock(&self.shared).generation == self.generation {
            let _ = self.events.send(OrchestratorEvent::Failed(error));
        }
    }

    fn active(&self) -> Option<Active<'_, R>> {
        let status = self.status();
        if status.v4_halted {
            None
        } else if status.v6_halted {
            Some(Active::Ipv4Only(self.rules.ipv4()))
        } else {
            Some(Active::Both(&self.rules))
        }
    }

    async fn add_or_reject(&self, request: &AddRequest) {
        if self.status().v4_halted {
            return;
        }
        if let Err(err) = request.mark(self.rules.ipv4()).await {
            self.update(|status| status.v4_halted = true);
            log_error(&err);
            self.report(err);
            return;
        }

        let mut ipv6_error = None;
        if !self.status().v6_halted {
            if let Err(err) = request.mark(self.rules.ipv6()).await {
                self.update(|status| status.v6_halted = true);
                log_error(&err);
                if !err.is_ipv6_rule() || self.status().reject_state == RejectState::Failed {
                    self.report(err);
                    return;
                }
                ipv6_error = Some(err);
            }
        }

        let status = self.status();
        if !status.v6_halted || status.reject_state == RejectState::Failed {
            return;
        }
        match request.reject(self.rules.ipv6()).await {
            Ok(()) => {
                self.update(|status| status.reject_state = RejectState::Installed);
                if ipv6_error.is_some() {
                    info!("IPv6 bypass unsupported, rejecting IPv6 traffic of bypassed apps");
                }
            }
            Err(err) => {
                self.update(|status| status.reject_state = RejectState::Failed);
                debug!(error = %err, "IPv6 reject fallback failed");
                self.report(ipv6_error.unwrap_or(err));
            }
        }
    }

    async fn remove(&self, uid: u32) {
        let Some(active) = self.active() else {
            return;
        };
        if let Err(err) = active.remove_and_unreject(uid).await {
            self.update(|status| {
                status.halt_for(&err);
                if err.is_ipv6_rule() {
                    status.reject_state = RejectState::Unknown;
                }
            });
            log_error(&err);
            self.report(err);
        }
    }

    async fn enable(&self) {
        let Some(active) = self.active() else {
            return;
        };
        if let Err(err) = active.enable().await {
            self.update(|status| {
                status.halt_for(&err);
                if err.is_ipv6_rule() {
                    status.reject_state = RejectState::Failed;
                }
            });
            log_error(&err);
            self.report(err);
        }
    }

    async fn masquerade(&self) {
        let Some(active) = self.active() else {
            return;
        };
        let Err(err) = active.masquerade().await else {
            return;
        };
        self.update(|status| status.halt_for(&err));
        log_error(&err);

        if err.is_ipv6_rule() && self.status().reject_state != RejectState::Failed {
            let state = match self.retrofit_reject().await {
                Ok(()) => RejectState::Installed,
                Err(retrofit) => {
                    debug!(error = %retrofit, "IPv6 reject retrofit failed");
                    RejectState::Failed
                }
            };
            self.update(|status| status.reject_state = state);
        }
        self.report(err);
    }

    /// Rejects every UID already marked in IPv6, then hooks the reject chain
    async fn retrofit_reject(&self) -> Result<()> {
        let ipv6 = self.rules.ipv6();
        for uid in ipv6.list_uids().await? {
            ipv6.reject_uid(uid).await?;
        }
        ipv6.enable_reject().await
    }

    async fn cleanup(&self) {
        if let Err(err) = self.rules.cleanup().await {
            self.update(|status| status.halt_for(&err));
            log_error(&err);
            self.report(err);
        }
    }
}

fn log_error(err: &Error) {
    match err {
        Error::Ipv6Rule(result) => warn!(%result, "ip6tables command failed"),
        Error::Ipv4Rule(result) => error!(%result, "iptables command failed"),
        Error::PrivilegedAccessDenied(reason) => error!(%reason, "root shell unavailable"),
        Error::Timeout { .. } => error!(error = %err, "firewall command timed out"),
        other => error!(error = %other, "unexpected firewall failure"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Family;
    use crate::core::stack::{FILTER_CHAIN, MARK_CHAIN, NAT_CHAIN, mark_rule, reject_rule};
    use crate::core::test_helpers::FakeFirewall;
    use std::time::Duration;

    struct Harness {
        firewall: Arc<FakeFirewall>,
        orchestrator: Orchestrator<FakeFirewall>,
        events: mpsc::UnboundedReceiver<OrchestratorEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let firewall = Arc::new(FakeFirewall::new());
            let rules = Arc::new(CombinedRuleManager::with_default_binaries(Arc::clone(
                &firewall,
            )));
            let (orchestrator, events) = Orchestrator::new(rules);
            Self {
                firewall,
                orchestrator,
                events,
            }
        }

        /// Collects every failure up to the next completion
        async fn drain(&mut self) -> Vec<Error> {
            let mut failures = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("no completion within 5s")
                    .expect("event channel closed");
                match event {
                    OrchestratorEvent::Completed => return failures,
                    OrchestratorEvent::Failed(err) => failures.push(err),
                }
            }
        }
    }

    #[test]
    fn test_report_severity() {
        let healthy = SessionStatus::default();
        assert_eq!(healthy.report(1).severity, Severity::Success);
        assert_eq!(healthy.report(1).lines, vec!["1 app bypassing the VPN"]);

        let v4 = SessionStatus {
            v4_halted: true,
            ..SessionStatus::default()
        };
        assert_eq!(v4.report(3).severity, Severity::Error);

        let rejected = SessionStatus {
            v6_halted: true,
            reject_state: RejectState::Installed,
            ..SessionStatus::default()
        };
        assert_eq!(rejected.report(2).severity, Severity::Warning);
        assert!(rejected.report(2).lines[1].contains("rejected"));

        let leaking = SessionStatus {
            v6_halted: true,
            reject_state: RejectState::Failed,
            ..SessionStatus::default()
        };
        assert_eq!(leaking.report(2).severity, Severity::Error);
        assert!(leaking.report(2).lines[1].contains("leak"));

        let unknown = SessionStatus {
            v6_halted: true,
            ..SessionStatus::default()
        };
        assert_eq!(unknown.report(2).severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_healthy_add_marks_both_stacks() {
        let mut h = Harness::new();

        h.orchestrator.add_uid(42);
        assert!(h.drain().await.is_empty());

        for family in [Family::V4, Family::V6] {
            assert_eq!(
                h.firewall.rules(family, "mangle", MARK_CHAIN),
                Some(vec![mark_rule(42)])
            );
            assert_eq!(h.firewall.rules(family, "filter", FILTER_CHAIN), None);
        }
        assert_eq!(h.orchestrator.status(), SessionStatus::default());
    }

    #[tokio::test]
    async fn test_ipv6_mark_failure_falls_back_to_reject() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-j MARK");

        h.orchestrator.add_uid(42);
        let failures = h.drain().await;

        assert!(failures.is_empty(), "fallback success is not reported");
        let status = h.orchestrator.status();
        assert!(status.ipv4_ok());
        assert!(!status.ipv6_ok());
        assert_eq!(status.reject_state, RejectState::Installed);
        assert_eq!(
            h.firewall.rules(Family::V6, "filter", FILTER_CHAIN),
            Some(vec![reject_rule(42)])
        );
        assert_eq!(
            h.firewall.rules(Family::V6, "filter", "OUTPUT"),
            Some(vec![format!("-j {FILTER_CHAIN}")])
        );
        assert_eq!(
            h.firewall.rules(Family::V4, "mangle", MARK_CHAIN),
            Some(vec![mark_rule(42)])
        );
    }

    #[tokio::test]
    async fn test_failed_fallback_reports_mark_error() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-j MARK");
        h.firewall.fail_when(Family::V6, "-j REJECT");

        h.orchestrator.add_uid(42);
        let failures = h.drain().await;

        assert_eq!(failures.len(), 1);
        let result = failures[0].command_result().unwrap();
        assert!(matches!(failures[0], Error::Ipv6Rule(_)));
        assert!(result.to_string().contains("injected failure"));

        let status = h.orchestrator.status();
        assert!(status.ipv4_ok());
        assert_eq!(status.reject_state, RejectState::Failed);
        assert_eq!(status.report(1).severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_known_failed_reject_reports_immediately() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-j MARK");
        h.firewall.fail_when(Family::V6, "-j REJECT");
        h.orchestrator.add_uid(1);
        assert_eq!(h.drain().await.len(), 1);

        // Once halted, IPv6 is skipped entirely and the known-failed reject is not retried
        h.orchestrator.add_uid(2);
        assert!(h.drain().await.is_empty());
        assert!(
            !h.firewall
                .commands()
                .iter()
                .any(|cmd| cmd.starts_with("ip6tables") && cmd.contains("--uid-owner 2"))
        );
    }

    #[tokio::test]
    async fn test_ipv4_failure_halts_everything() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V4, "-j MARK");

        h.orchestrator.add_uid(42);
        let failures = h.drain().await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Error::Ipv4Rule(_)));
        assert!(!h.orchestrator.ipv4_ok());

        let before = h.firewall.commands().len();
        h.orchestrator.add_uid(43);
        h.orchestrator.remove_uid(42);
        h.orchestrator.enable();
        h.orchestrator.masquerade();
        assert!(h.drain().await.is_empty());
        assert_eq!(h.firewall.commands().len(), before);
    }

    #[tokio::test]
    async fn test_halted_ipv6_routes_to_ipv4_only() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-j MARK");
        h.orchestrator.add_uid(42);
        h.drain().await;

        let before = h.firewall.commands().len();
        h.orchestrator.enable();
        h.orchestrator.masquerade();
        assert!(h.drain().await.is_empty());

        let issued = &h.firewall.commands()[before..];
        assert!(!issued.is_empty());
        assert!(issued.iter().all(|cmd| cmd.starts_with("iptables ")));
        assert!(h.firewall.rules(Family::V4, "nat", NAT_CHAIN).is_some());
        assert_eq!(h.firewall.rules(Family::V6, "nat", NAT_CHAIN), None);
    }

    #[tokio::test]
    async fn test_clear_and_add_fallback_rejects_whole_list() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-j MARK");

        h.orchestrator.clear_and_add_uids(vec![3, 1, 2]);
        assert!(h.drain().await.is_empty());

        assert_eq!(
            h.firewall.rules(Family::V6, "filter", FILTER_CHAIN),
            Some(vec![reject_rule(3), reject_rule(1), reject_rule(2)])
        );
        assert_eq!(
            h.orchestrator.rules().ipv4().list_uids().await.unwrap(),
            vec![3, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_remove_undoes_add() {
        let mut h = Harness::new();
        h.orchestrator.add_uid(7);
        h.orchestrator.add_uid(8);
        h.orchestrator.remove_uid(7);
        assert!(h.drain().await.is_empty());

        for family in [Family::V4, Family::V6] {
            assert_eq!(
                h.firewall.rules(family, "mangle", MARK_CHAIN),
                Some(vec![mark_rule(8)])
            );
        }
    }

    #[tokio::test]
    async fn test_remove_ipv6_failure_resets_reject_state() {
        let mut h = Harness::new();
        h.orchestrator.add_uid(7);
        h.drain().await;
        h.firewall.fail_when(Family::V6, "-D vpnbypass_mout");

        h.orchestrator.remove_uid(7);
        let failures = h.drain().await;

        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_ipv6_rule());
        let status = h.orchestrator.status();
        assert!(status.ipv4_ok());
        assert!(!status.ipv6_ok());
        assert_eq!(status.reject_state, RejectState::Unknown);
        // The unreject step was abandoned
        assert!(
            !h.firewall
                .commands()
                .iter()
                .any(|cmd| cmd.contains(FILTER_CHAIN) && cmd.contains("--uid-owner 7"))
        );
    }

    #[tokio::test]
    async fn test_enable_ipv6_failure_marks_reject_failed() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V6, "-A OUTPUT");

        h.orchestrator.enable();
        let failures = h.drain().await;

        assert_eq!(failures.len(), 1);
        let status = h.orchestrator.status();
        assert!(status.ipv4_ok());
        assert!(!status.ipv6_ok());
        assert_eq!(status.reject_state, RejectState::Failed);
    }

    #[tokio::test]
    async fn test_masquerade_failure_retrofits_reject() {
        let mut h = Harness::new();
        h.orchestrator.clear_and_add_uids(vec![5, 6]);
        h.drain().await;
        h.firewall.fail_when(Family::V6, "-t nat");

        h.orchestrator.masquerade();
        let failures = h.drain().await;

        // The original masquerade error is still reported
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_ipv6_rule());
        assert_eq!(h.orchestrator.ipv6_reject_state(), RejectState::Installed);
        assert_eq!(
            h.firewall.rules(Family::V6, "filter", FILTER_CHAIN),
            Some(vec![reject_rule(5), reject_rule(6)])
        );
    }

    #[tokio::test]
    async fn test_masquerade_retrofit_failure() {
        let mut h = Harness::new();
        h.orchestrator.add_uid(5);
        h.drain().await;
        h.firewall.fail_when(Family::V6, "-t nat");
        h.firewall.fail_when(Family::V6, "-j REJECT");

        h.orchestrator.masquerade();
        assert_eq!(h.drain().await.len(), 1);
        assert_eq!(h.orchestrator.ipv6_reject_state(), RejectState::Failed);
    }

    #[tokio::test]
    async fn test_cleanup_resets_state_and_chains() {
        let mut h = Harness::new();
        h.firewall.fail_when(Family::V4, "-j MARK");
        h.orchestrator.add_uid(1);
        h.drain().await;
        assert!(!h.orchestrator.ipv4_ok());

        h.firewall.heal();
        h.orchestrator.cleanup();
        assert_eq!(h.orchestrator.status(), SessionStatus::default());
        assert!(h.drain().await.is_empty());

        h.orchestrator.add_uid(2);
        h.orchestrator.enable();
        assert!(h.drain().await.is_empty());
        assert_eq!(
            h.firewall.rules(Family::V4, "mangle", MARK_CHAIN),
            Some(vec![mark_rule(2)])
        );
    }

    #[tokio::test]
    async fn test_cleanup_failure_halts_stack() {
        let mut h = Harness::new();
        h.orchestrator.enable();
        h.drain().await;
        h.firewall.fail_when(Family::V6, "-X");

        h.orchestrator.cleanup();
        let failures = h.drain().await;
        assert_eq!(failures.len(), 1);
        assert!(!h.orchestrator.ipv6_ok());
        assert!(h.orchestrator.ipv4_ok());
    }

    #[tokio::test]
    async fn test_cancel_drops_stuck_work_without_completion() {
        let mut h = Harness::new();
        h.firewall.hang_when(Family::V4, "--uid-owner 1 ");

        h.orchestrator.add_uid(1);
        h.orchestrator.add_uid(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.orchestrator.is_idle());

        h.orchestrator.cancel();
        assert!(h.orchestrator.is_idle());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.events.try_recv().is_err());
        assert!(
            !h.firewall
                .commands()
                .iter()
                .any(|cmd| cmd.contains("--uid-owner 2"))
        );

        h.orchestrator.add_uid(3);
        assert!(h.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unmarks_before_unrejecting() {
        let mut h = Harness::new();
        h.orchestrator.add_uid(7);
        h.drain().await;
        h.orchestrator.rules().reject_uid(7).await.unwrap();

        h.orchestrator.remove_uid(7);
        assert!(h.drain().await.is_empty());

        for family in [Family::V4, Family::V6] {
            assert_eq!(h.firewall.rules(family, "mangle", MARK_CHAIN), Some(vec![]));
            assert_eq!(h.firewall.rules(family, "filter", FILTER_CHAIN), Some(vec![]));
        }
        let commands = h.firewall.commands();
        let position = |needle: &str| {
            commands
                .iter()
                .position(|cmd| cmd.starts_with("iptables") && cmd.contains(needle))
                .unwrap()
        };
        assert!(position(&format!("-D {MARK_CHAIN}")) < position(&format!("-D {FILTER_CHAIN}")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_idle_outlasts_early_drains() {
        for _ in 0..200 {
            let mut h = Harness::new();
            h.orchestrator.add_uid(1);
            h.orchestrator.enable();
            h.orchestrator.masquerade();

            let failures = tokio::time::timeout(
                Duration::from_secs(5),
                h.orchestrator.wait_idle(&mut h.events),
            )
            .await
            .expect("queue did not drain within 5s");

            assert!(failures.is_empty());
            assert!(h.orchestrator.is_idle());
            for family in [Family::V4, Family::V6] {
                assert_eq!(
                    h.firewall.rules(family, "nat", NAT_CHAIN),
                    Some(vec![crate::core::stack::masquerade_rule()])
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_idle_collects_failures_of_every_unit() {
        for _ in 0..200 {
            let mut h = Harness::new();
            h.firewall.fail_when(Family::V4, "MASQUERADE");
            h.orchestrator.add_uid(1);
            h.orchestrator.enable();
            h.orchestrator.masquerade();

            let failures = tokio::time::timeout(
                Duration::from_secs(5),
                h.orchestrator.wait_idle(&mut h.events),
            )
            .await
            .expect("queue did not drain within 5s");

            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0], Error::Ipv4Rule(_)));
            assert!(!h.orchestrator.ipv4_ok());
        }
    }
}
