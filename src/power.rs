use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::ControllerError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session teardown still runs after the deadline; it gets this much on top.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    /// The query failed or never ran.
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "ON"),
            PowerState::Off => write!(f, "OFF"),
            PowerState::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    NoActionAlreadyOn,
    PowerOnIssued,
    QueryFailed(ControllerError),
    CommandFailed(ControllerError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::NoActionAlreadyOn | Outcome::PowerOnIssued)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NoActionAlreadyOn => write!(f, "already powered on, no action taken"),
            Outcome::PowerOnIssued => write!(f, "power on command sent"),
            Outcome::QueryFailed(e) => write!(f, "failed to query power state: {e}"),
            Outcome::CommandFailed(e) => write!(f, "failed to send power on command: {e}"),
        }
    }
}

/// Something that can open a management session to the target machine.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ControllerSession>, ControllerError>;
}

#[async_trait]
pub trait ControllerSession: Send {
    async fn is_powered_on(&mut self) -> Result<bool, ControllerError>;

    async fn power_on(&mut self) -> Result<(), ControllerError>;

    async fn close(&mut self) -> Result<(), ControllerError>;
}

async fn within<T, F>(deadline: Instant, fut: F) -> Result<T, ControllerError>
where
    F: Future<Output = Result<T, ControllerError>>,
{
    timeout_at(deadline, fut)
        .await
        .unwrap_or(Err(ControllerError::Timeout))
}

/// Check-then-act power control shared by every trigger source.
///
/// Holds no state besides the controller handle, so concurrent calls never
/// wait on each other. Two calls racing against an OFF machine can both see
/// it off and both send power on.
pub struct PowerOrchestrator {
    controller: Arc<dyn Controller>,
    timeout: Duration,
}

impl PowerOrchestrator {
    pub fn new(controller: Arc<dyn Controller>, timeout: Duration) -> Self {
        Self { controller, timeout }
    }

    /// Powers the machine on unless it already is.
    ///
    /// One session, at most one power-on command, and a single deadline for
    /// connect, query and command together. Failures are logged and folded
    /// into the returned [`Outcome`]; nothing is retried here.
    pub async fn trigger_power_on(&self) -> Outcome {
        let deadline = Instant::now() + self.timeout;

        let mut session = match within(deadline, self.controller.connect()).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[power] cannot establish controller session: {e}");
                return Outcome::QueryFailed(e);
            }
        };

        let outcome = power_on_if_off(session.as_mut(), deadline).await;
        release(session.as_mut()).await;
        outcome
    }

    /// Fresh power state for display. Any failure reads as [`PowerState::Unknown`].
    pub async fn power_state(&self) -> PowerState {
        let deadline = Instant::now() + self.timeout;

        let mut session = match within(deadline, self.controller.connect()).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[power] cannot establish controller session: {e}");
                return PowerState::Unknown;
            }
        };

        let state = match within(deadline, session.is_powered_on()).await {
            Ok(true) => PowerState::On,
            Ok(false) => PowerState::Off,
            Err(e) => {
                log::warn!("[power] failed to get power status: {e}");
                PowerState::Unknown
            }
        };
        release(session.as_mut()).await;
        state
    }
}

async fn power_on_if_off(session: &mut dyn ControllerSession, deadline: Instant) -> Outcome {
    match within(deadline, session.is_powered_on()).await {
        Err(e) => {
            log::warn!("[power] failed to get power status: {e}");
            Outcome::QueryFailed(e)
        }
        Ok(true) => {
            log::info!("[power] server is already powered on, no action taken");
            Outcome::NoActionAlreadyOn
        }
        Ok(false) => {
            log::info!("[power] server is off, sending power on");
            match within(deadline, session.power_on()).await {
                Ok(()) => {
                    log::info!("[power] power on command sent");
                    Outcome::PowerOnIssued
                }
                Err(e) => {
                    log::error!("[power] failed to send power on command: {e}");
                    Outcome::CommandFailed(e)
                }
            }
        }
    }
}

async fn release(session: &mut dyn ControllerSession) {
    match timeout(CLOSE_GRACE, session.close()).await {
        Ok(Ok(())) => log::trace!("[power] session closed"),
        Ok(Err(e)) => log::debug!("[power] failed to close session: {e}"),
        Err(_) => log::debug!("[power] timed out closing session"),
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::testing::{FakeBmc, FakeController};
    use super::*;

    fn orchestrator(bmc: &Arc<FakeBmc>) -> PowerOrchestrator {
        PowerOrchestrator::new(Arc::new(FakeController(bmc.clone())), DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn already_on_is_a_no_op() {
        let bmc = Arc::new(FakeBmc::on());
        let outcome = orchestrator(&bmc).trigger_power_on().await;

        assert!(matches!(outcome, Outcome::NoActionAlreadyOn));
        assert!(outcome.is_success());
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
        assert_eq!(FakeBmc::count(&bmc.closes), 1);
    }

    #[tokio::test]
    async fn off_issues_exactly_one_power_on() {
        let bmc = Arc::new(FakeBmc::off());
        let outcome = orchestrator(&bmc).trigger_power_on().await;

        assert!(matches!(outcome, Outcome::PowerOnIssued));
        assert_eq!(FakeBmc::count(&bmc.connects), 1);
        assert_eq!(FakeBmc::count(&bmc.power_ons), 1);
        assert_eq!(FakeBmc::count(&bmc.closes), 1);
    }

    #[tokio::test]
    async fn second_trigger_after_power_on_is_a_no_op() {
        let bmc = Arc::new(FakeBmc::off());
        let orchestrator = orchestrator(&bmc);

        assert!(matches!(orchestrator.trigger_power_on().await, Outcome::PowerOnIssued));
        assert!(matches!(orchestrator.trigger_power_on().await, Outcome::NoActionAlreadyOn));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 1);
        assert_eq!(FakeBmc::count(&bmc.connects), 2);
    }

    #[tokio::test]
    async fn connect_failure_never_sends_power_on() {
        let bmc = Arc::new(FakeBmc { refuse_connect: true, ..FakeBmc::off() });
        let outcome = orchestrator(&bmc).trigger_power_on().await;

        assert!(matches!(outcome, Outcome::QueryFailed(ControllerError::NoResponse)));
        assert!(!outcome.is_success());
        assert_eq!(FakeBmc::count(&bmc.queries), 0);
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
        assert_eq!(FakeBmc::count(&bmc.closes), 0);
    }

    #[tokio::test]
    async fn query_failure_closes_session() {
        let bmc = Arc::new(FakeBmc { fail_query: true, ..FakeBmc::off() });
        let outcome = orchestrator(&bmc).trigger_power_on().await;

        assert!(matches!(outcome, Outcome::QueryFailed(_)));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
        assert_eq!(FakeBmc::count(&bmc.closes), 1);
    }

    #[tokio::test]
    async fn command_failure_closes_session() {
        let bmc = Arc::new(FakeBmc { fail_command: true, ..FakeBmc::off() });
        let outcome = orchestrator(&bmc).trigger_power_on().await;

        assert!(matches!(outcome, Outcome::CommandFailed(ControllerError::Completion(0xd5))));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 1);
        assert_eq!(FakeBmc::count(&bmc.closes), 1);
    }

    #[tokio::test]
    async fn deadline_aborts_hung_query_and_still_closes() {
        let bmc = Arc::new(FakeBmc { hang_query: true, ..FakeBmc::off() });
        let orchestrator = PowerOrchestrator::new(
            Arc::new(FakeController(bmc.clone())),
            Duration::from_millis(100),
        );

        let outcome = orchestrator.trigger_power_on().await;
        assert!(matches!(outcome, Outcome::QueryFailed(ControllerError::Timeout)));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
        assert_eq!(FakeBmc::count(&bmc.closes), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_may_both_power_on() {
        let bmc = Arc::new(FakeBmc { query_barrier: Some(Barrier::new(2)), ..FakeBmc::off() });
        let orchestrator = orchestrator(&bmc);

        let (first, second) = tokio::join!(orchestrator.trigger_power_on(), orchestrator.trigger_power_on());

        // both saw OFF before either command landed
        assert!(first.is_success() || second.is_success());
        assert!(matches!(first, Outcome::PowerOnIssued));
        assert!(matches!(second, Outcome::PowerOnIssued));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 2);
        assert_eq!(FakeBmc::count(&bmc.closes), 2);
        assert!(bmc.powered.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn power_state_reports_unknown_on_failure() {
        let on = Arc::new(FakeBmc::on());
        assert_eq!(orchestrator(&on).power_state().await, PowerState::On);

        let off = Arc::new(FakeBmc::off());
        assert_eq!(orchestrator(&off).power_state().await, PowerState::Off);
        assert_eq!(FakeBmc::count(&off.power_ons), 0);
        assert_eq!(FakeBmc::count(&off.closes), 1);

        let unreachable = Arc::new(FakeBmc { refuse_connect: true, ..FakeBmc::off() });
        assert_eq!(orchestrator(&unreachable).power_state().await, PowerState::Unknown);

        let broken = Arc::new(FakeBmc { fail_query: true, ..FakeBmc::on() });
        assert_eq!(orchestrator(&broken).power_state().await, PowerState::Unknown);
    }

    #[test]
    fn power_state_labels() {
        assert_eq!(PowerState::On.to_string(), "ON");
        assert_eq!(PowerState::Off.to_string(), "OFF");
        assert_eq!(PowerState::Unknown.to_string(), "Unknown");
    }
}
