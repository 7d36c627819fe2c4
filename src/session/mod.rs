//! Session actor: owns the run state for one automated page and drives the
//! checkout steps in response to control requests.

mod steps;

use crate::bridge::BridgeLink;
use crate::card::CardSource;
use crate::channel::{self, Inbox, Requester};
use crate::config::{CardField, CheckoutConfig};
use crate::inject::Injector;
use crate::ledger::{self, Ledger, Outcome, RunResult};
use crate::message::{
    BridgeRequest, ControlRequest, ControlResponse, SessionStatus, StatusUpdate,
};
use crate::store::Store;
use crate::surface::Surface;
use crate::waiter::StopSignal;
use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Whether a run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    /// The last run was stopped from outside. A new START is accepted.
    Stopped,
}

/// Checkout step, numbered as reported to controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Step {
    #[default]
    Idle = 0,
    Identifier = 1,
    Gate = 2,
    Payment = 3,
    /// Everything is filled. The final submission is left to a person.
    ManualSubmitReady = 4,
}

impl Step {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Presents a card field for entry by hand when it could not be injected.
pub trait ManualEntry {
    fn present(&self, field: CardField, value: &str) -> Result<()>;
}

/// Bridge owner plus the page target it should work on.
struct BridgeTarget {
    link: BridgeLink,
    target: String,
}

/// Everything a run reads. Shared immutably between the control loop and
/// the active run.
struct Runner<S, C, St> {
    config: CheckoutConfig,
    surface: S,
    cards: C,
    store: St,
    injector: Injector,
    bridge: Option<BridgeTarget>,
    manual: Option<Box<dyn ManualEntry>>,
    step: watch::Sender<Step>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl<S, C, St> Runner<S, C, St> {
    fn enter(&self, step: Step, message: impl Into<String>) {
        self.step.send_replace(step);
        self.report(StatusUpdate::info(step.number(), message));
    }

    fn report(&self, update: StatusUpdate) {
        if update.is_error {
            warn!("[step {}] {}", update.step, update.message);
        } else {
            info!("[step {}] {}", update.step, update.message);
        }
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

/// What a finished run hands back to the control loop.
#[derive(Debug)]
struct RunReport {
    outcome: Outcome,
    card_suffix: String,
    stopped: bool,
}

type RunFuture<'a> = Pin<Box<dyn Future<Output = RunReport> + 'a>>;

struct ActiveRun<'a> {
    identifier: String,
    cursor: usize,
    list_len: usize,
    stop: StopSignal,
    future: RunFuture<'a>,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: Phase,
    identifier: Option<String>,
    /// Cursor after the last finished run. Takes precedence over the stored
    /// one, which may be stale when a save failed.
    cursor: Option<usize>,
}

/// One checkout automation target, served by [`Session::serve`].
pub struct Session<S, C, St> {
    runner: Runner<S, C, St>,
    inbox: Inbox<ControlRequest, ControlResponse>,
}

/// Builds a [`Session`] and its controller handle.
pub struct SessionBuilder<S, C, St> {
    config: CheckoutConfig,
    surface: S,
    cards: C,
    store: St,
    bridge: Option<BridgeTarget>,
    manual: Option<Box<dyn ManualEntry>>,
}

impl<S, C, St> SessionBuilder<S, C, St>
where
    S: Surface,
    C: CardSource,
    St: Store,
{
    /// Route fields the page cannot reach to a bridge owner for `target`.
    pub fn bridge(mut self, link: BridgeLink, target: impl Into<String>) -> Self {
        self.bridge = Some(BridgeTarget {
            link,
            target: target.into(),
        });
        self
    }

    /// Last resort for card fields neither the page nor the bridge could fill.
    pub fn manual(mut self, manual: impl ManualEntry + 'static) -> Self {
        self.manual = Some(Box::new(manual));
        self
    }

    pub fn build(self) -> (Session<S, C, St>, SessionHandle) {
        let (control, inbox) = channel::channel(16);
        let (updates, _) = broadcast::channel(64);
        let (step, _) = watch::channel(Step::Idle);
        let timeout = self.config.timing.request_timeout();

        let runner = Runner {
            injector: Injector::from_timing(&self.config.timing),
            config: self.config,
            surface: self.surface,
            cards: self.cards,
            store: self.store,
            bridge: self.bridge,
            manual: self.manual,
            step,
            updates: updates.clone(),
        };
        let handle = SessionHandle {
            control,
            updates,
            timeout,
        };
        (Session { runner, inbox }, handle)
    }
}

impl<S, C, St> Session<S, C, St>
where
    S: Surface,
    C: CardSource,
    St: Store,
{
    pub fn builder(config: CheckoutConfig, surface: S, cards: C, store: St) -> SessionBuilder<S, C, St> {
        SessionBuilder {
            config,
            surface,
            cards,
            store,
            bridge: None,
            manual: None,
        }
    }

    /// Answer control requests until every [`SessionHandle`] is dropped.
    ///
    /// The active run is polled from this loop, so a STOP or GET_STATUS is
    /// seen at the run's next suspension point. On shutdown the active run
    /// is stopped and recorded and the bridge is told to detach.
    pub async fn serve(self) {
        let Session { runner, mut inbox } = self;
        let mut ledger = match runner.store.load_history() {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("could not load run history: {}", e);
                Ledger::new()
            }
        };
        let mut state = SessionState::default();
        let mut active: Option<ActiveRun<'_>> = None;

        loop {
            tokio::select! {
                report = drive(&mut active) => {
                    if let Some(run) = active.take() {
                        runner.finish(&mut state, &mut ledger, run, report);
                    }
                }
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    debug!("control request: {:?}", envelope.request);
                    let response = match &envelope.request {
                        ControlRequest::GetStatus => ControlResponse::Status(SessionStatus {
                            is_running: state.phase == Phase::Running,
                            step: runner.step.borrow().number(),
                            identifier: state.identifier.clone(),
                        }),
                        ControlRequest::StartAutomation => {
                            if active.is_some() {
                                debug!("start ignored: a run is already active");
                                ControlResponse::ack(false)
                            } else {
                                match runner.begin(state.cursor) {
                                    Ok(run) => {
                                        state.phase = Phase::Running;
                                        state.identifier = Some(run.identifier.clone());
                                        active = Some(run);
                                        ControlResponse::ack(true)
                                    }
                                    Err(e) => {
                                        runner.report(StatusUpdate::error(Step::Idle.number(), e.to_string()));
                                        ControlResponse::ack(false)
                                    }
                                }
                            }
                        }
                        ControlRequest::StopAutomation => match &active {
                            Some(run) => {
                                run.stop.stop();
                                ControlResponse::ack(true)
                            }
                            None => ControlResponse::ack(false),
                        },
                        ControlRequest::VerifySubmitReady => {
                            if active.is_some() {
                                ControlResponse::SubmitReady {
                                    ready: false,
                                    detail: "a run is in progress".into(),
                                }
                            } else {
                                let (ready, detail) = runner.submit_ready().await;
                                ControlResponse::SubmitReady { ready, detail }
                            }
                        }
                        ControlRequest::Unknown => ControlResponse::ack(false),
                    };
                    if !envelope.reply(response) {
                        debug!("controller gone before reply");
                    }
                }
            }
        }

        if let Some(mut run) = active.take() {
            run.stop.stop();
            let report = (&mut run.future).await;
            runner.finish(&mut state, &mut ledger, run, report);
        }
        runner.detach_bridge().await;
        info!("session closed");
    }
}

/// Polls the active run. Pends forever when there is none so `select!`
/// only waits on the inbox.
async fn drive(active: &mut Option<ActiveRun<'_>>) -> RunReport {
    match active {
        Some(run) => (&mut run.future).await,
        None => std::future::pending().await,
    }
}

impl<S, C, St> Runner<S, C, St>
where
    S: Surface,
    C: CardSource,
    St: Store,
{
    /// Validate settings and set up a run. Fails with
    /// [`Error::InvalidRunState`] before anything is touched.
    fn begin(&self, cursor: Option<usize>) -> Result<ActiveRun<'_>> {
        let mut settings = self.store.load_settings()?;
        if let Some(cursor) = cursor {
            settings.cursor = cursor;
        }
        let identifiers = settings.identifiers();
        let identifier = ledger::next_identifier(&identifiers, settings.cursor)
            .ok_or_else(|| Error::InvalidRunState("identifier list is empty".into()))?
            .to_string();

        info!("starting run for {}", identifier);
        let stop = StopSignal::new();
        let future = Box::pin(self.run(identifier.clone(), settings.clone(), stop.clone()));
        Ok(ActiveRun {
            identifier,
            cursor: settings.cursor,
            list_len: identifiers.len(),
            stop,
            future,
        })
    }

    /// Record the run, advance the cursor, and return to idle. Persistence
    /// failures are logged and do not affect the session.
    fn finish(
        &self,
        state: &mut SessionState,
        ledger: &mut Ledger,
        run: ActiveRun<'_>,
        report: RunReport,
    ) {
        ledger.record(RunResult::now(
            run.identifier.clone(),
            report.card_suffix.clone(),
            report.outcome,
        ));
        if let Err(e) = self.store.save_history(ledger) {
            warn!("{}", e);
        }

        let cursor = ledger::advance(run.cursor, run.list_len);
        state.cursor = Some(cursor);
        // Only write the cursor back into freshly loaded settings so a failed
        // read never replaces the user's values with defaults.
        match self.store.load_settings() {
            Ok(mut settings) => {
                settings.cursor = cursor;
                if let Err(e) = self.store.save_settings(&settings) {
                    warn!("cursor kept in memory only: {}", e);
                }
            }
            Err(e) => warn!("could not reload settings, cursor kept in memory only: {}", e),
        }

        state.phase = if report.stopped {
            Phase::Stopped
        } else {
            Phase::Idle
        };
        state.identifier = None;
        if report.outcome == Outcome::Failed {
            self.step.send_replace(Step::Idle);
        }

        let message = if report.stopped {
            format!("run for {} stopped", run.identifier)
        } else {
            format!("run for {} finished: {:?}", run.identifier, report.outcome)
        };
        self.report(StatusUpdate {
            step: self.step.borrow().number(),
            message,
            is_error: report.outcome == Outcome::Failed,
        });
    }

    async fn detach_bridge(&self) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        let request = BridgeRequest::DetachBridge {
            target: bridge.target.clone(),
        };
        match bridge
            .link
            .request(request, self.config.timing.request_timeout())
            .await
        {
            Ok(response) if response.success => debug!("bridge detached from {}", bridge.target),
            Ok(response) => warn!("bridge detach failed: {:?}", response.error),
            Err(e) => warn!("bridge detach failed: {}", e),
        }
    }
}

/// Controller side of a [`Session`]. Dropping every clone ends the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    control: Requester<ControlRequest, ControlResponse>,
    updates: broadcast::Sender<StatusUpdate>,
    timeout: Duration,
}

impl SessionHandle {
    /// Send any control request and wait for its response.
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        self.control.request(request, self.timeout).await
    }

    /// Start a run. `false` when one is already active or settings are unusable.
    pub async fn start(&self) -> Result<bool> {
        self.ack(ControlRequest::StartAutomation).await
    }

    /// Stop the active run. `false` when nothing was running.
    pub async fn stop(&self) -> Result<bool> {
        self.ack(ControlRequest::StopAutomation).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        match self.request(ControlRequest::GetStatus).await? {
            ControlResponse::Status(status) => Ok(status),
            other => Err(unexpected("GET_STATUS", &other)),
        }
    }

    /// Check that the submit control is present and enabled. Never clicks it.
    pub async fn verify_submit_ready(&self) -> Result<(bool, String)> {
        match self.request(ControlRequest::VerifySubmitReady).await? {
            ControlResponse::SubmitReady { ready, detail } => Ok((ready, detail)),
            other => Err(unexpected("VERIFY_SUBMIT_READY", &other)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    async fn ack(&self, request: ControlRequest) -> Result<bool> {
        let kind = format!("{:?}", request);
        match self.request(request).await? {
            ControlResponse::Ack { success } => Ok(success),
            other => Err(unexpected(&kind, &other)),
        }
    }
}

fn unexpected(request: &str, response: &ControlResponse) -> Error {
    Error::InvalidRunState(format!("unexpected response to {}: {:?}", request, response))
}
