//! The checkout steps.
//!
//! Steps run strictly in order. Identifier and gate failures end the run,
//! since the payment panel is only reachable through the gate. Inside the
//! payment step every field is attempted whatever happened to the others.

use super::{RunReport, Runner, Step};
use crate::card::{CardRecord, CardSource, FormValues};
use crate::config::CardField;
use crate::inject::InjectMode;
use crate::ledger::Outcome;
use crate::message::{BridgeRequest, StatusUpdate};
use crate::store::{Settings, Store};
use crate::surface::Surface;
use crate::waiter::{probe_quiet, Detection, StopSignal, Waiter};
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// How a card field ended up filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillPath {
    Direct,
    Bridge,
    Manual,
    Failed,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::Idle => "setup",
            Step::Identifier => "identifier",
            Step::Gate => "gate",
            Step::Payment => "payment",
            Step::ManualSubmitReady => "submit readiness",
        }
    }
}

fn card_value(card: &CardRecord, field: CardField) -> &str {
    match field {
        CardField::Number => &card.number,
        CardField::Expiry => &card.formatted_expiry,
        CardField::Cvc => &card.verification_code,
    }
}

impl<S, C, St> Runner<S, C, St>
where
    S: Surface,
    C: CardSource,
    St: Store,
{
    pub(super) async fn run(&self, identifier: String, settings: Settings, stop: StopSignal) -> RunReport {
        let card = match self.cards.generate(&settings.pattern) {
            Ok(card) => card,
            Err(e) => {
                self.report(StatusUpdate::error(Step::Idle.number(), format!("card source failed: {}", e)));
                return RunReport {
                    outcome: Outcome::Failed,
                    card_suffix: String::new(),
                    stopped: stop.is_stopped(),
                };
            }
        };
        let card_suffix = card.suffix();
        debug!("run card ending {}", card_suffix);

        let waiter = Waiter::new(
            Detection::for_surface(&self.surface, self.config.timing.poll()),
            stop.clone(),
        );
        let result = self
            .steps(&waiter, &identifier, &card, &settings.form_values())
            .await;

        match result {
            Ok(outcome) => RunReport {
                outcome,
                card_suffix,
                stopped: stop.is_stopped(),
            },
            Err(Error::Cancelled) => RunReport {
                outcome: Outcome::Failed,
                card_suffix,
                stopped: true,
            },
            Err(e) => {
                let step = *self.step.borrow();
                self.report(StatusUpdate::error(
                    step.number(),
                    format!("{} step failed: {}", step.label(), e),
                ));
                RunReport {
                    outcome: Outcome::Failed,
                    card_suffix,
                    stopped: stop.is_stopped(),
                }
            }
        }
    }

    async fn steps(
        &self,
        waiter: &Waiter,
        identifier: &str,
        card: &CardRecord,
        form: &FormValues,
    ) -> Result<Outcome> {
        let entry = self.resolve_entry().await;
        if entry != Step::Payment {
            self.identifier_step(waiter, identifier).await?;
            self.gate_step(waiter).await?;
        } else {
            info!("payment panel already active, resuming at step 3");
        }
        self.payment_step(waiter, card, form).await
    }

    /// Step to start from, judged by which panel is active.
    async fn resolve_entry(&self) -> Step {
        if let Some(panel) = &self.config.selectors.panels.payment {
            if probe_quiet(&self.surface, panel)
                .await
                .is_some_and(|el| el.rendered)
            {
                return Step::Payment;
            }
        }
        Step::Identifier
    }

    pub(super) async fn identifier_step(&self, waiter: &Waiter, identifier: &str) -> Result<()> {
        self.enter(Step::Identifier, format!("filling identifier {}", identifier));
        let timing = &self.config.timing;
        let selectors = &self.config.selectors;

        if let Some(panel) = &selectors.panels.contact {
            waiter
                .wait_for_element(&self.surface, panel, timing.element_timeout())
                .await?;
        }
        waiter
            .wait_for_element(&self.surface, &selectors.identifier, timing.element_timeout())
            .await?;
        self.injector
            .set_value(
                &self.surface,
                &selectors.identifier,
                identifier,
                InjectMode::Typed,
                waiter.stop_signal(),
            )
            .await?;
        Ok(())
    }

    pub(super) async fn gate_step(&self, waiter: &Waiter) -> Result<()> {
        self.enter(Step::Gate, "waiting for the continue control");
        let timing = &self.config.timing;
        let gate = &self.config.selectors.gate;

        waiter
            .wait_for_element(&self.surface, gate, timing.element_timeout())
            .await?;
        let what = format!("gate '{}' enabled", gate);
        waiter
            .wait_for_condition(&what, || self.gate_open(), timing.gate_timeout())
            .await?;

        self.surface.click(gate).await?;
        waiter.stop_signal().sleep(timing.transition()).await?;
        Ok(())
    }

    /// Gate is visible, enabled, and no validation error is showing.
    async fn gate_open(&self) -> bool {
        let selectors = &self.config.selectors;
        let gate_ready = probe_quiet(&self.surface, &selectors.gate)
            .await
            .is_some_and(|el| el.rendered && el.enabled);
        if !gate_ready {
            return false;
        }
        match &selectors.gate_error {
            Some(marker) => !probe_quiet(&self.surface, marker)
                .await
                .is_some_and(|el| el.rendered),
            None => true,
        }
    }

    pub(super) async fn payment_step(
        &self,
        waiter: &Waiter,
        card: &CardRecord,
        form: &FormValues,
    ) -> Result<Outcome> {
        self.enter(Step::Payment, format!("filling card ending {}", card.suffix()));
        let timing = &self.config.timing;
        let selectors = &self.config.selectors;

        if let Some(panel) = &selectors.panels.payment {
            waiter
                .wait_for_element(&self.surface, panel, timing.element_timeout())
                .await?;
        }

        let mut failed: Vec<&str> = Vec::new();
        let mut out_of_band: Vec<&str> = Vec::new();
        let mut card_failed = false;
        for field in CardField::ALL {
            match self.fill_card_field(waiter, field, card_value(card, field)).await? {
                FillPath::Direct => {}
                FillPath::Bridge | FillPath::Manual => out_of_band.push(field.label()),
                FillPath::Failed => {
                    card_failed = true;
                    failed.push(field.label());
                }
            }
        }

        let full_name = form.full_name();
        let extras = [
            ("cardholder name", selectors.cardholder_name.as_deref(), full_name.as_str()),
            ("postal code", selectors.postal_code.as_deref(), form.postal_code.as_str()),
        ];
        for (label, selector, value) in extras {
            let Some(selector) = selector else { continue };
            if value.trim().is_empty() {
                debug!("no {} configured, skipping", label);
                continue;
            }
            match self.fill_direct(waiter, selector, value).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{} not filled: {}", label, e);
                    failed.push(label);
                }
            }
        }

        if !failed.is_empty() {
            self.report(StatusUpdate::error(
                Step::Payment.number(),
                format!("could not fill: {}", failed.join(", ")),
            ));
        }

        let outcome = if card_failed {
            Outcome::Failed
        } else if !out_of_band.is_empty() || !failed.is_empty() {
            Outcome::Partial
        } else {
            Outcome::Success
        };

        if outcome != Outcome::Failed {
            let mut message = String::from("ready for manual submission");
            if !out_of_band.is_empty() {
                message.push_str(&format!(" (filled out of band: {})", out_of_band.join(", ")));
            }
            self.enter(Step::ManualSubmitReady, message);
        }
        Ok(outcome)
    }

    /// Direct injection, then the bridge, then manual entry. Only a stop
    /// request is returned as an error.
    async fn fill_card_field(&self, waiter: &Waiter, field: CardField, value: &str) -> Result<FillPath> {
        let timing = &self.config.timing;
        let selectors = &self.config.selectors;
        let stop = waiter.stop_signal();
        let direct = selectors.direct(field);

        match waiter
            .wait_for_element(&self.surface, direct, timing.direct_probe())
            .await
        {
            Ok(_) => match self
                .injector
                .set_value(&self.surface, direct, value, InjectMode::Typed, stop)
                .await
            {
                Ok(_) => {
                    info!("{} filled directly", field.label());
                    return Ok(FillPath::Direct);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("{} direct injection failed: {}", field.label(), e),
            },
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => debug!("{} not reachable directly: {}", field.label(), e),
        }

        if let Some(bridge) = &self.bridge {
            let request = BridgeRequest::FillFrameField {
                target: bridge.target.clone(),
                selector: selectors.in_frame(field).to_string(),
                value: value.to_string(),
            };
            let response = tokio::select! {
                _ = stop.stopped() => return Err(Error::Cancelled),
                response = bridge.link.request(request, timing.bridge_timeout()) => response,
            };
            match response {
                Ok(r) if r.success => {
                    info!(
                        "{} filled through bridge in frame {}",
                        field.label(),
                        r.frame_id.as_deref().unwrap_or("?")
                    );
                    return Ok(FillPath::Bridge);
                }
                Ok(r) => warn!(
                    "bridge could not fill {}: {}",
                    field.label(),
                    r.error.as_deref().unwrap_or("unknown error")
                ),
                Err(e) => warn!("bridge request for {} failed: {}", field.label(), e),
            }
        }

        if let Some(manual) = &self.manual {
            match manual.present(field, value) {
                Ok(()) => {
                    info!("{} presented for manual entry", field.label());
                    return Ok(FillPath::Manual);
                }
                Err(e) => warn!("manual entry for {} failed: {}", field.label(), e),
            }
        }

        Ok(FillPath::Failed)
    }

    async fn fill_direct(&self, waiter: &Waiter, selector: &str, value: &str) -> Result<()> {
        waiter
            .wait_for_element(&self.surface, selector, self.config.timing.element_timeout())
            .await?;
        self.injector
            .set_value(
                &self.surface,
                selector,
                value,
                InjectMode::Direct,
                waiter.stop_signal(),
            )
            .await?;
        Ok(())
    }

    /// Locate the submit control and report whether it could be pressed.
    pub(super) async fn submit_ready(&self) -> (bool, String) {
        let Some(submit) = &self.config.selectors.submit else {
            return (false, "no submit selector configured".into());
        };
        match probe_quiet(&self.surface, submit).await {
            None => (false, format!("submit control '{}' not found", submit)),
            Some(el) if !el.rendered => (false, format!("submit control '{}' is not visible", submit)),
            Some(el) if !el.enabled => (false, format!("submit control '{}' is disabled", submit)),
            Some(_) => (true, format!("submit control '{}' is ready for manual submission", submit)),
        }
    }
}
