//! Writing values into form controls so that a reactive framework watching
//! them registers the change.

use crate::config::Timing;
use crate::surface::{FieldEvent, Surface};
use crate::waiter::StopSignal;
use crate::{Error, Result};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// How a value is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectMode {
    /// One input notification per character, with human-paced delays.
    Typed,
    /// One input notification carrying the whole value.
    Direct,
}

/// Inter-character delay range for [`InjectMode::Typed`].
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.min(max),
            max,
        }
    }

    fn next_delay(&self) -> Duration {
        let (lo, hi) = (self.min.as_millis() as u64, self.max.as_millis() as u64);
        if lo >= hi {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Native-setter injection followed by the focus/input/change/blur sequence.
#[derive(Debug, Clone)]
pub struct Injector {
    pacing: Pacing,
    settle: Duration,
}

impl Injector {
    pub fn new(pacing: Pacing, settle: Duration) -> Self {
        Self { pacing, settle }
    }

    pub fn from_timing(timing: &Timing) -> Self {
        Self::new(
            Pacing::new(
                Duration::from_millis(timing.typing.min_ms),
                Duration::from_millis(timing.typing.max_ms),
            ),
            timing.settle(),
        )
    }

    /// Inject `value` into `selector` and return what the control holds
    /// afterwards.
    ///
    /// Success means the control is non-empty once the settle delay has
    /// passed. The value is not compared with `value`: input masks reformat
    /// card numbers and dates, so an exact match would reject good fills.
    pub async fn set_value<S: Surface>(
        &self,
        surface: &S,
        selector: &str,
        value: &str,
        mode: InjectMode,
        stop: &StopSignal,
    ) -> Result<String> {
        debug!("inject {:?}: {} ({} chars)", mode, selector, value.chars().count());
        let missing = || Error::FieldNotFound(selector.to_string());

        if !surface.dispatch(selector, &FieldEvent::Focus).await? {
            return Err(missing());
        }

        match mode {
            InjectMode::Typed => {
                let mut chars = value.char_indices().peekable();
                while let Some((i, ch)) = chars.next() {
                    let typed = &value[..i + ch.len_utf8()];
                    if !surface.set_native_value(selector, typed).await? {
                        return Err(missing());
                    }
                    surface
                        .dispatch(selector, &FieldEvent::Input(ch.to_string()))
                        .await?;
                    if chars.peek().is_some() {
                        stop.sleep(self.pacing.next_delay()).await?;
                    }
                }
            }
            InjectMode::Direct => {
                if !surface.set_native_value(selector, value).await? {
                    return Err(missing());
                }
                surface
                    .dispatch(selector, &FieldEvent::Input(value.to_string()))
                    .await?;
            }
        }

        surface.dispatch(selector, &FieldEvent::Change).await?;
        surface.dispatch(selector, &FieldEvent::Blur).await?;
        stop.sleep(self.settle).await?;

        let current = surface.read_value(selector).await?.ok_or_else(missing)?;
        if current.trim().is_empty() {
            return Err(Error::ValueRejected(selector.to_string()));
        }
        Ok(current)
    }
}
