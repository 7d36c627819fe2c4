//! The page-DOM seam the waiter, injector and step machine operate on.

use crate::bridge::CdpDebugger;
use crate::script;
use crate::Result;
use eoka::Page;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Snapshot of one element as seen by the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ElementState {
    /// Has a non-zero layout box (not merely present in markup).
    pub rendered: bool,
    pub enabled: bool,
    #[serde(default)]
    pub value: String,
}

/// DOM notifications emitted during injection, in the order a user would
/// produce them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldEvent {
    Focus,
    /// Text inserted by this input step.
    Input(String),
    Change,
    Blur,
}

impl FieldEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldEvent::Focus => "focus",
            FieldEvent::Input(_) => "input",
            FieldEvent::Change => "change",
            FieldEvent::Blur => "blur",
        }
    }
}

/// A document the checkout can be driven through.
#[allow(async_fn_in_trait)]
pub trait Surface {
    /// Describe the element matching `selector`, `None` when absent.
    async fn probe(&self, selector: &str) -> Result<Option<ElementState>>;

    /// Write through the platform value setter. `false` when absent.
    async fn set_native_value(&self, selector: &str, value: &str) -> Result<bool>;

    /// Dispatch one field event. `false` when absent.
    async fn dispatch(&self, selector: &str, event: &FieldEvent) -> Result<bool>;

    async fn read_value(&self, selector: &str) -> Result<Option<String>>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Subtree mutation feed. `None` means the waiter has to poll.
    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// What the page scripts return. `null` never crosses the protocol because
/// eoka treats a missing value as an evaluation error.
#[derive(Debug, Deserialize)]
struct Found<T> {
    found: bool,
    #[serde(flatten)]
    inner: Option<T>,
}

impl<T> Found<T> {
    fn into_option(self) -> Option<T> {
        if self.found {
            self.inner
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueOnly {
    value: String,
}

impl Surface for Page {
    async fn probe(&self, selector: &str) -> Result<Option<ElementState>> {
        let found: Found<ElementState> = self.evaluate(&script::probe(selector)).await?;
        Ok(found.into_option())
    }

    async fn set_native_value(&self, selector: &str, value: &str) -> Result<bool> {
        Ok(self
            .evaluate(&script::set_native_value(selector, value))
            .await?)
    }

    async fn dispatch(&self, selector: &str, event: &FieldEvent) -> Result<bool> {
        Ok(self.evaluate(&script::dispatch(selector, event)).await?)
    }

    async fn read_value(&self, selector: &str) -> Result<Option<String>> {
        let found: Found<ValueOnly> = self.evaluate(&script::read_value(selector)).await?;
        Ok(found.into_option().map(|v| v.value))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        debug!("click: {}", selector);
        self.human_click(selector).await?;
        Ok(())
    }
}

/// An eoka page whose subtree mutations arrive over a separate CDP
/// connection to the same browser, so waits wake on change instead of
/// polling.
pub struct ObservedPage {
    page: Page,
    changes: broadcast::Receiver<()>,
    _debugger: CdpDebugger,
}

impl ObservedPage {
    /// Install the mutation observer on `page` through `debugger`.
    pub async fn new(page: Page, debugger: CdpDebugger) -> Result<Self> {
        let target = page.target_id().to_string();
        let changes = debugger.watch_mutations(&target).await?;
        Ok(Self {
            page,
            changes,
            _debugger: debugger,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }
}

impl Surface for ObservedPage {
    async fn probe(&self, selector: &str) -> Result<Option<ElementState>> {
        Surface::probe(&self.page, selector).await
    }

    async fn set_native_value(&self, selector: &str, value: &str) -> Result<bool> {
        Surface::set_native_value(&self.page, selector, value).await
    }

    async fn dispatch(&self, selector: &str, event: &FieldEvent) -> Result<bool> {
        Surface::dispatch(&self.page, selector, event).await
    }

    async fn read_value(&self, selector: &str) -> Result<Option<String>> {
        Surface::read_value(&self.page, selector).await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        Surface::click(&self.page, selector).await
    }

    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.resubscribe())
    }
}
