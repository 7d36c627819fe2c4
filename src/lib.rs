//! # eoka-checkout
//!
//! Checkout-form automation. Fills an identifier field, advances past a
//! validation gate, populates a payment form (reaching into embedded frames
//! over CDP when same-origin access is denied) and stops before the final
//! submission.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eoka_checkout::{CheckoutConfig, FileStore, Session, StatusUpdate};
//! # use eoka_checkout::{CardRecord, CardSource, Expiry};
//! # struct Generator;
//! # impl CardSource for Generator {
//! #     fn generate(&self, _pattern: &str) -> eoka_checkout::Result<CardRecord> {
//! #         Ok(CardRecord::new("4242424242424242", "visa", Expiry::new(12, 2030), "123"))
//! #     }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() -> eoka_checkout::Result<()> {
//! let config = CheckoutConfig::load("checkout.yaml")?;
//! let (_browser, page) = eoka_checkout::browser::launch(&config).await?;
//! // Waits wake on DOM mutations reported over `bridge.endpoint`.
//! let page = eoka_checkout::browser::observe(page, &config).await?;
//! let store = FileStore::new(".eoka-checkout")?;
//!
//! let (session, handle) = Session::builder(config, page, Generator, store).build();
//! let controller = async {
//!     handle.start().await?;
//!     let mut updates = handle.subscribe();
//!     while let Ok(StatusUpdate { step, message, .. }) = updates.recv().await {
//!         println!("[step {step}] {message}");
//!     }
//!     Ok::<_, eoka_checkout::Error>(())
//! };
//! let (_, result) = tokio::join!(session.serve(), controller);
//! result
//! # }
//! ```

pub mod bridge;
pub mod browser;
mod card;
pub mod channel;
mod config;
mod inject;
mod ledger;
mod message;
mod script;
mod session;
mod store;
mod surface;
mod waiter;

#[cfg(test)]
mod testing;

pub use bridge::{
    Bridge, BridgeError, BridgeHost, BridgeLink, CdpDebugger, Debugger, Detached, FrameDescriptor,
    FrameFill, FrameNode,
};
pub use card::{CardRecord, CardSource, Expiry, FormValues};
pub use config::{
    BridgeConfig, BrowserConfig, CardField, CheckoutConfig, FrameSelectors, PanelSelectors,
    Selectors, TargetUrl, Timing, TypingConfig, Viewport,
};
pub use inject::{InjectMode, Injector, Pacing};
pub use ledger::{Ledger, Outcome, RunResult, LEDGER_CAPACITY};
pub use message::{
    BridgeRequest, BridgeResponse, ControlRequest, ControlResponse, SessionStatus, StatusUpdate,
};
pub use session::{ManualEntry, Phase, Session, SessionBuilder, SessionHandle, Step};
pub use store::{FileStore, MemoryStore, Settings, Store};
pub use surface::{ElementState, FieldEvent, ObservedPage, Surface};
pub use waiter::{Detection, StopSignal, Waiter};

/// Result type for eoka-checkout operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving a checkout.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("timed out after {waited_ms}ms waiting for {what}")]
    ConditionTimeout { what: String, waited_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("field '{0}' not found")]
    FieldNotFound(String),

    #[error("field '{0}' is empty after injection")]
    ValueRejected(String),

    #[error("invalid run state: {0}")]
    InvalidRunState(String),

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    #[error("card source error: {0}")]
    CardSource(String),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("channel closed")]
    ChannelClosed,
}

/// Install a compact `tracing` subscriber for hosts embedding the crate.
///
/// `verbosity` 0 logs warnings, 1 info, 2+ debug; `quiet` limits to errors.
pub fn init_tracing(verbosity: u8, quiet: bool) {
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;

    let level = if quiet {
        Level::ERROR
    } else {
        match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();
}
