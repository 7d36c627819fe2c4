pub mod schema;

pub use schema::{
    BridgeConfig, BrowserConfig, CardField, CheckoutConfig, FrameSelectors, PanelSelectors,
    Selectors, TargetUrl, Timing, TypingConfig, Viewport,
};
