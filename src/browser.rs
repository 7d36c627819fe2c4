//! Launching the stealth browser a session drives.

use crate::bridge::CdpDebugger;
use crate::config::CheckoutConfig;
use crate::surface::ObservedPage;
use crate::{Error, Result};
use eoka::{Browser, Page};
use tracing::{debug, info};

/// Launch a browser from `config.browser` and open `config.target.url`.
///
/// The returned [`Browser`] must outlive the page.
pub async fn launch(config: &CheckoutConfig) -> Result<(Browser, Page)> {
    let browser_config = &config.browser;
    let stealth = eoka::StealthConfig {
        headless: browser_config.headless,
        proxy: browser_config.proxy.clone(),
        user_agent: browser_config.user_agent.clone(),
        viewport_width: browser_config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
        viewport_height: browser_config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
        ..Default::default()
    };

    debug!(
        "Launching browser (headless: {}, proxy: {:?})",
        browser_config.headless, browser_config.proxy
    );
    let browser = Browser::launch_with_config(stealth).await?;
    let page = browser.new_page(&config.target.url).await?;
    info!("opened {} for '{}'", config.target.url, config.name);

    Ok((browser, page))
}

/// Pair `page` with a mutation feed from `config.bridge.endpoint`, the
/// browser-level debugger URL of the browser hosting the page.
pub async fn observe(page: Page, config: &CheckoutConfig) -> Result<ObservedPage> {
    let endpoint = config
        .bridge
        .endpoint
        .as_deref()
        .ok_or_else(|| Error::Config("bridge.endpoint is required to observe mutations".into()))?;
    let debugger = CdpDebugger::connect(endpoint).await?;
    ObservedPage::new(page, debugger).await
}
