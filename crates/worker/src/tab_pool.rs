use anyhow::Result;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptions};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tab_relay_common::{StealthLevel, TabPoolConfig, WorkerId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Launch flags for a long-running tab host
pub fn chrome_args(config: &TabPoolConfig) -> Vec<&'static OsStr> {
    let mut args: Vec<&'static OsStr> = vec![
        // Required for running as root inside containers
        OsStr::new("--no-sandbox"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--no-first-run"),
        OsStr::new("--no-default-browser-check"),
        // Challenge scripts keep running in background tabs
        OsStr::new("--disable-background-timer-throttling"),
        OsStr::new("--disable-backgrounding-occluded-windows"),
        OsStr::new("--disable-renderer-backgrounding"),
        OsStr::new("--js-flags=--max-old-space-size=512"),
    ];

    if config.stealth == StealthLevel::Basic {
        args.push(OsStr::new("--disable-blink-features=AutomationControlled"));
        args.push(OsStr::new("--exclude-switches=enable-automation"));
        if !config.headless {
            args.push(OsStr::new("--disable-infobars"));
        }
    }

    args
}

/// One browser process and the tabs opened in it, keyed by worker id
pub struct TabPool {
    browser: Arc<Browser>,
    tabs: RwLock<HashMap<WorkerId, Arc<Tab>>>,
    config: TabPoolConfig,
    next_id: AtomicU64,
}

impl TabPool {
    pub async fn launch(config: TabPoolConfig) -> Result<Self> {
        let chrome_args = chrome_args(&config);
        if config.headless {
            info!(
                "Launching Chrome in HEADLESS mode (faster, more detectable) with {} args",
                chrome_args.len()
            );
        } else {
            info!(
                "Launching Chrome in HEADFULL mode (slower, better stealth) with {} args",
                chrome_args.len()
            );
        }

        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(config.headless)
            .window_size(Some(config.window_size))
            // Tabs sit idle between jobs; the default 30s idle timeout would
            // close the CDP connection under them
            .idle_browser_timeout(Duration::from_secs(3600))
            .args(chrome_args);

        if let Some(ref browser_path) = config.browser_path {
            info!("Using custom browser binary: {}", browser_path.display());
            launch_builder.path(Some(browser_path.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build launch options: {}", e))?;

        let browser = tokio::task::spawn_blocking(move || Browser::new(launch_options))
            .await?
            .map_err(|e| {
                tracing::error!(
                    "FATAL: Browser failed to launch. Error: {}. \
                     Check that the browser binary exists, has correct permissions \
                     and that its shared libraries are installed.",
                    e
                );
                e
            })?;
        info!("Browser process launched successfully");

        Ok(Self {
            browser: Arc::new(browser),
            tabs: RwLock::new(HashMap::new()),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &TabPoolConfig {
        &self.config
    }

    /// Open a tab and navigate it to `address`. Returns once the navigation
    /// finished (or failed).
    pub async fn open_tab(&self, address: &str) -> Result<(WorkerId, Arc<Tab>)> {
        let worker_id = format!("tab-{}", self.next_id.fetch_add(1, Ordering::SeqCst));

        let browser = self.browser.clone();
        let stealth = self.config.stealth;
        let headless = self.config.headless;
        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser.new_tab()?;
            if stealth == StealthLevel::Basic && headless {
                if let Err(e) = override_user_agent(&tab) {
                    warn!("Failed to override user agent: {}", e);
                }
            }
            Ok(tab)
        })
        .await??;

        self.tabs.write().await.insert(worker_id.clone(), tab.clone());
        info!(worker_id = %worker_id, "Opened tab for {}", address);

        if let Err(e) = self.navigate(&tab, address).await {
            self.close(&worker_id).await;
            return Err(e);
        }
        Ok((worker_id, tab))
    }

    async fn navigate(&self, tab: &Arc<Tab>, address: &str) -> Result<()> {
        let tab_clone = tab.clone();
        let url = address.to_string();
        let navigate_handle = tokio::task::spawn_blocking(move || {
            tab_clone.navigate_to(&url)?.wait_until_navigated()?;
            Ok::<_, anyhow::Error>(())
        });

        match tokio::time::timeout(self.config.navigation_timeout, navigate_handle).await {
            Ok(joined) => joined?,
            Err(_) => anyhow::bail!(
                "Navigation to {} stuck - hard timeout after {:?}",
                address,
                self.config.navigation_timeout
            ),
        }
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<Tab>> {
        self.tabs.read().await.get(worker_id).cloned()
    }

    /// Reload bypassing the cache, waiting for the navigation to settle
    pub async fn reload(&self, worker_id: &str) -> Result<()> {
        let Some(tab) = self.get(worker_id).await else {
            anyhow::bail!("Unknown worker {}", worker_id);
        };

        let reload_handle = tokio::task::spawn_blocking(move || {
            tab.reload(true, None)?.wait_until_navigated()?;
            Ok::<_, anyhow::Error>(())
        });
        match tokio::time::timeout(self.config.navigation_timeout, reload_handle).await {
            Ok(joined) => joined?,
            Err(_) => anyhow::bail!(
                "Reload of {} stuck - hard timeout after {:?}",
                worker_id,
                self.config.navigation_timeout
            ),
        }
    }

    /// Forget the tab and close it; returns false when it was not known
    pub async fn close(&self, worker_id: &str) -> bool {
        let Some(tab) = self.tabs.write().await.remove(worker_id) else {
            return false;
        };
        let id = worker_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = tab.close(false) {
                debug!(worker_id = %id, "Closing tab failed: {}", e);
            }
        });
        true
    }

    pub async fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.tabs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Replace `HeadlessChrome` in the user agent with `Chrome`
fn override_user_agent(tab: &Tab) -> Result<()> {
    let result = tab
        .evaluate("navigator.userAgent", false)
        .map_err(|e| anyhow::anyhow!("Failed to evaluate navigator.userAgent: {}", e))?;
    let Some(original) = result.value.as_ref().and_then(|v| v.as_str()) else {
        anyhow::bail!("Could not extract UA string from navigator.userAgent");
    };
    let corrected = original.replace("HeadlessChrome", "Chrome");

    tab.call_method(Network::SetUserAgentOverride {
        user_agent: corrected.clone(),
        accept_language: None,
        platform: None,
        user_agent_metadata: None,
    })?;
    debug!("Applied User-Agent override via CDP: {}", corrected);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealth_flags_follow_level() {
        let mut config = TabPoolConfig::default();
        let args = chrome_args(&config);
        assert!(args.contains(&OsStr::new("--no-sandbox")));
        assert!(args.contains(&OsStr::new("--disable-blink-features=AutomationControlled")));
        assert!(!args.contains(&OsStr::new("--disable-infobars")));

        config.headless = false;
        assert!(chrome_args(&config).contains(&OsStr::new("--disable-infobars")));

        config.stealth = StealthLevel::Off;
        let args = chrome_args(&config);
        assert!(!args.contains(&OsStr::new("--disable-blink-features=AutomationControlled")));
        assert!(args.contains(&OsStr::new("--disable-background-timer-throttling")));
    }
}
