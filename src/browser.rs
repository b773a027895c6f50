use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{Cookie, CookieParam};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::action::{ControlCommand, NavigationCommand};
use crate::driver::{DomNode, Driver, PageState, SnapshotHandle};
use crate::error::DriverError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    /// Attach a PNG screenshot to every page state.
    pub screenshots: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 800), screenshots: false }
    }
}

/// Restorable session state: where the page was, its cookies, how far it was
/// scrolled and what the form controls held.
#[derive(Clone, Debug)]
struct SavedState {
    url: String,
    cookies: Vec<Cookie>,
    scroll: (f64, f64),
    fields: Vec<FormField>,
}

/// Value of the n-th form control in document order.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct FormField {
    value: String,
    checked: bool,
}

const FORM_CONTROLS: &str = "input, textarea, select";

/// [`Driver`] over a Chromium instance controlled through CDP.
pub struct ChromiumDriver {
    browser: OxideBrowser,
    page: Mutex<Page>,
    cfg: BrowserConfig,
    snapshots: Mutex<HashMap<SnapshotHandle, SavedState>>,
}

fn other(e: impl std::fmt::Display) -> DriverError {
    DriverError::Other(e.to_string())
}

impl ChromiumDriver {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per run, otherwise rapid restarts hit the profile lock.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("glass-scout-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let driver = Self { browser, page: Mutex::new(page), cfg, snapshots: Mutex::new(HashMap::new()) };
        driver.apply_viewport().await?;
        Ok(driver)
    }

    async fn current(&self) -> Page {
        self.page.lock().await.clone()
    }

    async fn apply_viewport(&self) -> Result<()> {
        let (w, h) = self.cfg.viewport;
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(w as i64)
            .height(h as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.current().await.execute(metrics).await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        let page = self.current().await;
        page.goto(url).await?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    async fn element(&self, locator: &str) -> Result<Element, DriverError> {
        self.current()
            .await
            .find_xpath(locator)
            .await
            .map_err(|_| DriverError::NotFound(locator.to_string()))
    }

    async fn eval_unit(&self, js: String) -> Result<()> {
        self.current().await.evaluate(js).await?;
        Ok(())
    }

    async fn scroll_offset(&self) -> Result<(f64, f64)> {
        let v: Vec<f64> = self
            .current()
            .await
            .evaluate("[window.scrollX, window.scrollY]")
            .await?
            .into_value()?;
        Ok((v.first().copied().unwrap_or(0.0), v.get(1).copied().unwrap_or(0.0)))
    }

    async fn form_fields(&self) -> Result<Vec<FormField>> {
        let js = format!(
            "Array.from(document.querySelectorAll('{}')).map(el => ({{ value: String(el.value ?? ''), checked: !!el.checked }}))",
            FORM_CONTROLS
        );
        Ok(self.current().await.evaluate(js).await?.into_value()?)
    }

    async fn refill(&self, fields: &[FormField]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let js = format!(
            "(() => {{ const saved = {}; const els = document.querySelectorAll('{}'); \
             saved.forEach((f, i) => {{ const el = els[i]; if (!el || el.type === 'file') return; \
             if (el.type === 'checkbox' || el.type === 'radio') {{ el.checked = f.checked; }} else {{ el.value = f.value; }} }}); }})()",
            serde_json::to_string(fields)?,
            FORM_CONTROLS
        );
        self.eval_unit(js).await
    }

    async fn screenshot_b64(&self) -> Result<String> {
        let page = self.current().await;
        let take = || async {
            page.screenshot(ScreenshotParamsBuilder::default().full_page(false).omit_background(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(STANDARD.encode(take().await?));
                }
                Err(anyhow::anyhow!(e))
            }
        }
    }

    async fn switch_tab(&self, index: &str) -> Result<(), DriverError> {
        let idx: usize = index.trim().parse().map_err(|_| other(format!("bad tab index `{}`", index)))?;
        let pages = self.browser.pages().await.map_err(other)?;
        let target = pages.into_iter().nth(idx).ok_or_else(|| other(format!("no tab {}", idx)))?;
        target.bring_to_front().await.map_err(other)?;
        *self.page.lock().await = target;
        Ok(())
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        let page = self.current().await;
        let depth: i64 = page
            .evaluate("window.history.length")
            .await
            .map_err(other)?
            .into_value()
            .map_err(other)?;
        if depth < 2 {
            return Err(DriverError::CannotGoBack);
        }
        page.evaluate("window.history.back()").await.map_err(other)?;
        page.wait_for_navigation().await.map_err(other)?;
        Ok(())
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.goto(url).await.map_err(other)
    }

    async fn find(&self, locator: &str) -> Result<DomNode, DriverError> {
        let el = self.element(locator).await?;
        let text = el.inner_text().await.map_err(other)?.unwrap_or_default();
        let outer_html = el.outer_html().await.map_err(other)?.unwrap_or_default();
        let tag = Some(outer_html.trim_start_matches('<').split(|c: char| c.is_whitespace() || c == '>').next().unwrap_or_default().to_lowercase())
            .filter(|t| !t.is_empty());
        Ok(DomNode { locator: locator.to_string(), tag, text: text.trim().to_string(), outer_html })
    }

    async fn interact(
        &self,
        command: NavigationCommand,
        locator: &str,
        value: Option<&str>,
    ) -> Result<(), DriverError> {
        match command {
            NavigationCommand::Pass => Ok(()),
            NavigationCommand::Back => self.go_back().await,
            NavigationCommand::SwitchTab => self.switch_tab(value.unwrap_or("0")).await,
            NavigationCommand::Scroll => {
                let dy: i64 = value.and_then(|v| v.trim().parse().ok()).unwrap_or(500);
                self.eval_unit(format!("window.scrollBy(0, {});", dy)).await.map_err(other)
            }
            NavigationCommand::Click => {
                self.element(locator).await?.click().await.map_err(other)?;
                Ok(())
            }
            NavigationCommand::Hover => {
                self.element(locator).await?.hover().await.map_err(other)?;
                Ok(())
            }
            NavigationCommand::SetValue | NavigationCommand::SetValueAndEnter => {
                let el = self.element(locator).await?;
                el.click().await.map_err(other)?;
                el.call_js_fn("function() { this.value = ''; }", false).await.map_err(other)?;
                el.type_str(value.unwrap_or_default()).await.map_err(other)?;
                if command == NavigationCommand::SetValueAndEnter {
                    el.press_key("Enter").await.map_err(other)?;
                }
                Ok(())
            }
            NavigationCommand::TypeKey => {
                let key = value.unwrap_or("Enter");
                self.element(locator).await?.press_key(key).await.map_err(other)?;
                Ok(())
            }
        }
    }

    async fn control(&self, command: ControlCommand, value: Option<&str>) -> Result<(), DriverError> {
        match command {
            ControlCommand::ScrollDown => self.interact(NavigationCommand::Scroll, "", Some(value.unwrap_or("500"))).await,
            ControlCommand::ScrollUp => {
                let amount: i64 = value.and_then(|v| v.trim().parse().ok()).unwrap_or(500);
                self.interact(NavigationCommand::Scroll, "", Some(&(-amount).to_string())).await
            }
            ControlCommand::Wait => {
                let secs: f64 = value.and_then(|v| v.trim().parse().ok()).unwrap_or(1.0);
                sleep(Duration::from_secs_f64(secs.clamp(0.0, 30.0))).await;
                Ok(())
            }
            ControlCommand::Back => self.go_back().await,
            ControlCommand::SwitchTab => self.switch_tab(value.unwrap_or("0")).await,
        }
    }

    async fn page_state(&self) -> Result<PageState, DriverError> {
        let page = self.current().await;
        let url = page.url().await.map_err(other)?.ok_or(DriverError::NoPage)?;
        let title = page.get_title().await.map_err(other)?;
        let html = page.content().await.map_err(other)?;
        let tab_count = self.browser.pages().await.map(|p| p.len()).unwrap_or(1);
        let screenshot_b64 = if self.cfg.screenshots {
            match self.screenshot_b64().await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };
        Ok(PageState { url, title, html, screenshot_b64, tab_count })
    }

    async fn snapshot(&self) -> Result<SnapshotHandle, DriverError> {
        let page = self.current().await;
        let url = page.url().await.map_err(other)?.ok_or(DriverError::NoPage)?;
        let cookies = page.get_cookies().await.map_err(other)?;
        let scroll = self.scroll_offset().await.map_err(other)?;
        let fields = self.form_fields().await.map_err(other)?;
        let handle = SnapshotHandle::new();
        debug!(handle = %handle.0, url = %url, fields = fields.len(), "snapshot taken");
        self.snapshots.lock().await.insert(handle.clone(), SavedState { url, cookies, scroll, fields });
        Ok(handle)
    }

    async fn restore(&self, handle: &SnapshotHandle) -> Result<(), DriverError> {
        let saved = self
            .snapshots
            .lock()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| DriverError::UnknownSnapshot(handle.0.clone()))?;
        let page = self.current().await;
        let params: Vec<CookieParam> = saved
            .cookies
            .iter()
            .map(|c| {
                let mut p = CookieParam::new(c.name.clone(), c.value.clone());
                p.domain = Some(c.domain.clone());
                p.path = Some(c.path.clone());
                p.secure = Some(c.secure);
                p.http_only = Some(c.http_only);
                p
            })
            .collect();
        if !params.is_empty() {
            page.set_cookies(params).await.map_err(other)?;
        }
        self.goto(&saved.url).await.map_err(other)?;
        self.refill(&saved.fields).await.map_err(other)?;
        let (x, y) = saved.scroll;
        self.eval_unit(format!("window.scrollTo({}, {});", x, y)).await.map_err(other)
    }

    async fn release(&self, handle: &SnapshotHandle) {
        self.snapshots.lock().await.remove(handle);
    }
}
