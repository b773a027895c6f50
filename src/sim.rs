use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::action::{ControlCommand, NavigationCommand};
use crate::driver::{DomNode, Driver, PageState, SnapshotHandle};
use crate::error::{DriverError, LlmError};
use crate::llm::LanguageModel;

// ========================= Simulated Driver =========================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimElement {
    pub tag: String,
    pub text: String,
    pub value: String,
    /// Page loaded when the element is clicked.
    pub on_click: Option<String>,
    /// Page loaded when Enter is pressed while the element holds a value.
    pub on_enter: Option<String>,
}

impl SimElement {
    pub fn new(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self { tag: tag.into(), text: text.into(), ..Default::default() }
    }

    pub fn input() -> Self {
        Self::new("input", "")
    }

    pub fn link_to(mut self, url: impl Into<String>) -> Self {
        self.on_click = Some(url.into());
        self
    }

    pub fn submits_to(mut self, url: impl Into<String>) -> Self {
        self.on_enter = Some(url.into());
        self
    }

    fn outer_html(&self, locator: &str) -> String {
        if self.tag == "input" {
            format!("<input xpath=\"{}\" value=\"{}\">", locator, self.value)
        } else {
            format!("<{tag} xpath=\"{loc}\">{text}</{tag}>", tag = self.tag, loc = locator, text = self.text)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimPage {
    pub url: String,
    pub title: String,
    pub elements: BTreeMap<String, SimElement>,
}

impl SimPage {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self { url: url.into(), title: title.into(), elements: BTreeMap::new() }
    }

    pub fn element(mut self, locator: impl Into<String>, element: SimElement) -> Self {
        self.elements.insert(locator.into(), element);
        self
    }

    fn render(&self) -> String {
        let body: String = self
            .elements
            .iter()
            .map(|(loc, el)| el.outer_html(loc))
            .collect::<Vec<_>>()
            .join("\n");
        format!("<html><head><title>{}</title></head><body>\n{}\n</body></html>", self.title, body)
    }
}

#[derive(Clone, Debug, Default)]
struct SimSession {
    history: Vec<SimPage>,
    scroll_y: i64,
    events: Vec<String>,
}

impl SimSession {
    fn current(&self) -> Result<&SimPage, DriverError> {
        self.history.last().ok_or(DriverError::NoPage)
    }

    fn current_mut(&mut self) -> Result<&mut SimPage, DriverError> {
        self.history.last_mut().ok_or(DriverError::NoPage)
    }
}

/// Misbehaviour a real browser can show, switched on per driver.
#[derive(Clone, Debug, Default)]
struct Faults {
    interact_delay: Option<Duration>,
    stalled_restore: bool,
    lossy_restore: bool,
}

/// Deterministic driver over a fixed set of pages.
pub struct SimulatedDriver {
    site: BTreeMap<String, SimPage>,
    session: Mutex<SimSession>,
    snapshots: Mutex<HashMap<SnapshotHandle, SimSession>>,
    faults: Faults,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            site: BTreeMap::new(),
            session: Mutex::new(SimSession::default()),
            snapshots: Mutex::new(HashMap::new()),
            faults: Faults::default(),
        }
    }

    pub fn with_page(mut self, page: SimPage) -> Self {
        self.site.insert(page.url.clone(), page);
        self
    }

    /// Every `interact` call takes `delay` before touching the page.
    pub fn with_interact_delay(mut self, delay: Duration) -> Self {
        self.faults.interact_delay = Some(delay);
        self
    }

    /// `restore` never completes.
    pub fn with_stalled_restore(mut self) -> Self {
        self.faults.stalled_restore = true;
        self
    }

    /// `restore` reloads pages from the site, dropping typed values.
    pub fn with_lossy_restore(mut self) -> Self {
        self.faults.lossy_restore = true;
        self
    }

    /// Journal of state-changing interactions on the live session.
    pub async fn events(&self) -> Vec<String> {
        self.session.lock().await.events.clone()
    }

    pub async fn current_url(&self) -> Option<String> {
        self.session.lock().await.history.last().map(|p| p.url.clone())
    }

    pub async fn live_snapshots(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    fn load(&self, url: &str) -> SimPage {
        self.site.get(url).cloned().unwrap_or_else(|| SimPage::new(url, ""))
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let page = self.load(url);
        let mut s = self.session.lock().await;
        s.history.push(page);
        s.scroll_y = 0;
        s.events.push(format!("navigate {}", url));
        Ok(())
    }

    async fn find(&self, locator: &str) -> Result<DomNode, DriverError> {
        let s = self.session.lock().await;
        let el = s
            .current()?
            .elements
            .get(locator)
            .ok_or_else(|| DriverError::NotFound(locator.to_string()))?;
        Ok(DomNode {
            locator: locator.to_string(),
            tag: Some(el.tag.clone()),
            text: el.text.clone(),
            outer_html: el.outer_html(locator),
        })
    }

    async fn interact(
        &self,
        command: NavigationCommand,
        locator: &str,
        value: Option<&str>,
    ) -> Result<(), DriverError> {
        if let Some(delay) = self.faults.interact_delay {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.session.lock().await;
        let mut next_url = None;
        match command {
            NavigationCommand::Pass => return Ok(()),
            NavigationCommand::Back => {
                if s.history.len() < 2 {
                    return Err(DriverError::CannotGoBack);
                }
                s.history.pop();
            }
            NavigationCommand::SwitchTab => {
                if value.unwrap_or("0").trim() != "0" {
                    return Err(DriverError::Other(format!("no tab {}", value.unwrap_or_default())));
                }
            }
            NavigationCommand::Scroll => {
                s.scroll_y += value.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(500);
            }
            _ => {
                let page = s.current_mut()?;
                let el = page
                    .elements
                    .get_mut(locator)
                    .ok_or_else(|| DriverError::NotFound(locator.to_string()))?;
                match command {
                    NavigationCommand::Click => next_url = el.on_click.clone(),
                    NavigationCommand::SetValue => el.value = value.unwrap_or_default().to_string(),
                    NavigationCommand::SetValueAndEnter => {
                        el.value = value.unwrap_or_default().to_string();
                        next_url = el.on_enter.clone();
                    }
                    NavigationCommand::TypeKey => {
                        if value.map(|k| k.eq_ignore_ascii_case("enter")).unwrap_or(false) {
                            next_url = el.on_enter.clone();
                        }
                    }
                    _ => {}
                }
            }
        }
        let entry = match value {
            Some(v) => format!("{} {} = {}", command_name(command), locator, v),
            None => format!("{} {}", command_name(command), locator),
        };
        s.events.push(entry);
        if let Some(url) = next_url {
            let page = self.load(&url);
            s.history.push(page);
            s.scroll_y = 0;
        }
        Ok(())
    }

    async fn control(&self, command: ControlCommand, value: Option<&str>) -> Result<(), DriverError> {
        match command {
            ControlCommand::Back => self.interact(NavigationCommand::Back, "", None).await,
            ControlCommand::SwitchTab => self.interact(NavigationCommand::SwitchTab, "", value).await,
            ControlCommand::ScrollDown => self.interact(NavigationCommand::Scroll, "", Some(value.unwrap_or("500"))).await,
            ControlCommand::ScrollUp => {
                let amount = value.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(500);
                self.interact(NavigationCommand::Scroll, "", Some(&(-amount).to_string())).await
            }
            ControlCommand::Wait => Ok(()),
        }
    }

    async fn page_state(&self) -> Result<PageState, DriverError> {
        let s = self.session.lock().await;
        let page = s.current()?;
        Ok(PageState {
            url: page.url.clone(),
            title: Some(page.title.clone()),
            html: page.render(),
            screenshot_b64: None,
            tab_count: 1,
        })
    }

    async fn snapshot(&self) -> Result<SnapshotHandle, DriverError> {
        let state = self.session.lock().await.clone();
        let handle = SnapshotHandle::new();
        self.snapshots.lock().await.insert(handle.clone(), state);
        Ok(handle)
    }

    async fn restore(&self, handle: &SnapshotHandle) -> Result<(), DriverError> {
        if self.faults.stalled_restore {
            std::future::pending::<()>().await;
        }
        let mut saved = self
            .snapshots
            .lock()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| DriverError::UnknownSnapshot(handle.0.clone()))?;
        if self.faults.lossy_restore {
            for page in saved.history.iter_mut() {
                *page = self.load(&page.url);
            }
        }
        *self.session.lock().await = saved;
        Ok(())
    }

    async fn release(&self, handle: &SnapshotHandle) {
        self.snapshots.lock().await.remove(handle);
    }
}

fn command_name(command: NavigationCommand) -> &'static str {
    match command {
        NavigationCommand::Click => "click",
        NavigationCommand::Hover => "hover",
        NavigationCommand::SetValue => "set_value",
        NavigationCommand::SetValueAndEnter => "set_value_and_enter",
        NavigationCommand::TypeKey => "type_key",
        NavigationCommand::Scroll => "scroll",
        NavigationCommand::SwitchTab => "switch_tab",
        NavigationCommand::Back => "back",
        NavigationCommand::Pass => "pass",
    }
}

// ========================= Scripted Model =========================

type Responder = dyn Fn(&str) -> Result<String, LlmError> + Send + Sync;

/// Language model that replays queued answers, or answers through a closure
/// once the queue is empty. Every prompt is recorded.
#[derive(Clone)]
pub struct ScriptedModel {
    queue: Arc<Mutex<VecDeque<Result<String, LlmError>>>>,
    fallback: Option<Arc<Responder>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: Arc::new(Mutex::new(answers.into_iter().map(|a| Ok(a.into())).collect())),
            fallback: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self { queue: Arc::new(Mutex::new(VecDeque::new())), fallback: Some(Arc::new(f)), prompts: Arc::new(Mutex::new(Vec::new())) }
    }

    pub async fn push_error(&self, error: LlmError) {
        self.queue.lock().await.push_back(Err(error));
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().await.push(prompt.to_string());
        if let Some(next) = self.queue.lock().await.pop_front() {
            return next;
        }
        match &self.fallback {
            Some(f) => f(prompt),
            None => Err(LlmError::Exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> SimulatedDriver {
        SimulatedDriver::new()
            .with_page(
                SimPage::new("https://shop.test", "Shop")
                    .element("//input[@id='search']", SimElement::input().submits_to("https://shop.test/results"))
                    .element("//a[@id='about']", SimElement::new("a", "About").link_to("https://shop.test/about")),
            )
            .with_page(SimPage::new("https://shop.test/results", "Results").element("//li[1]", SimElement::new("li", "red candle")))
    }

    #[tokio::test]
    async fn enter_on_input_follows_submit_target() {
        let d = driver();
        d.navigate("https://shop.test").await.unwrap();
        d.interact(NavigationCommand::SetValueAndEnter, "//input[@id='search']", Some("candle"))
            .await
            .unwrap();
        assert_eq!(d.current_url().await.as_deref(), Some("https://shop.test/results"));
        d.interact(NavigationCommand::Back, "", None).await.unwrap();
        let page = d.page_state().await.unwrap();
        assert!(page.html.contains("value=\"candle\""));
    }

    #[tokio::test]
    async fn missing_locator_is_reported() {
        let d = driver();
        d.navigate("https://shop.test").await.unwrap();
        let err = d.interact(NavigationCommand::Click, "//button", None).await.unwrap_err();
        assert_eq!(err, DriverError::NotFound("//button".into()));
        assert_eq!(d.interact(NavigationCommand::Back, "", None).await, Err(DriverError::CannotGoBack));
    }

    #[tokio::test]
    async fn restore_rewinds_session() {
        let d = driver();
        d.navigate("https://shop.test").await.unwrap();
        let snap = d.snapshot().await.unwrap();
        d.interact(NavigationCommand::Click, "//a[@id='about']", None).await.unwrap();
        assert_eq!(d.current_url().await.as_deref(), Some("https://shop.test/about"));
        d.restore(&snap).await.unwrap();
        assert_eq!(d.current_url().await.as_deref(), Some("https://shop.test"));
        d.release(&snap).await;
        assert_eq!(d.live_snapshots().await, 0);
        assert!(d.restore(&snap).await.is_err());
    }

    #[tokio::test]
    async fn lossy_restore_forgets_typed_values() {
        let d = driver().with_lossy_restore();
        d.navigate("https://shop.test").await.unwrap();
        let snap = d.snapshot().await.unwrap();
        d.interact(NavigationCommand::SetValue, "//input[@id='search']", Some("candle")).await.unwrap();
        assert!(d.page_state().await.unwrap().html.contains("value=\"candle\""));
        let typed = d.snapshot().await.unwrap();
        d.restore(&typed).await.unwrap();
        assert!(!d.page_state().await.unwrap().html.contains("value=\"candle\""));
        d.restore(&snap).await.unwrap();
        assert_eq!(d.current_url().await.as_deref(), Some("https://shop.test"));
    }

    #[tokio::test]
    async fn scripted_model_replays_then_falls_back() {
        let m = ScriptedModel::new(["first"]);
        assert_eq!(m.complete("a").await.unwrap(), "first");
        assert_eq!(m.complete("b").await, Err(LlmError::Exhausted));
        let f = ScriptedModel::from_fn(|p| Ok(p.to_uppercase()));
        assert_eq!(f.complete("hi").await.unwrap(), "HI");
        assert_eq!(f.prompts().await, vec!["hi".to_string()]);
    }
}
