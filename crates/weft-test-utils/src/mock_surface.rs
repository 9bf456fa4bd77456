use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;

use weft_core::error::{Result, WeftError};
use weft_core::surface::*;
use weft_core::traits::BrowserSurface;

/// An element rendered into snapshots.
#[derive(Debug, Clone)]
pub struct MockElement {
    pub tag: String,
    pub text: String,
    pub attrs: Vec<(String, String)>,
    pub options: Vec<String>,
}

impl MockElement {
    pub fn new(tag: &str, text: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: text.to_string(),
            attrs: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }
}

#[derive(Debug)]
struct PageState {
    url: String,
    title: String,
    history: Vec<String>,
}

/// In-memory browser surface.
pub struct MockSurface {
    id: String,
    elements: Mutex<Vec<MockElement>>,
    missing: Mutex<HashSet<usize>>,
    page: Mutex<PageState>,
    actions: Mutex<Vec<String>>,
    scrolls: AtomicUsize,
    extracts: AtomicUsize,
    snapshots: AtomicUsize,
    with_screenshot: bool,
    events: broadcast::Sender<SurfaceEvent>,
}

impl MockSurface {
    pub fn new(id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.to_string(),
            elements: Mutex::new(vec![
                MockElement::new("a", "Home")
                    .attr("class", "nav-link active")
                    .attr("href", "/home"),
                MockElement::new("img", "Logo").attr("src", "/logo.png"),
                MockElement::new("button", "Search").attr("class", "btn btn-primary"),
                MockElement::new("select", "Size").options(&["S", "M", "L"]),
            ]),
            missing: Mutex::new(HashSet::new()),
            page: Mutex::new(PageState {
                url: "about:blank".to_string(),
                title: "Blank".to_string(),
                history: Vec::new(),
            }),
            actions: Mutex::new(Vec::new()),
            scrolls: AtomicUsize::new(0),
            extracts: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
            with_screenshot: true,
            events,
        }
    }

    /// Snapshots carry no visual capture.
    pub fn without_screenshots(mut self) -> Self {
        self.with_screenshot = false;
        self
    }

    pub fn set_elements(&self, elements: Vec<MockElement>) {
        *self.elements.lock().unwrap() = elements;
    }

    /// Interacting with `index` fails with "element not found".
    pub fn remove_element(&self, index: usize) {
        self.missing.lock().unwrap().insert(index);
    }

    /// Fire a watch event to current subscribers.
    pub fn emit(&self, event: WatchEvent, detail: &str) {
        let _ = self.events.send(SurfaceEvent {
            event,
            detail: detail.to_string(),
        });
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    pub fn extract_count(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }

    fn element(&self, index: usize) -> Result<MockElement> {
        if self.missing.lock().unwrap().contains(&index) {
            return Err(WeftError::ElementNotFound(index));
        }
        self.elements
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or(WeftError::ElementNotFound(index))
    }

    fn render_elements(&self, version: usize) -> String {
        let missing = self.missing.lock().unwrap().clone();
        let mut lines = Vec::new();
        for (i, el) in self.elements.lock().unwrap().iter().enumerate() {
            if missing.contains(&i) {
                continue;
            }
            let attrs: String = el
                .attrs
                .iter()
                .map(|(k, v)| format!(" {}=\"{}\"", k, v))
                .collect();
            lines.push(format!("[{}]:<{}{}>{}</{}>", i, el.tag, attrs, el.text, el.tag));
        }
        lines.push(format!("<!-- render {} -->", version));
        lines.join("\n")
    }
}

impl BrowserSurface for MockSurface {
    fn surface_id(&self) -> &str {
        &self.id
    }

    fn navigate(&self, url: &str) -> BoxFuture<'_, Result<PageInfo>> {
        let url = url.to_string();
        Box::pin(async move {
            self.record(format!("navigate {}", url));
            let mut page = self.page.lock().unwrap();
            let previous = std::mem::replace(&mut page.url, url.clone());
            page.history.push(previous);
            page.title = format!("Page {}", url);
            Ok(PageInfo {
                url,
                title: page.title.clone(),
            })
        })
    }

    fn current_page(&self) -> BoxFuture<'_, Result<PageInfo>> {
        Box::pin(async move {
            let page = self.page.lock().unwrap();
            Ok(PageInfo {
                url: page.url.clone(),
                title: page.title.clone(),
            })
        })
    }

    fn go_back(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("back".to_string());
            let mut page = self.page.lock().unwrap();
            if let Some(previous) = page.history.pop() {
                page.url = previous;
            }
            Ok(())
        })
    }

    fn click(&self, index: usize, clicks: u32, button: MouseButton) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.element(index)?;
            self.record(format!("click {} x{} {:?}", index, clicks, button));
            Ok(())
        })
    }

    fn input_text(&self, index: usize, text: &str, enter: bool) -> BoxFuture<'_, Result<()>> {
        let text = text.to_string();
        Box::pin(async move {
            self.element(index)?;
            self.record(format!("input {} {:?} enter={}", index, text, enter));
            Ok(())
        })
    }

    fn hover(&self, index: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.element(index)?;
            self.record(format!("hover {}", index));
            Ok(())
        })
    }

    fn scroll(&self, amount: i32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.scrolls.fetch_add(1, Ordering::SeqCst);
            self.record(format!("scroll {}", amount));
            Ok(())
        })
    }

    fn select_options(&self, index: usize) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let el = self.element(index)?;
            if el.tag != "select" {
                return Err(WeftError::ToolExecution {
                    tool: "get_select_options".to_string(),
                    message: format!("element {} is not a select element", index),
                });
            }
            Ok(el.options)
        })
    }

    fn select_option(&self, index: usize, option: &str) -> BoxFuture<'_, Result<String>> {
        let option = option.to_string();
        Box::pin(async move {
            let el = self.element(index)?;
            match el.options.iter().find(|o| **o == option) {
                Some(found) => {
                    self.record(format!("select {} {}", index, found));
                    Ok(found.clone())
                }
                None => Err(WeftError::ToolExecution {
                    tool: "select_option".to_string(),
                    message: format!("option `{}` not found", option),
                }),
            }
        })
    }

    fn tabs(&self) -> BoxFuture<'_, Result<Vec<TabInfo>>> {
        Box::pin(async move {
            let page = self.page.lock().unwrap();
            Ok(vec![TabInfo {
                id: 1,
                url: page.url.clone(),
                title: page.title.clone(),
                active: true,
            }])
        })
    }

    fn switch_tab(&self, tab_id: u64) -> BoxFuture<'_, Result<TabInfo>> {
        Box::pin(async move {
            if tab_id != 1 {
                return Err(WeftError::ToolExecution {
                    tool: "switch_tab".to_string(),
                    message: format!("no tab with id {}", tab_id),
                });
            }
            let page = self.page.lock().unwrap();
            Ok(TabInfo {
                id: 1,
                url: page.url.clone(),
                title: page.title.clone(),
                active: true,
            })
        })
    }

    fn extract_content(&self) -> BoxFuture<'_, Result<PageContent>> {
        Box::pin(async move {
            let n = self.extracts.fetch_add(1, Ordering::SeqCst) + 1;
            self.record("extract".to_string());
            let page = self.page.lock().unwrap();
            Ok(PageContent {
                title: page.title.clone(),
                url: page.url.clone(),
                content: format!("page text #{} after {} scrolls", n, self.scroll_count()),
            })
        })
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<EnvironmentSnapshot>> {
        Box::pin(async move {
            let version = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(EnvironmentSnapshot {
                screenshot: self.with_screenshot.then(|| Screenshot {
                    media_type: "image/png".to_string(),
                    data: format!("c2NyZWVu{}", version),
                }),
                elements: self.render_elements(version),
            })
        })
    }

    fn watch(&self, event: WatchEvent) -> BoxFuture<'_, Result<BoxStream<'static, SurfaceEvent>>> {
        let rx = self.events.subscribe();
        Box::pin(async move {
            let events = stream::unfold(rx, move |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(fired) if fired.event == event => return Some((fired, rx)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            let events: BoxStream<'static, SurfaceEvent> = Box::pin(events);
            Ok(events)
        })
    }
}
