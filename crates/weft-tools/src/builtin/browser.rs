//! Browser tools over an abstract [`BrowserSurface`].
//!
//! Element indices refer to the `[index]:` prefixes of the latest
//! environment snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::surface::{MouseButton, PageContent};
use weft_core::traits::{BrowserSurface, Tool};
use weft_core::types::{ToolContext, ToolResult, ToolRole};

pub const SCROLL_MOUSE_WHEEL: &str = "scroll_mouse_wheel";
pub const EXTRACT_PAGE_CONTENT: &str = "extract_page_content";

fn surface(tool: &str, ctx: &ToolContext) -> Result<Arc<dyn BrowserSurface>> {
    ctx.surface.clone().ok_or_else(|| WeftError::ToolExecution {
        tool: tool.to_string(),
        message: "no interactive surface is attached to this agent".to_string(),
    })
}

fn params<T: serde::de::DeserializeOwned>(input: Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| WeftError::ToolValidation(e.to_string()))
}

/// Render extracted content as an observation.
pub fn render_content(page: &PageContent) -> String {
    format!(
        "title: {}\npage_url: {}\npage_content:\n{}",
        page.title, page.url, page.content
    )
}

fn index_schema(description: &str) -> Value {
    json!({ "type": "integer", "description": description })
}

/// Every browser tool, in registration order.
pub fn browser_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(NavigateTool),
        Arc::new(CurrentPageTool),
        Arc::new(GoBackTool),
        Arc::new(InputTextTool),
        Arc::new(ClickElementTool),
        Arc::new(ScrollMouseWheelTool),
        Arc::new(HoverTool),
        Arc::new(ExtractContentTool),
        Arc::new(SelectOptionsTool),
        Arc::new(SelectOptionTool),
        Arc::new(AllTabsTool),
        Arc::new(SwitchTabTool),
        Arc::new(WaitTool),
    ]
}

// ── Navigation ──────────────────────────────────────────────

pub struct NavigateTool;

#[derive(Deserialize)]
struct NavigateInput {
    url: String,
}

impl Tool for NavigateTool {
    fn name(&self) -> &str {
        "navigate_to"
    }

    fn description(&self) -> &str {
        "Navigate to a specific url"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "url": { "type": "string", "description": "URL to open" } },
            "required": ["url"]
        })
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: NavigateInput = params(input)?;
            let page = surface(self.name(), &ctx)?.navigate(&p.url).await?;
            Ok(ToolResult::success(
                json!({ "url": page.url, "title": page.title }).to_string(),
            ))
        })
    }
}

pub struct CurrentPageTool;

impl Tool for CurrentPageTool {
    fn name(&self) -> &str {
        "current_page"
    }

    fn description(&self) -> &str {
        "Get the information of the current webpage (url, title)"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Informational
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, _input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let page = surface(self.name(), &ctx)?.current_page().await?;
            Ok(ToolResult::success(
                json!({ "url": page.url, "title": page.title }).to_string(),
            ))
        })
    }
}

pub struct GoBackTool;

impl Tool for GoBackTool {
    fn name(&self) -> &str {
        "go_back"
    }

    fn description(&self) -> &str {
        "Navigate back in browser history"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn execute(&self, _input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            surface(self.name(), &ctx)?.go_back().await?;
            Ok(ToolResult::success("Navigated back."))
        })
    }
}

// ── Element interaction ─────────────────────────────────────

pub struct InputTextTool;

#[derive(Deserialize)]
struct InputTextInput {
    index: usize,
    text: String,
    #[serde(default)]
    enter: bool,
}

impl Tool for InputTextTool {
    fn name(&self) -> &str {
        "input_text"
    }

    fn description(&self) -> &str {
        "Input text into an element"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": index_schema("The index of the element to input text"),
                "text": { "type": "string", "description": "The text to input" },
                "enter": { "type": "boolean", "description": "Press Enter after typing" }
            },
            "required": ["index", "text"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: InputTextInput = params(input)?;
            surface(self.name(), &ctx)?
                .input_text(p.index, &p.text, p.enter)
                .await?;
            Ok(ToolResult::success(format!("Typed into element {}.", p.index)))
        })
    }
}

pub struct ClickElementTool;

#[derive(Deserialize)]
struct ClickInput {
    index: usize,
    #[serde(default = "default_clicks")]
    num_clicks: u32,
    #[serde(default)]
    button: Option<String>,
}

fn default_clicks() -> u32 {
    1
}

impl Tool for ClickElementTool {
    fn name(&self) -> &str {
        "click_element"
    }

    fn description(&self) -> &str {
        "Click on an element by index"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": index_schema("The index of the element to click"),
                "num_clicks": { "type": "integer", "description": "Number of clicks, default 1" },
                "button": { "type": "string", "enum": ["left", "right", "middle"] }
            },
            "required": ["index"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: ClickInput = params(input)?;
            let button = match p.button.as_deref() {
                Some(name) => name.parse::<MouseButton>().map_err(WeftError::ToolValidation)?,
                None => MouseButton::Left,
            };
            surface(self.name(), &ctx)?
                .click(p.index, p.num_clicks.max(1), button)
                .await?;
            Ok(ToolResult::success(format!("Clicked element {}.", p.index)))
        })
    }
}

pub struct HoverTool;

#[derive(Deserialize)]
struct IndexInput {
    index: usize,
}

impl Tool for HoverTool {
    fn name(&self) -> &str {
        "hover_to_element"
    }

    fn description(&self) -> &str {
        "Mouse hover over the element"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "index": index_schema("The index of the element to hover") },
            "required": ["index"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: IndexInput = params(input)?;
            surface(self.name(), &ctx)?.hover(p.index).await?;
            Ok(ToolResult::success(format!("Hovering over element {}.", p.index)))
        })
    }
}

// ── Viewport and content ────────────────────────────────────

pub struct ScrollMouseWheelTool;

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ScrollDirection {
    Up,
    Down,
}

#[derive(Deserialize)]
struct ScrollInput {
    amount: u32,
    direction: ScrollDirection,
    #[serde(default)]
    extract_page_content: bool,
}

fn wants_extraction(input: &Value) -> bool {
    input
        .get("extract_page_content")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

impl Tool for ScrollMouseWheelTool {
    fn name(&self) -> &str {
        SCROLL_MOUSE_WHEEL
    }

    fn description(&self) -> &str {
        "Scroll the mouse wheel at the current position"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "amount": { "type": "integer", "description": "Scroll amount, 1 to 10", "minimum": 1, "maximum": 10 },
                "direction": { "type": "string", "enum": ["up", "down"] },
                "extract_page_content": {
                    "type": "boolean",
                    "description": "Return the page content after scrolling"
                }
            },
            "required": ["amount", "direction"]
        })
    }

    fn role(&self, input: &Value) -> ToolRole {
        if wants_extraction(input) {
            ToolRole::ScrollExtract
        } else {
            ToolRole::Scroll
        }
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: ScrollInput = params(input)?;
            let amount = p.amount.clamp(1, 10) as i32;
            let signed = match p.direction {
                ScrollDirection::Up => -amount,
                ScrollDirection::Down => amount,
            };
            let surface = surface(self.name(), &ctx)?;
            surface.scroll(signed).await?;
            if p.extract_page_content {
                let page = surface.extract_content().await?;
                return Ok(ToolResult::success(format!(
                    "Scrolled.\n{}",
                    render_content(&page)
                )));
            }
            Ok(ToolResult::success("Scrolled."))
        })
    }
}

pub struct ExtractContentTool;

impl Tool for ExtractContentTool {
    fn name(&self) -> &str {
        EXTRACT_PAGE_CONTENT
    }

    fn description(&self) -> &str {
        "Extract the text content of the current webpage"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Extract
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, _input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let page = surface(self.name(), &ctx)?.extract_content().await?;
            Ok(ToolResult::success(render_content(&page)))
        })
    }
}

// ── Select elements ─────────────────────────────────────────

pub struct SelectOptionsTool;

impl Tool for SelectOptionsTool {
    fn name(&self) -> &str {
        "get_select_options"
    }

    fn description(&self) -> &str {
        "Get all options from a native dropdown element (<select>)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "index": index_schema("The index of the select element") },
            "required": ["index"]
        })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Informational
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: IndexInput = params(input)?;
            let options = surface(self.name(), &ctx)?.select_options(p.index).await?;
            Ok(ToolResult::success(json!(options).to_string()))
        })
    }
}

pub struct SelectOptionTool;

#[derive(Deserialize)]
struct SelectInput {
    index: usize,
    option: String,
}

impl Tool for SelectOptionTool {
    fn name(&self) -> &str {
        "select_option"
    }

    fn description(&self) -> &str {
        "Select the native dropdown option"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": index_schema("The index of the select element"),
                "option": { "type": "string", "description": "Option text to select" }
            },
            "required": ["index", "option"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: SelectInput = params(input)?;
            let chosen = surface(self.name(), &ctx)?
                .select_option(p.index, &p.option)
                .await?;
            Ok(ToolResult::success(format!("Selected `{}`.", chosen)))
        })
    }
}

// ── Tabs ────────────────────────────────────────────────────

pub struct AllTabsTool;

impl Tool for AllTabsTool {
    fn name(&self) -> &str {
        "get_all_tabs"
    }

    fn description(&self) -> &str {
        "Get the tabId, url and title of every open tab"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Informational
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, _input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let tabs = surface(self.name(), &ctx)?.tabs().await?;
            Ok(ToolResult::success(serde_json::to_string(&tabs)?))
        })
    }
}

pub struct SwitchTabTool;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchTabInput {
    tab_id: u64,
}

impl Tool for SwitchTabTool {
    fn name(&self) -> &str {
        "switch_tab"
    }

    fn description(&self) -> &str {
        "Switch to the specified tab"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "tabId": { "type": "integer", "description": "Tab id from get_all_tabs" } },
            "required": ["tabId"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: SwitchTabInput = params(input)?;
            let tab = surface(self.name(), &ctx)?.switch_tab(p.tab_id).await?;
            Ok(ToolResult::success(serde_json::to_string(&tab)?))
        })
    }
}

// ── Wait ────────────────────────────────────────────────────

pub struct WaitTool;

#[derive(Deserialize)]
struct WaitInput {
    #[serde(default = "default_wait_ms")]
    duration: u64,
}

fn default_wait_ms() -> u64 {
    500
}

const MAX_WAIT_MS: u64 = 30_000;

impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Wait for the page to settle, in milliseconds"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "duration": { "type": "integer", "description": "Milliseconds, max 30000", "minimum": 200 }
            }
        })
    }

    fn no_plan(&self) -> bool {
        true
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(MAX_WAIT_MS / 1000 + 5)
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: WaitInput = params(input)?;
            let ms = p.duration.min(MAX_WAIT_MS);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolResult::success(format!("Waited {}ms.", ms)))
        })
    }
}

#[cfg(test)]
mod tests {
    use weft_core::variables::VariableStore;
    use weft_core::RunId;
    use weft_test_utils::MockSurface;

    use super::*;

    fn ctx(surface: Arc<MockSurface>) -> ToolContext {
        let mut ctx = ToolContext::new(RunId::new(), 0, Arc::new(VariableStore::new()));
        ctx.surface = Some(surface);
        ctx
    }

    #[tokio::test]
    async fn missing_element_is_tool_level() {
        let surface = Arc::new(MockSurface::new("s1"));
        surface.remove_element(2);
        let err = ClickElementTool
            .execute(json!({"index": 2}), ctx(surface))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::ElementNotFound(2)));
        assert!(err.is_tool_level());
    }

    #[tokio::test]
    async fn scroll_with_extraction_returns_content() {
        let surface = Arc::new(MockSurface::new("s1"));
        let tool = ScrollMouseWheelTool;
        let input = json!({"amount": 3, "direction": "down", "extract_page_content": true});
        assert_eq!(tool.role(&input), ToolRole::ScrollExtract);
        let result = tool.execute(input, ctx(surface.clone())).await.unwrap();
        assert!(result.content.contains("page_content"));
        assert_eq!(surface.scroll_count(), 1);
        assert_eq!(surface.actions()[0], "scroll 3");
    }

    #[tokio::test]
    async fn scroll_up_is_negative() {
        let surface = Arc::new(MockSurface::new("s1"));
        let input = json!({"amount": 2, "direction": "up"});
        assert_eq!(ScrollMouseWheelTool.role(&input), ToolRole::Scroll);
        ScrollMouseWheelTool
            .execute(input, ctx(surface.clone()))
            .await
            .unwrap();
        assert_eq!(surface.actions(), vec!["scroll -2".to_string()]);
    }

    #[tokio::test]
    async fn not_a_select_element() {
        let surface = Arc::new(MockSurface::new("s1"));
        let err = SelectOptionsTool
            .execute(json!({"index": 0}), ctx(surface.clone()))
            .await
            .unwrap_err();
        assert!(err.is_tool_level());
        let ok = SelectOptionsTool
            .execute(json!({"index": 3}), ctx(surface))
            .await
            .unwrap();
        assert_eq!(ok.content, r#"["S","M","L"]"#);
    }

    #[tokio::test]
    async fn no_surface_is_tool_error() {
        let ctx = ToolContext::new(RunId::new(), 0, Arc::new(VariableStore::new()));
        let err = CurrentPageTool.execute(json!({}), ctx).await.unwrap_err();
        assert!(err.is_tool_level());
    }

    #[test]
    fn informational_tools_do_not_refresh() {
        for tool in browser_tools() {
            let refreshes = tool.role(&json!({})).refreshes_environment();
            let expected = !matches!(
                tool.name(),
                "current_page" | "extract_page_content" | "get_select_options" | "get_all_tabs"
            );
            assert_eq!(refreshes, expected, "{}", tool.name());
        }
    }
}
