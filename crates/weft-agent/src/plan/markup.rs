//! Reader for the tag markup the planner emits.
//!
//! The dialect is a forgiving subset of XML: comments, processing
//! instructions, quoted or bare attributes, the five named entities plus
//! numeric ones, self-closing tags, and prose or code fences around the
//! `<root>` element. A closing tag that matches an open ancestor closes
//! everything above it; one that matches nothing is ignored.

use serde_json::Value;

use weft_core::error::{Result, WeftError};

use super::document::{
    AgentDocument, DependsOn, Flag, IdRef, ItemsDocument, NodeDocument, PlanDocument,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Markup>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Markup {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Markup::Element(e) => Some(e),
            Markup::Text(_) => None,
        })
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Concatenated descendant text, whitespace-collapsed.
    fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

fn collect_text(children: &[Markup], out: &mut String) {
    for child in children {
        match child {
            Markup::Text(t) => {
                out.push_str(t);
                out.push(' ');
            }
            Markup::Element(e) => collect_text(&e.children, out),
        }
    }
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> WeftError {
        WeftError::PlanSyntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    /// Skip past `terminator`; error if it never appears.
    fn skip_past(&mut self, terminator: &str, what: &str) -> Result<()> {
        match self.rest().find(terminator) {
            Some(i) => {
                self.pos += i + terminator.len();
                Ok(())
            }
            None => Err(self.error(format!("unterminated {}", what))),
        }
    }

    fn read_name(&mut self) -> String {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')))
            .unwrap_or(rest.len());
        self.pos += end;
        rest[..end].to_string()
    }

    fn read_attrs(&mut self) -> Result<(Vec<(String, String)>, bool)> {
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.error("unterminated tag"));
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok((attrs, true));
            }
            if rest.starts_with('>') {
                self.pos += 1;
                return Ok((attrs, false));
            }
            let name = self.read_name();
            if name.is_empty() {
                return Err(self.error(format!(
                    "unexpected `{}` in tag",
                    rest.chars().next().unwrap_or(' ')
                )));
            }
            self.skip_whitespace();
            if !self.rest().starts_with('=') {
                attrs.push((name, String::new()));
                continue;
            }
            self.pos += 1;
            self.skip_whitespace();
            let rest = self.rest();
            let value = match rest.chars().next() {
                Some(q @ ('"' | '\'')) => match rest[1..].find(q) {
                    Some(end) => {
                        self.pos += end + 2;
                        decode_entities(&rest[1..end + 1])
                    }
                    None => return Err(self.error("unterminated attribute value")),
                },
                _ => {
                    let end = rest
                        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
                        .unwrap_or(rest.len());
                    self.pos += end;
                    decode_entities(&rest[..end])
                }
            };
            attrs.push((name, value));
        }
    }

    /// Parse the element whose `<` is at the current position.
    fn read_element(&mut self) -> Result<Element> {
        let mut stack: Vec<Element> = Vec::new();
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                let open = stack.last().map(|e| e.name.clone()).unwrap_or_default();
                return Err(self.error(format!("`<{}>` is never closed", open)));
            }

            if rest.starts_with("<!--") {
                self.skip_past("-->", "comment")?;
                continue;
            }
            if rest.starts_with("<![CDATA[") {
                let start = self.pos + "<![CDATA[".len();
                self.skip_past("]]>", "CDATA section")?;
                let text = self.src[start..self.pos - 3].to_string();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Markup::Text(text));
                }
                continue;
            }
            if rest.starts_with("<?") || rest.starts_with("<!") {
                self.skip_past(">", "declaration")?;
                continue;
            }
            if let Some(after) = rest.strip_prefix("</") {
                let name_len = after.find('>').ok_or_else(|| self.error("unterminated closing tag"))?;
                let name = after[..name_len].trim().to_string();
                self.pos += 2 + name_len + 1;
                if let Some(depth) = stack.iter().rposition(|e| e.name.eq_ignore_ascii_case(&name)) {
                    while stack.len() > depth + 1 {
                        if let Some(inner) = stack.pop() {
                            push_child(&mut stack, inner);
                        }
                    }
                    if let Some(done) = stack.pop() {
                        if stack.is_empty() {
                            return Ok(done);
                        }
                        push_child(&mut stack, done);
                    }
                }
                continue;
            }
            if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_alphabetic() || c == '_')
            {
                let offset = self.pos;
                self.pos += 1;
                let name = self.read_name();
                let (attrs, self_closing) = self.read_attrs()?;
                let element = Element {
                    name,
                    attrs,
                    children: Vec::new(),
                    offset,
                };
                if self_closing {
                    if stack.is_empty() {
                        return Ok(element);
                    }
                    push_child(&mut stack, element);
                } else {
                    stack.push(element);
                }
                continue;
            }

            // Text up to the next tag; a bare `<` is literal text.
            let first = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            let next = rest[first..].find('<').map(|i| i + first).unwrap_or(rest.len());
            let text = decode_entities(&rest[..next]);
            self.pos += next;
            if let Some(parent) = stack.last_mut() {
                if !text.trim().is_empty() {
                    parent.children.push(Markup::Text(text));
                }
            }
        }
    }
}

fn push_child(stack: &mut [Element], child: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Markup::Element(child));
    }
}

/// Decode named and numeric character references. Unknown ones are kept.
pub(crate) fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape text for element content and attribute values.
pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// Locate and read the `<root>` element.
pub(crate) fn parse_root(text: &str) -> Result<Element> {
    let start = find_tag(text, "root").ok_or_else(|| WeftError::PlanSyntax {
        offset: 0,
        message: "no <root> element found".to_string(),
    })?;
    let mut reader = Reader {
        src: text,
        pos: start,
    };
    reader.read_element()
}

fn find_tag(text: &str, name: &str) -> Option<usize> {
    let open = format!("<{}", name);
    let mut from = 0;
    while let Some(i) = text[from..].find(&open) {
        let at = from + i;
        let after = &text[at + open.len()..];
        if after.starts_with(|c: char| c == '>' || c == '/' || c.is_whitespace()) {
            return Some(at);
        }
        from = at + open.len();
    }
    None
}

/// Read planner markup into a [`PlanDocument`].
pub fn parse_markup(text: &str) -> Result<PlanDocument> {
    let root = parse_root(text)?;
    let agents = match root.child("agents") {
        Some(list) => list
            .elements()
            .filter(|e| e.name.eq_ignore_ascii_case("agent"))
            .map(agent_document)
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(PlanDocument {
        name: root.child("name").map(Element::text).unwrap_or_default(),
        thought: root.child("thought").map(Element::text).unwrap_or_default(),
        agents,
    })
}

fn agent_document(el: &Element) -> Result<AgentDocument> {
    let name = el.attr("name").ok_or_else(|| WeftError::PlanSyntax {
        offset: el.offset,
        message: "<agent> has no name attribute".to_string(),
    })?;
    let id = el.attr("id").ok_or_else(|| WeftError::PlanSyntax {
        offset: el.offset,
        message: format!("<agent name=\"{}\"> has no id attribute", name),
    })?;
    let nodes = match el.child("nodes") {
        Some(nodes) => node_documents(nodes),
        None => Vec::new(),
    };
    Ok(AgentDocument {
        name: name.trim().to_string(),
        id: IdRef::Text(id.trim().to_string()),
        depends_on: DependsOn::Text(el.attr("dependsOn").unwrap_or_default().to_string()),
        task: el.child("task").map(Element::text).filter(|t| !t.is_empty()),
        nodes,
    })
}

fn node_documents(parent: &Element) -> Vec<NodeDocument> {
    parent
        .elements()
        .filter_map(|el| match el.name.to_ascii_lowercase().as_str() {
            "node" => Some(NodeDocument::Node {
                text: el.text(),
                input: el.attr("input").map(str::to_string).filter(|s| !s.trim().is_empty()),
                output: el.attr("output").map(str::to_string).filter(|s| !s.trim().is_empty()),
            }),
            "foreach" => Some(NodeDocument::ForEach {
                items: ItemsDocument::Text(el.attr("items").unwrap_or_default().to_string()),
                nodes: node_documents(el),
            }),
            "watch" => Some(NodeDocument::Watch {
                event: el.attr("event").unwrap_or_default().to_string(),
                repeat: Flag::Text(el.attr("loop").unwrap_or("false").to_string()),
                description: el.child("description").map(Element::text).unwrap_or_default(),
                trigger: el.child("trigger").map(node_documents).unwrap_or_default(),
            }),
            _ => None,
        })
        .collect()
}

/// Parse a plan from either markup or JSON, sniffed from the first
/// significant character.
pub fn parse_any(text: &str) -> Result<PlanDocument> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        let doc: PlanDocument = serde_json::from_str(trimmed)?;
        return Ok(doc);
    }
    if trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)?;
        return Err(WeftError::PlanSyntax {
            offset: 0,
            message: format!(
                "expected a plan object, found a JSON array of {} entries",
                value.as_array().map(Vec::len).unwrap_or(0)
            ),
        });
    }
    parse_markup(text)
}
