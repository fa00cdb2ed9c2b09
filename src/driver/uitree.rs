//! Structured UI tree as dumped by the platform's hierarchy service

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Screen rectangle in pixels, right/bottom exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Center point, clamped to non-negative coordinates
    pub fn center(&self) -> (u32, u32) {
        let x = (self.left + self.right) / 2;
        let y = (self.top + self.bottom) / 2;
        (x.max(0) as u32, y.max(0) as u32)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x, y) = (x as i32, y as i32);
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// One element of the UI tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiNode {
    pub class: String,
    pub text: String,
    pub content_desc: String,
    pub resource_id: String,
    pub package: String,
    pub bounds: Rect,
    pub clickable: bool,
    pub children: Vec<UiNode>,
}

impl UiNode {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.content_desc = desc.into();
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = id.into();
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn clickable(mut self) -> Self {
        self.clickable = true;
        self
    }

    pub fn with_child(mut self, child: UiNode) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first, document-order walk over this node and its descendants
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a UiNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Descendants (not including self) matching `selector`, in document order
    pub fn descendants_matching(&self, selector: &Selector) -> Vec<&UiNode> {
        let mut out = Vec::new();
        for child in &self.children {
            child.walk(&mut |n| {
                if selector.matches(n) {
                    out.push(n);
                }
            });
        }
        out
    }
}

/// Attribute query against the UI tree. Every set field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub text: Option<String>,
    pub description: Option<String>,
    pub resource_id: Option<String>,
    pub class_name: Option<String>,
}

impl Selector {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn description(desc: impl Into<String>) -> Self {
        Self {
            description: Some(desc.into()),
            ..Default::default()
        }
    }

    pub fn resource_id(id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn class_name(class: impl Into<String>) -> Self {
        Self {
            class_name: Some(class.into()),
            ..Default::default()
        }
    }

    pub fn and_class(mut self, class: impl Into<String>) -> Self {
        self.class_name = Some(class.into());
        self
    }

    pub fn matches(&self, node: &UiNode) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        eq(&self.text, &node.text)
            && eq(&self.description, &node.content_desc)
            && eq(&self.resource_id, &node.resource_id)
            && eq(&self.class_name, &node.class)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = &self.text {
            parts.push(format!("text={t:?}"));
        }
        if let Some(d) = &self.description {
            parts.push(format!("desc={d:?}"));
        }
        if let Some(r) = &self.resource_id {
            parts.push(format!("id={r:?}"));
        }
        if let Some(c) = &self.class_name {
            parts.push(format!("class={c:?}"));
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// A dumped UI hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiTree {
    pub root: UiNode,
}

impl UiTree {
    pub fn new(root: UiNode) -> Self {
        Self { root }
    }

    /// First node matching `selector` in document order
    pub fn find(&self, selector: &Selector) -> Option<&UiNode> {
        let mut found = None;
        self.root.walk(&mut |n| {
            if found.is_none() && selector.matches(n) {
                found = Some(n);
            }
        });
        found
    }

    pub fn exists(&self, selector: &Selector) -> bool {
        self.find(selector).is_some()
    }

    pub fn find_all(&self, selector: &Selector) -> Vec<&UiNode> {
        let mut out = Vec::new();
        self.root.walk(&mut |n| {
            if selector.matches(n) {
                out.push(n);
            }
        });
        out
    }

    /// All non-empty text attributes in document order
    pub fn texts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.walk(&mut |n| {
            if !n.text.trim().is_empty() {
                out.push(n.text.as_str());
            }
        });
        out
    }

    pub fn clickable_count(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |n| {
            if n.clickable {
                count += 1;
            }
        });
        count
    }

    /// One-line description for diagnostics
    pub fn summary(&self, sample: usize) -> String {
        let texts = self.texts();
        let head: Vec<&str> = texts.iter().take(sample).copied().collect();
        format!(
            "{} text elements, {} clickable, first: {:?}",
            texts.len(),
            self.clickable_count(),
            head
        )
    }
}

/// Parse a `uiautomator dump` style XML hierarchy.
///
/// Only `<node>` elements are interpreted; the `<hierarchy>` wrapper and any
/// other markup are skipped. Several top-level nodes are wrapped in a
/// synthetic `hierarchy` root.
pub fn parse_hierarchy(xml: &str) -> Result<UiTree, DriverError> {
    let mut stack: Vec<UiNode> = Vec::new();
    let mut roots: Vec<UiNode> = Vec::new();

    for caps in node_regex().captures_iter(xml) {
        if caps.name("close").is_some() {
            let node = stack
                .pop()
                .ok_or_else(|| DriverError::parse("ui hierarchy", "unbalanced </node>"))?;
            attach(&mut stack, &mut roots, node);
            continue;
        }

        let attrs = caps.name("attrs").map_or("", |m| m.as_str());
        let node = node_from_attrs(attrs)?;
        if caps.name("selfclose").map_or(false, |m| !m.as_str().is_empty()) {
            attach(&mut stack, &mut roots, node);
        } else {
            stack.push(node);
        }
    }

    if !stack.is_empty() {
        return Err(DriverError::parse(
            "ui hierarchy",
            format!("{} unclosed <node> elements", stack.len()),
        ));
    }

    match roots.len() {
        0 => Err(DriverError::parse("ui hierarchy", "no <node> elements")),
        1 => Ok(UiTree::new(roots.remove(0))),
        _ => {
            let mut root = UiNode::new("hierarchy");
            root.children = roots;
            Ok(UiTree::new(root))
        }
    }
}

fn attach(stack: &mut [UiNode], roots: &mut Vec<UiNode>, node: UiNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

fn node_from_attrs(attrs: &str) -> Result<UiNode, DriverError> {
    let mut node = UiNode::default();
    for caps in attr_regex().captures_iter(attrs) {
        let value = decode_entities(&caps[2]);
        match &caps[1] {
            "class" => node.class = value,
            "text" => node.text = value,
            "content-desc" => node.content_desc = value,
            "resource-id" => node.resource_id = value,
            "package" => node.package = value,
            "clickable" => node.clickable = value == "true",
            "bounds" => node.bounds = parse_bounds(&value)?,
            _ => {}
        }
    }
    Ok(node)
}

/// Parse `[l,t][r,b]`
pub fn parse_bounds(s: &str) -> Result<Rect, DriverError> {
    let nums: Vec<i32> = s
        .split(|c: char| c == '[' || c == ']' || c == ',')
        .filter(|p| !p.is_empty())
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|e| DriverError::parse("bounds", format!("{s}: {e}")))?;
    match nums.as_slice() {
        [l, t, r, b] => Ok(Rect::new(*l, *t, *r, *b)),
        _ => Err(DriverError::parse("bounds", s.to_string())),
    }
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            e if e.starts_with("#x") => u32::from_str_radix(&e[2..], 16).ok().and_then(char::from_u32),
            e if e.starts_with('#') => e[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

fn node_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<node\b(?P<attrs>[^>]*?)(?P<selfclose>/?)>|(?P<close></node\s*>)"#)
            .unwrap_or_else(|e| panic!("invalid node regex: {e}"))
    })
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w\-]*)="([^"]*)""#)
            .unwrap_or_else(|e| panic!("invalid attribute regex: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.tencent.mm" content-desc="" clickable="false" bounds="[0,0][1080,2400]">
    <node index="0" text="" resource-id="" class="android.widget.TabWidget" package="com.tencent.mm" content-desc="" clickable="false" bounds="[0,2200][1080,2400]">
      <node index="0" text="微信" resource-id="com.tencent.mm:id/tab_1" class="android.widget.TextView" package="com.tencent.mm" content-desc="" clickable="true" bounds="[0,2200][270,2400]" />
      <node index="1" text="通讯录" resource-id="" class="android.widget.TextView" package="com.tencent.mm" content-desc="" clickable="true" bounds="[270,2200][540,2400]" />
      <node index="2" text="发现" resource-id="" class="android.widget.TextView" package="com.tencent.mm" content-desc="Discover &amp; more" clickable="true" bounds="[540,2200][810,2400]" />
      <node index="3" text="我" resource-id="" class="android.widget.TextView" package="com.tencent.mm" content-desc="" clickable="true" bounds="[810,2200][1080,2400]" />
    </node>
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_nested_hierarchy() {
        let tree = parse_hierarchy(SAMPLE).unwrap();
        assert_eq!(tree.root.class, "android.widget.FrameLayout");
        assert_eq!(tree.root.children.len(), 1);
        assert_eq!(tree.root.children[0].children.len(), 4);
        assert_eq!(tree.texts(), vec!["微信", "通讯录", "发现", "我"]);
        assert_eq!(tree.clickable_count(), 4);
    }

    #[test]
    fn test_find_by_attributes() {
        let tree = parse_hierarchy(SAMPLE).unwrap();
        let discover = tree.find(&Selector::text("发现")).unwrap();
        assert_eq!(discover.bounds, Rect::new(540, 2200, 810, 2400));
        assert_eq!(discover.bounds.center(), (675, 2300));
        assert_eq!(discover.content_desc, "Discover & more");

        assert!(tree.exists(&Selector::resource_id("com.tencent.mm:id/tab_1")));
        assert!(!tree.exists(&Selector::text("发现").and_class("android.widget.Button")));
    }

    #[test]
    fn test_descendants_in_document_order() {
        let tree = parse_hierarchy(SAMPLE).unwrap();
        let strip = tree.find(&Selector::class_name("android.widget.TabWidget")).unwrap();
        let tabs = strip.descendants_matching(&Selector::class_name("android.widget.TextView"));
        assert_eq!(tabs.len(), 4);
        assert_eq!(tabs[2].text, "发现");
    }

    #[test]
    fn test_unbalanced_is_error() {
        let err = parse_hierarchy(r#"<node class="a" bounds="[0,0][1,1]">"#).unwrap_err();
        assert!(matches!(err, DriverError::Parse { .. }));
        assert!(parse_hierarchy("<hierarchy/>").is_err());
    }

    #[test]
    fn test_parse_bounds() {
        assert_eq!(parse_bounds("[1,2][30,40]").unwrap(), Rect::new(1, 2, 30, 40));
        assert!(parse_bounds("[1,2]").is_err());
        assert!(parse_bounds("[a,b][c,d]").is_err());
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &lt;b&gt; &#65;&#x42; &unknown;"), "a <b> AB &unknown;");
    }
}
