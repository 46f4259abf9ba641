//! A forgiving element tree for hand-authored template markup.
//!
//! Templates are HTML fragments, not XML documents: `<br>` is never closed,
//! `<td>` may be left open, and `&nbsp;` shows up everywhere. The tokenizer is
//! `quick-xml` with end-name checking disabled; this module rebuilds a tree on
//! top of its events and repairs the common HTML shortcuts as it goes.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use std::borrow::Cow;
use std::fmt::Write as _;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, thiserror::Error)]
pub enum MarkupError {
    #[error("malformed markup at byte {position}: {source}")]
    Syntax {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn new(name: impl Into<String>, attrs: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            attrs,
            children: Vec::new(),
        }
    }

    /// Lower-cased tag name. The synthetic fragment root has an empty name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Direct child elements, in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn elements_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |element| element.name == name)
    }

    /// Depth-first search for the first descendant with the given tag name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for element in self.elements() {
            if element.name == name {
                return Some(element);
            }
            if let Some(found) = element.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// Every descendant with the given tag name, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_named(name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for element in self.elements() {
            if element.name == name {
                out.push(element);
            }
            element.collect_named(name, out);
        }
    }

    /// Concatenated text of all descendants, entities already decoded.
    pub fn text_content(&self) -> String {
        let mut text = String::new();
        self.push_text(&mut text);
        text
    }

    fn push_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => element.push_text(out),
            }
        }
    }

    /// Markup of the children, re-serialized from the tree.
    pub fn inner_html(&self) -> String {
        let mut html = String::new();
        for child in &self.children {
            write_node(child, &mut html);
        }
        html
    }

    pub fn outer_html(&self) -> String {
        let mut html = String::new();
        write_element(self, &mut html);
        html
    }
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(&escape(text.as_str())),
        Node::Element(element) => write_element(element, out),
    }
}

fn write_element(element: &Element, out: &mut String) {
    let _ = write!(out, "<{}", element.name);
    for (key, value) in &element.attrs {
        let _ = write!(out, " {}=\"{}\"", key, escape(value.as_str()));
    }
    out.push('>');
    if is_void(&element.name) {
        return;
    }
    for child in &element.children {
        write_node(child, out);
    }
    let _ = write!(out, "</{}>", element.name);
}

/// Parsed markup fragment. The root is a nameless element holding the
/// top-level nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    root: Element,
}

impl Fragment {
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Top-level elements, looking through a wrapping `<html>`/`<body>` pair.
    pub fn top_level(&self) -> Vec<&Element> {
        let mut scope = &self.root;
        loop {
            let mut elements = scope.elements();
            match (elements.next(), elements.next()) {
                (Some(only), None) if matches!(only.name(), "html" | "body") => scope = only,
                _ => break,
            }
        }
        if scope.name() == "html" {
            if let Some(body) = scope.elements_named("body").next() {
                return body.elements().collect();
            }
        }
        scope.elements().collect()
    }
}

pub fn parse_fragment(input: &str) -> Result<Fragment, MarkupError> {
    let mut reader = Reader::from_str(input);
    reader.check_end_names(false);
    let mut builder = TreeBuilder::default();

    loop {
        let event = reader.read_event().map_err(|source| MarkupError::Syntax {
            position: reader.buffer_position(),
            source,
        })?;
        match event {
            Event::Start(start) => {
                let (name, attrs) = read_start(&start);
                if is_void(&name) {
                    builder.append(Element::new(name, attrs));
                } else {
                    builder.open(name, attrs);
                }
            }
            Event::Empty(start) => {
                let (name, attrs) = read_start(&start);
                builder.append(Element::new(name, attrs));
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_ascii_lowercase();
                builder.close(&name);
            }
            Event::Text(text) => {
                let raw = String::from_utf8_lossy(&text);
                builder.text(decode_entities(&raw).into_owned());
            }
            Event::CData(data) => {
                builder.text(String::from_utf8_lossy(&data).into_owned());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(builder.finish())
}

fn read_start(start: &BytesStart<'_>) -> (String, Vec<(String, String)>) {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_ascii_lowercase();
    let attrs = start
        .html_attributes()
        .filter_map(Result::ok)
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
            let raw = String::from_utf8_lossy(&attr.value);
            let value = decode_entities(&raw).into_owned();
            (key, value)
        })
        .collect();
    (name, attrs)
}

/// Decodes XML entities plus the handful of HTML ones templates actually use.
/// Each reference is decoded on its own: unknown entities and bare `&` stay
/// as written without affecting their neighbours.
pub fn decode_entities(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        decoded.push_str(&rest[..start]);
        rest = &rest[start..];
        match entity_reference(rest) {
            Some((len, replacement)) => {
                decoded.push_str(&replacement);
                rest = &rest[len..];
            }
            None => {
                decoded.push('&');
                rest = &rest[1..];
            }
        }
    }
    decoded.push_str(rest);
    Cow::Owned(decoded)
}

/// Length of the reference at the start of `input` and its text, if known.
fn entity_reference(input: &str) -> Option<(usize, Cow<'static, str>)> {
    let end = input
        .char_indices()
        .skip(1)
        .take(MAX_ENTITY_LEN)
        .find(|(_, ch)| !ch.is_ascii_alphanumeric() && *ch != '#')
        .filter(|(_, ch)| *ch == ';')
        .map(|(index, _)| index)?;
    let name = &input[1..end];
    let replacement = match name.strip_prefix('#') {
        Some(number) => {
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse::<u32>().ok()?,
            };
            Cow::Owned(char::from_u32(code)?.to_string())
        }
        None => Cow::Borrowed(html_entity(name)?),
    };
    Some((end + 1, replacement))
}

const MAX_ENTITY_LEN: usize = 32;

fn html_entity(name: &str) -> Option<&'static str> {
    match name {
        "nbsp" => Some("\u{a0}"),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "hellip" => Some("\u{2026}"),
        "laquo" => Some("\u{ab}"),
        "raquo" => Some("\u{bb}"),
        "copy" => Some("\u{a9}"),
        "lt" => Some("<"),
        "gt" => Some(">"),
        "amp" => Some("&"),
        "quot" => Some("\""),
        "apos" => Some("'"),
        _ => None,
    }
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<Element>,
    root: Element,
}

impl TreeBuilder {
    fn open(&mut self, name: String, attrs: Vec<(String, String)>) {
        self.close_implied(&name);
        self.stack.push(Element::new(name, attrs));
    }

    /// HTML lets a new row or cell start without closing the previous one.
    fn close_implied(&mut self, name: &str) {
        let (closes, stop_at): (&[&str], &[&str]) = match name {
            "tr" => (&["tr", "td", "th"], &["table", "thead", "tbody", "tfoot"]),
            "td" | "th" => (&["td", "th"], &["tr", "table"]),
            "thead" | "tbody" | "tfoot" => (
                &["thead", "tbody", "tfoot", "tr", "td", "th"],
                &["table"],
            ),
            _ => return,
        };
        // Outermost closable element above the enclosing row or table, so an
        // unclosed `<div>` inside the previous cell is closed along with it.
        let mut depth = None;
        for (index, element) in self.stack.iter().enumerate().rev() {
            let name = element.name.as_str();
            if stop_at.contains(&name) {
                break;
            }
            if closes.contains(&name) {
                depth = Some(index);
            }
        }
        if let Some(depth) = depth {
            while self.stack.len() > depth {
                self.pop();
            }
        }
    }

    fn close(&mut self, name: &str) {
        // Stray end tags with no matching open element are dropped.
        let Some(depth) = self.stack.iter().rposition(|element| element.name == name) else {
            return;
        };
        while self.stack.len() > depth {
            self.pop();
        }
    }

    fn pop(&mut self) {
        if let Some(element) = self.stack.pop() {
            self.append(element);
        }
    }

    fn append(&mut self, element: Element) {
        self.current().children.push(Node::Element(element));
    }

    fn text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        let current = self.current();
        if let Some(Node::Text(previous)) = current.children.last_mut() {
            previous.push_str(&text);
        } else {
            current.children.push(Node::Text(text));
        }
    }

    fn current(&mut self) -> &mut Element {
        self.stack.last_mut().unwrap_or(&mut self.root)
    }

    fn finish(mut self) -> Fragment {
        while !self.stack.is_empty() {
            self.pop();
        }
        Fragment { root: self.root }
    }
}
