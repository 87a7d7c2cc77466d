/*
 * Copyright 2020 Joyent, Inc.
 */

//! A small namespace-aware XML infoset.
//!
//! Documents are parsed into owned [`XmlElement`] trees with every element
//! and attribute name resolved to a [`QName`]. Prefixes and namespace
//! declarations seen on input are preserved, so writing a parsed tree and
//! parsing the output again yields the same bytes.

use std::fmt;

use crate::version::{XMLNS_NAMESPACE, XML_NAMESPACE};

pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    pub namespace: String,
    pub local: String,
}

impl QName {
    pub fn new(namespace: &str, local: &str) -> QName {
        QName {
            namespace: String::from(namespace),
            local: String::from(local),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub name: QName,
    pub prefix: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// Namespace declaration carried on an element: `None` is the default
/// namespace.
pub type NamespaceDecl = (Option<String>, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: QName,
    pub prefix: Option<String>,
    pub namespaces: Vec<NamespaceDecl>,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    eof: bool,
}

impl XmlError {
    pub fn new(message: impl Into<String>) -> XmlError {
        XmlError {
            message: message.into(),
            line: None,
            column: None,
            eof: false,
        }
    }

    fn at(message: impl Into<String>, line: usize, column: usize) -> XmlError {
        XmlError {
            message: message.into(),
            line: Some(line),
            column: Some(column),
            eof: false,
        }
    }

    /// The input ended before the document was complete.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// An element with `expected` name was required where `found` sits.
    pub fn unexpected(expected: &QName, found: &XmlElement) -> XmlError {
        XmlError::new(format!(
            "expected element {} but found {}",
            expected, found.name
        ))
    }
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => {
                write!(f, "{} (line {}, column {})", self.message, line, col)
            }
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for XmlError {}

impl XmlElement {
    pub fn new(namespace: &str, local: &str) -> XmlElement {
        XmlElement {
            name: QName::new(namespace, local),
            prefix: None,
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> XmlElement {
        self.prefix = Some(String::from(prefix));
        self
    }

    pub fn with_namespace(mut self, prefix: Option<&str>, uri: &str) -> XmlElement {
        self.namespaces
            .push((prefix.map(String::from), String::from(uri)));
        self
    }

    pub fn with_attribute(mut self, namespace: &str, local: &str, value: &str) -> XmlElement {
        self.set_attribute(namespace, local, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> XmlElement {
        self.children.push(XmlNode::Text(String::from(text)));
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> XmlElement {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    pub fn set_attribute(&mut self, namespace: &str, local: &str, value: &str) {
        let name = QName::new(namespace, local);
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = String::from(value),
            None => self.attributes.push(XmlAttribute {
                prefix: if namespace == XML_NAMESPACE {
                    Some(String::from("xml"))
                } else {
                    None
                },
                name,
                value: String::from(value),
            }),
        }
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.name.namespace == namespace && self.name.local == local
    }

    pub fn attribute(&self, namespace: &str, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace == namespace && a.name.local == local)
            .map(|a| a.value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, namespace: &str, local: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.is(namespace, local))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    /// Text content with surrounding whitespace removed.
    pub fn trimmed_text(&self) -> String {
        self.text().trim().to_string()
    }

    /// Resolves a `prefix:local` value against declarations made on this
    /// element. Use [`NamespaceScope`] when ancestors declare the prefix.
    pub fn resolve_qname_value(&self, value: &str) -> Option<QName> {
        NamespaceScope::default().enter(self).resolve(value)
    }

    /// Prefix-independent rendering used to compare elements by content:
    /// names are expanded, attributes sorted, declarations dropped.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        canonicalize(self, &mut out);
        out
    }

    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        let mut scope = Scope::default();
        write_element(self, &mut scope, &mut out);
        out
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_xml_string())
    }
}

/// Serializes a sequence of sibling nodes with no enclosing element.
pub fn write_fragment(nodes: &[XmlNode]) -> String {
    let mut out = String::new();
    let mut scope = Scope::default();
    for node in nodes {
        write_node(node, &mut scope, &mut out);
    }
    out
}

fn canonicalize(el: &XmlElement, out: &mut String) {
    out.push('<');
    out.push_str(&el.name.to_string());
    let mut attrs: Vec<&XmlAttribute> = el.attributes.iter().collect();
    attrs.sort_by(|a, b| a.name.cmp(&b.name));
    for attr in attrs {
        out.push(' ');
        out.push_str(&attr.name.to_string());
        out.push_str("=\"");
        escape_into(&attr.value, true, out);
        out.push('"');
    }
    out.push('>');
    for child in &el.children {
        match child {
            XmlNode::Element(e) => canonicalize(e, out),
            XmlNode::Text(t) => escape_into(t, false, out),
        }
    }
    out.push_str("</>");
}

/// Namespace bindings visible at a point in a parsed tree. Built by
/// entering each element on the path from the root.
#[derive(Debug, Clone, Default)]
pub struct NamespaceScope {
    decls: Vec<NamespaceDecl>,
}

impl NamespaceScope {
    pub fn enter(&self, el: &XmlElement) -> NamespaceScope {
        let mut decls = self.decls.clone();
        decls.push((el.prefix.clone(), el.name.namespace.clone()));
        decls.extend(el.namespaces.iter().cloned());
        NamespaceScope { decls }
    }

    pub fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }
        self.decls
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    /// Resolves a `prefix:local` value. An unprefixed value takes the
    /// default namespace, if any.
    pub fn resolve(&self, value: &str) -> Option<QName> {
        let value = value.trim();
        match value.find(':') {
            Some(idx) => {
                let ns = self.lookup(Some(&value[..idx]))?;
                Some(QName::new(ns, &value[idx + 1..]))
            }
            None => Some(QName::new(self.lookup(None).unwrap_or(""), value)),
        }
    }
}

/*
 * Writer
 */

#[derive(Default)]
struct Scope {
    frames: Vec<Vec<NamespaceDecl>>,
}

impl Scope {
    fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }
        self.frames
            .iter()
            .rev()
            .flat_map(|f| f.iter().rev())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn prefix_for(&self, uri: &str) -> Option<String> {
        for frame in self.frames.iter().rev() {
            for (p, u) in frame.iter().rev() {
                if let Some(p) = p {
                    if u == uri && self.lookup(Some(p)) == Some(uri) {
                        return Some(p.clone());
                    }
                }
            }
        }
        None
    }
}

fn write_node(node: &XmlNode, scope: &mut Scope, out: &mut String) {
    match node {
        XmlNode::Element(e) => write_element(e, scope, out),
        XmlNode::Text(t) => escape_into(t, false, out),
    }
}

fn write_element(el: &XmlElement, scope: &mut Scope, out: &mut String) {
    scope.frames.push(el.namespaces.clone());

    let ns = el.name.namespace.as_str();
    let prefix = match &el.prefix {
        Some(p) => {
            if scope.lookup(Some(p)) != Some(ns) {
                declare(scope, Some(p.clone()), ns);
            }
            Some(p.clone())
        }
        None => {
            if scope.lookup(None).unwrap_or("") != ns {
                declare(scope, None, ns);
            }
            None
        }
    };

    let mut attrs = Vec::with_capacity(el.attributes.len());
    let mut generated = 0;
    for attr in &el.attributes {
        let ans = attr.name.namespace.as_str();
        let aprefix = if ans.is_empty() {
            None
        } else if ans == XML_NAMESPACE {
            Some(String::from("xml"))
        } else {
            match &attr.prefix {
                Some(p) if scope.lookup(Some(p)) == Some(ans) => Some(p.clone()),
                Some(p) if scope.lookup(Some(p)).is_none() => {
                    declare(scope, Some(p.clone()), ans);
                    Some(p.clone())
                }
                _ => match scope.prefix_for(ans) {
                    Some(p) => Some(p),
                    None => {
                        let mut p = format!("p{}", generated);
                        while scope.lookup(Some(&p)).is_some() {
                            generated += 1;
                            p = format!("p{}", generated);
                        }
                        generated += 1;
                        declare(scope, Some(p.clone()), ans);
                        Some(p)
                    }
                },
            }
        };
        attrs.push((aprefix, attr));
    }

    let qname = qualified(prefix.as_deref(), &el.name.local);
    out.push('<');
    out.push_str(&qname);
    if let Some(frame) = scope.frames.last() {
        for (p, uri) in frame {
            match p {
                Some(p) => {
                    out.push_str(" xmlns:");
                    out.push_str(p);
                }
                None => out.push_str(" xmlns"),
            }
            out.push_str("=\"");
            escape_into(uri, true, out);
            out.push('"');
        }
    }
    for (p, attr) in attrs {
        out.push(' ');
        out.push_str(&qualified(p.as_deref(), &attr.name.local));
        out.push_str("=\"");
        escape_into(&attr.value, true, out);
        out.push('"');
    }

    if el.children.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        for child in &el.children {
            write_node(child, scope, out);
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
    scope.frames.pop();
}

fn declare(scope: &mut Scope, prefix: Option<String>, uri: &str) {
    if let Some(frame) = scope.frames.last_mut() {
        frame.push((prefix, String::from(uri)));
    }
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(p) => format!("{}:{}", p, local),
        None => String::from(local),
    }
}

fn escape_into(s: &str, attribute: bool, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/*
 * Parser
 */

/// Parses a complete document and returns its root element.
pub fn parse_document(src: &str) -> Result<XmlElement, XmlError> {
    parse_document_with_depth(src, DEFAULT_MAX_DEPTH)
}

pub fn parse_document_with_depth(src: &str, max_depth: usize) -> Result<XmlElement, XmlError> {
    let mut p = Parser::new(src, max_depth);
    p.skip_misc()?;
    if p.starts_with("<!DOCTYPE") {
        return Err(p.error("DTDs are not supported"));
    }
    if p.at_end() {
        return Err(p.eof("document has no root element"));
    }
    let root = p.parse_element(1)?;
    p.skip_misc()?;
    if !p.at_end() {
        return Err(p.error("unexpected content after root element"));
    }
    Ok(root)
}

/// Parses the first complete element in `src`, returning it with the number
/// of bytes consumed (including whitespace after it). Input that ends
/// before the element closes fails with an eof error.
pub fn parse_document_prefix(src: &str, max_depth: usize) -> Result<(XmlElement, usize), XmlError> {
    let mut p = Parser::new(src, max_depth);
    p.skip_misc()?;
    if p.starts_with("<!DOCTYPE") {
        return Err(p.error("DTDs are not supported"));
    }
    if p.at_end() {
        return Err(p.eof("document has no root element"));
    }
    let root = p.parse_element(1)?;
    p.skip_whitespace();
    Ok((root, p.pos))
}

/// Parses a sequence of sibling nodes such as a buffered section.
pub fn parse_fragment(src: &str, max_depth: usize) -> Result<Vec<XmlNode>, XmlError> {
    let mut p = Parser::new(src, max_depth);
    let mut nodes = Vec::new();
    while !p.at_end() {
        if p.starts_with("<!--") || p.starts_with("<?") {
            p.skip_comment_or_pi()?;
        } else if p.starts_with("<") {
            nodes.push(XmlNode::Element(p.parse_element(1)?));
        } else {
            nodes.push(XmlNode::Text(p.parse_text()?));
        }
    }
    Ok(nodes)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    col: usize,
    max_depth: usize,
    scopes: Vec<Vec<NamespaceDecl>>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, max_depth: usize) -> Parser<'a> {
        Parser {
            src,
            pos: 0,
            line: 1,
            col: 1,
            max_depth,
            scopes: Vec::new(),
        }
    }

    fn error(&self, msg: &str) -> XmlError {
        XmlError::at(msg, self.line, self.col)
    }

    fn eof(&self, msg: &str) -> XmlError {
        let mut err = self.error(msg);
        err.eof = true;
        err
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn advance(&mut self, n: usize) {
        let target = self.pos + n;
        while self.pos < target {
            if self.bump().is_none() {
                break;
            }
        }
    }

    fn expect(&mut self, s: &str) -> Result<(), XmlError> {
        if self.starts_with(s) {
            self.advance(s.len());
            Ok(())
        } else if self.at_end() || s.starts_with(self.rest()) {
            Err(self.eof(&format!("expected '{}'", s)))
        } else {
            Err(self.error(&format!("expected '{}'", s)))
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn skip_until(&mut self, terminator: &str) -> Result<(), XmlError> {
        match self.rest().find(terminator) {
            Some(idx) => {
                self.advance(idx + terminator.len());
                Ok(())
            }
            None => Err(self.eof(&format!("unterminated construct, expected '{}'", terminator))),
        }
    }

    fn skip_comment_or_pi(&mut self) -> Result<(), XmlError> {
        if self.starts_with("<!--") {
            self.skip_until("-->")
        } else {
            self.skip_until("?>")
        }
    }

    fn skip_misc(&mut self) -> Result<(), XmlError> {
        loop {
            self.skip_whitespace();
            if self.starts_with("<?") || self.starts_with("<!--") {
                self.skip_comment_or_pi()?;
            } else {
                return Ok(());
            }
        }
    }

    fn parse_name(&mut self) -> Result<String, XmlError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':') || !c.is_ascii() {
                self.bump();
            } else {
                break;
            }
        }
        if start == self.pos {
            if self.at_end() {
                return Err(self.eof("expected a name"));
            }
            return Err(self.error("expected a name"));
        }
        Ok(String::from(&self.src[start..self.pos]))
    }

    fn parse_quoted(&mut self) -> Result<String, XmlError> {
        let quote = match self.bump() {
            Some(q @ '"') | Some(q @ '\'') => q,
            Some(_) => return Err(self.error("expected quoted attribute value")),
            None => return Err(self.eof("expected quoted attribute value")),
        };
        let rest = self.rest();
        match rest.find(quote) {
            Some(idx) => {
                let raw = &rest[..idx];
                if raw.contains('<') {
                    return Err(self.error("'<' is not allowed in attribute values"));
                }
                let value = self.unescape(raw)?;
                self.advance(idx + 1);
                Ok(value)
            }
            None => Err(self.eof("unterminated attribute value")),
        }
    }

    fn unescape(&self, raw: &str) -> Result<String, XmlError> {
        if !raw.contains('&') {
            return Ok(String::from(raw));
        }
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(idx) = rest.find('&') {
            out.push_str(&rest[..idx]);
            rest = &rest[idx + 1..];
            let end = rest
                .find(';')
                .ok_or_else(|| self.error("unterminated entity reference"))?;
            let entity = &rest[..end];
            let c = match entity {
                "lt" => '<',
                "gt" => '>',
                "amp" => '&',
                "quot" => '"',
                "apos" => '\'',
                _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("invalid character reference"))?,
                _ if entity.starts_with('#') => entity[1..]
                    .parse::<u32>()
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("invalid character reference"))?,
                _ => {
                    return Err(self.error(&format!("unknown entity '&{};'", entity)));
                }
            };
            out.push(c);
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn parse_text(&mut self) -> Result<String, XmlError> {
        let rest = self.rest();
        let end = rest.find('<').unwrap_or(rest.len());
        let text = self.unescape(&rest[..end])?;
        self.advance(end);
        Ok(text)
    }

    fn lookup(&self, prefix: Option<&str>) -> Option<String> {
        match prefix {
            Some("xml") => return Some(String::from(XML_NAMESPACE)),
            Some("xmlns") => return Some(String::from(XMLNS_NAMESPACE)),
            _ => (),
        }
        self.scopes
            .iter()
            .rev()
            .flat_map(|f| f.iter().rev())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.clone())
    }

    fn resolve(&self, raw: &str, is_attribute: bool) -> Result<(Option<String>, QName), XmlError> {
        match raw.find(':') {
            Some(idx) => {
                let prefix = &raw[..idx];
                let local = &raw[idx + 1..];
                let ns = self
                    .lookup(Some(prefix))
                    .ok_or_else(|| self.error(&format!("undeclared namespace prefix '{}'", prefix)))?;
                Ok((Some(String::from(prefix)), QName::new(&ns, local)))
            }
            None if is_attribute => Ok((None, QName::new("", raw))),
            None => {
                let ns = self.lookup(None).unwrap_or_default();
                Ok((None, QName::new(&ns, raw)))
            }
        }
    }

    fn parse_element(&mut self, depth: usize) -> Result<XmlElement, XmlError> {
        if depth > self.max_depth {
            return Err(self.error(&format!(
                "maximum element depth {} exceeded",
                self.max_depth
            )));
        }
        self.expect("<")?;
        let raw_name = self.parse_name()?;

        let mut raw_attrs: Vec<(String, String)> = Vec::new();
        let mut decls: Vec<NamespaceDecl> = Vec::new();
        let self_closing;
        loop {
            self.skip_whitespace();
            if self.starts_with("/>") {
                self.advance(2);
                self_closing = true;
                break;
            }
            if self.starts_with(">") {
                self.advance(1);
                self_closing = false;
                break;
            }
            if self.at_end() {
                return Err(self.eof("unterminated start tag"));
            }
            let name = self.parse_name()?;
            self.skip_whitespace();
            self.expect("=")?;
            self.skip_whitespace();
            let value = self.parse_quoted()?;
            if name == "xmlns" {
                decls.push((None, value));
            } else if let Some(p) = name.strip_prefix("xmlns:") {
                decls.push((Some(String::from(p)), value));
            } else {
                raw_attrs.push((name, value));
            }
        }

        self.scopes.push(decls.clone());
        let (prefix, name) = self.resolve(&raw_name, false)?;
        let mut attributes = Vec::with_capacity(raw_attrs.len());
        for (raw, value) in raw_attrs {
            let (aprefix, aname) = self.resolve(&raw, true)?;
            if attributes.iter().any(|a: &XmlAttribute| a.name == aname) {
                return Err(self.error(&format!("duplicate attribute '{}'", raw)));
            }
            attributes.push(XmlAttribute {
                name: aname,
                prefix: aprefix,
                value,
            });
        }

        let mut children = Vec::new();
        if !self_closing {
            loop {
                if self.at_end() {
                    return Err(self.eof(&format!("element '{}' is not closed", raw_name)));
                }
                if self.starts_with("</") {
                    self.advance(2);
                    let end_name = self.parse_name()?;
                    if end_name != raw_name {
                        return Err(self.error(&format!(
                            "end tag '{}' does not match start tag '{}'",
                            end_name, raw_name
                        )));
                    }
                    self.skip_whitespace();
                    self.expect(">")?;
                    break;
                } else if self.starts_with("<![CDATA[") {
                    self.advance(9);
                    let rest = self.rest();
                    let end = rest
                        .find("]]>")
                        .ok_or_else(|| self.eof("unterminated CDATA section"))?;
                    let text = String::from(&rest[..end]);
                    self.advance(end + 3);
                    push_text(&mut children, text);
                } else if self.starts_with("<!--") || self.starts_with("<?") {
                    self.skip_comment_or_pi()?;
                } else if self.starts_with("<") {
                    let child = self.parse_element(depth + 1)?;
                    children.push(XmlNode::Element(child));
                } else {
                    let text = self.parse_text()?;
                    push_text(&mut children, text);
                }
            }
        }
        self.scopes.pop();

        Ok(XmlElement {
            name,
            prefix,
            namespaces: decls,
            attributes,
            children,
        })
    }
}

fn push_text(children: &mut Vec<XmlNode>, text: String) {
    if let Some(XmlNode::Text(prev)) = children.last_mut() {
        prev.push_str(&text);
    } else {
        children.push(XmlNode::Text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_namespaces() {
        let doc = r#"<?xml version="1.0"?>
<a:Root xmlns:a="urn:a" xmlns="urn:default" b:x="1" xmlns:b="urn:b">
  <Child y="2">text &amp; more</Child>
  <!-- ignored -->
  <a:Other/>
</a:Root>"#;
        let root = parse_document(doc).unwrap();
        assert!(root.is("urn:a", "Root"));
        assert_eq!(root.attribute("urn:b", "x"), Some("1"));
        let child = root.child("urn:default", "Child").unwrap();
        assert_eq!(child.attribute("", "y"), Some("2"));
        assert_eq!(child.text(), "text & more");
        assert!(root.child("urn:a", "Other").is_some());
    }

    #[test]
    fn rewrite_is_stable() {
        let doc = r#"<p:E xmlns:p="urn:p"><p:F q="&quot;v&quot;"><G xmlns="urn:g">t</G></p:F></p:E>"#;
        let first = parse_document(doc).unwrap().to_xml_string();
        let second = parse_document(&first).unwrap().to_xml_string();
        assert_eq!(first, doc);
        assert_eq!(first, second);
    }

    #[test]
    fn detached_child_declares_inherited_prefix() {
        let root = parse_document(r#"<p:E xmlns:p="urn:p"><p:F/></p:E>"#).unwrap();
        let child = root.child("urn:p", "F").unwrap();
        let written = child.to_xml_string();
        assert_eq!(written, r#"<p:F xmlns:p="urn:p"/>"#);
        let again = parse_document(&written).unwrap().to_xml_string();
        assert_eq!(written, again);
    }

    #[test]
    fn built_elements_get_declarations() {
        let el = XmlElement::new("urn:x", "A")
            .with_child(XmlElement::new("urn:x", "B").with_text("1 < 2"))
            .with_child(XmlElement::new("", "C"));
        assert_eq!(
            el.to_xml_string(),
            r#"<A xmlns="urn:x"><B>1 &lt; 2</B><C xmlns=""/></A>"#
        );
    }

    #[test]
    fn errors_carry_position() {
        let err = parse_document("<a>\n  <b></c>\n</a>").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(!err.is_eof());

        let err = parse_document("<a><b>").unwrap_err();
        assert!(err.is_eof());

        let err = parse_document("<x:a/>").unwrap_err();
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn depth_quota_is_enforced() {
        let doc = "<a><a><a><a/></a></a></a>";
        assert!(parse_document_with_depth(doc, 4).is_ok());
        assert!(parse_document_with_depth(doc, 3).is_err());
    }

    #[test]
    fn fragments_parse_siblings() {
        let nodes = parse_fragment(r#"<a xmlns="urn:1"/><b xmlns="urn:2">x</b>"#, 8).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(write_fragment(&nodes), r#"<a xmlns="urn:1"/><b xmlns="urn:2">x</b>"#);
    }

    #[test]
    fn qname_values_resolve() {
        let el = XmlElement::new("urn:a", "V")
            .with_prefix("a")
            .with_namespace(Some("a"), "urn:a")
            .with_text("a:Action");
        assert_eq!(
            el.resolve_qname_value(&el.text()),
            Some(QName::new("urn:a", "Action"))
        );
    }

    #[test]
    fn prefix_parse_reports_consumed_bytes() {
        let src = "<a/>\n  <b>";
        let (root, used) = parse_document_prefix(src, 8).unwrap();
        assert_eq!(root.name.local, "a");
        assert_eq!(&src[used..], "<b>");
        assert!(parse_document_prefix(&src[used..], 8).unwrap_err().is_eof());
    }

    #[test]
    fn scope_sees_ancestor_declarations() {
        let doc = parse_document(
            r#"<s:Envelope xmlns:s="urn:s" xmlns:x="urn:x"><s:Body><v>x:Code</v><w>Bare</w></s:Body></s:Envelope>"#,
        )
        .unwrap();
        let body = doc.child("urn:s", "Body").unwrap();
        let scope = NamespaceScope::default().enter(&doc).enter(body);
        let v = body.child("", "v").unwrap();
        assert_eq!(
            scope.enter(v).resolve(&v.text()),
            Some(QName::new("urn:x", "Code"))
        );
        assert_eq!(v.resolve_qname_value(&v.text()), None);
        let w = body.child("", "w").unwrap();
        assert_eq!(scope.enter(w).resolve("Bare"), Some(QName::new("", "Bare")));
        assert_eq!(scope.resolve("nope:Code"), None);
    }
}
