use super::c14n::{escape_attribute, escape_text};
use super::{ns, XmlError, MAX_DEPTH};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Prefix to namespace URI bindings; the default namespace uses `""`.
pub type NamespaceScope = BTreeMap<String, String>;

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Element,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    value: String,
}

impl Attribute {
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.local_name)
    }
}

/// An element with its namespace bindings fully resolved.
///
/// `in_scope` holds every binding visible at this element, including the
/// ones inherited from ancestors. Serialization and canonicalization derive
/// declarations from it, so an element moved under a new parent keeps its
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
    in_scope: NamespaceScope,
}

impl Document {
    /// Parse a complete document.
    ///
    /// # Errors
    ///
    /// Any [`XmlError`]; DOCTYPE, unbound prefixes, stray text outside the
    /// root and multiple roots are all rejected.
    pub fn parse(text: &str) -> Result<Self, XmlError> {
        let root = parse_tree(text, &NamespaceScope::new())?;
        Ok(Self { root })
    }

    pub fn from_root(root: Element) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }

    pub fn to_xml(&self) -> String {
        self.root.to_xml()
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        self.root.find_by_id(id)
    }

    /// Number of elements carrying `id` as their identifier.
    pub fn count_id(&self, id: &str) -> usize {
        self.root.count_id(id)
    }
}

impl Element {
    /// Parse a standalone element whose unresolved prefixes are looked up in
    /// `inherited`, as when an encrypted fragment is restored into its
    /// original context.
    ///
    /// # Errors
    ///
    /// Same as [`Document::parse`].
    pub fn parse_fragment(text: &str, inherited: &NamespaceScope) -> Result<Self, XmlError> {
        parse_tree(text, inherited)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.local_name)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    pub fn in_scope_namespaces(&self) -> &NamespaceScope {
        &self.in_scope
    }

    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local_name == local_name
    }

    /// Value of an attribute without a namespace.
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// The `ID`, `Id` or `id` attribute, in that order.
    pub fn id(&self) -> Option<&str> {
        self.attribute("ID")
            .or_else(|| self.attribute("Id"))
            .or_else(|| self.attribute("id"))
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.child_elements()
            .filter(move |element| element.is(namespace, local_name))
    }

    pub fn first_child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.child_elements()
            .find(|element| element.is(namespace, local_name))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// All descendants (not including `self`) with the given name, in
    /// document order.
    pub fn descendants_named<'a>(&'a self, namespace: &str, local_name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        for child in self.child_elements() {
            if child.is(namespace, local_name) {
                found.push(child);
            }
            found.extend(child.descendants_named(namespace, local_name));
        }
        found
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        if self.id() == Some(id) {
            return Some(self);
        }
        self.child_elements().find_map(|child| child.find_by_id(id))
    }

    pub fn count_id(&self, id: &str) -> usize {
        let own = usize::from(self.id() == Some(id));
        own + self
            .child_elements()
            .map(|child| child.count_id(id))
            .sum::<usize>()
    }

    /// Serialize with the namespace declarations this element needs when it
    /// stands alone.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, &NamespaceScope::new());
        out
    }

    fn write_xml(&self, out: &mut String, parent_scope: &NamespaceScope) {
        let name = self.qualified_name();
        out.push('<');
        out.push_str(&name);

        for (prefix, uri) in &self.in_scope {
            if parent_scope.get(prefix) != Some(uri) {
                push_declaration(out, prefix, uri);
            }
        }
        if parent_scope.contains_key("") && !self.in_scope.contains_key("") {
            out.push_str(" xmlns=\"\"");
        }

        for attribute in &self.attributes {
            out.push(' ');
            out.push_str(&attribute.qualified_name());
            out.push_str("=\"");
            out.push_str(&escape_attribute(&attribute.value));
            out.push('"');
        }
        out.push('>');

        for child in &self.children {
            match child {
                Node::Text(text) => out.push_str(&escape_text(text)),
                Node::Element(element) => element.write_xml(out, &self.in_scope),
            }
        }

        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }

    fn from_start(start: &BytesStart<'_>, parent_scope: &NamespaceScope) -> Result<Self, XmlError> {
        let qname = utf8(start.name().as_ref())?.to_string();
        let mut in_scope = parent_scope.clone();
        let mut raw_attributes = Vec::new();

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| XmlError::Syntax(e.to_string()))?;
            let key = utf8(attribute.key.as_ref())?;
            let value = attribute_value(&attribute.value)?;

            if key == "xmlns" {
                if value.is_empty() {
                    in_scope.remove("");
                } else {
                    in_scope.insert(String::new(), value);
                }
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(XmlError::Syntax(format!("empty binding for prefix {prefix}")));
                }
                in_scope.insert(prefix.to_string(), value);
            } else {
                raw_attributes.push((key.to_string(), value));
            }
        }

        let (prefix, local_name) = split_qname(&qname);
        let namespace = match prefix {
            None => in_scope.get("").cloned(),
            Some(prefix) => Some(resolve_prefix(prefix, &in_scope)?),
        };

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (attr_prefix, attr_local) = split_qname(&key);
            let attr_namespace = attr_prefix
                .map(|p| resolve_prefix(p, &in_scope))
                .transpose()?;
            attributes.push(Attribute {
                prefix: attr_prefix.map(str::to_string),
                local_name: attr_local.to_string(),
                namespace: attr_namespace,
                value,
            });
        }

        Ok(Self {
            prefix: prefix.map(str::to_string),
            local_name: local_name.to_string(),
            namespace,
            attributes,
            children: Vec::new(),
            in_scope,
        })
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }
}

fn parse_tree(text: &str, inherited: &NamespaceScope) -> Result<Element, XmlError> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| XmlError::Syntax(e.to_string()))?;

        match event {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep);
                }
                if stack.is_empty() && root.is_some() {
                    return Err(XmlError::MultipleRoots);
                }
                let scope = stack.last().map_or(inherited, |parent| &parent.in_scope);
                let element = Element::from_start(&start, scope)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep);
                }
                let scope = stack.last().map_or(inherited, |parent| &parent.in_scope);
                let element = Element::from_start(&start, scope)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::Syntax("unexpected end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(raw) => {
                let value = quick_xml::escape::unescape(utf8(&raw)?)
                    .map_err(|e| XmlError::Syntax(e.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::CData(raw) => {
                push_text(&mut stack, utf8(&raw)?)?;
            }
            Event::DocType(_) => return Err(XmlError::DoctypeForbidden),
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Syntax("unclosed element".to_string()));
    }
    root.ok_or(XmlError::NoRoot)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError::MultipleRoots);
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.push_text(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(XmlError::Syntax("text outside the root element".to_string())),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|e| XmlError::Syntax(e.to_string()))
}

/// Attribute-value normalization: literal whitespace becomes a space,
/// character references survive.
fn attribute_value(raw: &[u8]) -> Result<String, XmlError> {
    let normalized = utf8(raw)?.replace(['\n', '\t'], " ");
    quick_xml::escape::unescape(&normalized)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| XmlError::Syntax(e.to_string()))
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn resolve_prefix(prefix: &str, scope: &NamespaceScope) -> Result<String, XmlError> {
    if prefix == "xml" {
        return Ok(ns::XML.to_string());
    }
    scope
        .get(prefix)
        .cloned()
        .ok_or_else(|| XmlError::UnboundPrefix(prefix.to_string()))
}

fn qualify(prefix: Option<&str>, local_name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local_name}"),
        None => local_name.to_string(),
    }
}

pub(crate) fn push_declaration(out: &mut String, prefix: &str, uri: &str) {
    if prefix.is_empty() {
        out.push_str(" xmlns=\"");
    } else {
        out.push_str(" xmlns:");
        out.push_str(prefix);
        out.push_str("=\"");
    }
    out.push_str(&escape_attribute(uri));
    out.push('"');
}
