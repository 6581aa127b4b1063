//! Exclusive XML canonicalization (without comments).
//!
//! Comments never reach the tree, so the `#WithComments` variant produces
//! the same octets and is accepted by the signature layer as well.

use super::dom::{push_declaration, NamespaceScope};
use super::{Element, Node};
use std::collections::BTreeSet;

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

/// Canonicalize `element` and its subtree.
///
/// `inclusive_prefixes` is the `InclusiveNamespaces/@PrefixList` of the
/// transform (`#default` names the default namespace). `excluded` is
/// skipped along with its subtree, which is how the enveloped-signature
/// transform is applied; it is matched by identity, not by value.
pub fn canonicalize(
    element: &Element,
    inclusive_prefixes: &[String],
    excluded: Option<&Element>,
) -> String {
    let inclusive: BTreeSet<String> = inclusive_prefixes
        .iter()
        .map(|p| {
            if p == "#default" {
                String::new()
            } else {
                p.clone()
            }
        })
        .collect();

    let mut out = String::new();
    write_canonical(element, &NamespaceScope::new(), &inclusive, excluded, &mut out);
    out
}

/// Split a whitespace-separated `PrefixList`.
pub fn parse_prefix_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn write_canonical(
    element: &Element,
    rendered: &NamespaceScope,
    inclusive: &BTreeSet<String>,
    excluded: Option<&Element>,
    out: &mut String,
) {
    let in_scope = element.in_scope_namespaces();

    let mut utilized: BTreeSet<String> = BTreeSet::new();
    utilized.insert(element.prefix().unwrap_or_default().to_string());
    for attribute in element.attributes() {
        if let Some(prefix) = attribute.prefix() {
            utilized.insert(prefix.to_string());
        }
    }
    for prefix in inclusive {
        if in_scope.contains_key(prefix) {
            utilized.insert(prefix.clone());
        }
    }
    utilized.remove("xml");

    let mut now_rendered = rendered.clone();
    let mut declarations: Vec<(String, String)> = Vec::new();
    for prefix in utilized {
        match in_scope.get(&prefix) {
            Some(uri) => {
                if rendered.get(&prefix) != Some(uri) {
                    declarations.push((prefix.clone(), uri.clone()));
                    now_rendered.insert(prefix, uri.clone());
                }
            }
            None => {
                // Only the default namespace can be unbound here.
                if prefix.is_empty() && rendered.get("").is_some_and(|uri| !uri.is_empty()) {
                    declarations.push((String::new(), String::new()));
                    now_rendered.insert(String::new(), String::new());
                }
            }
        }
    }

    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);

    for (prefix, uri) in &declarations {
        push_declaration(out, prefix, uri);
    }

    let mut attributes: Vec<_> = element.attributes().iter().collect();
    attributes.sort_by(|a, b| {
        (a.namespace().unwrap_or_default(), a.local_name())
            .cmp(&(b.namespace().unwrap_or_default(), b.local_name()))
    });
    for attribute in attributes {
        out.push(' ');
        out.push_str(&attribute.qualified_name());
        out.push_str("=\"");
        out.push_str(&escape_attribute(attribute.value()));
        out.push('"');
    }
    out.push('>');

    for child in element.children() {
        match child {
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::Element(child) => {
                if excluded.is_some_and(|skip| std::ptr::eq(skip, child)) {
                    continue;
                }
                write_canonical(child, &now_rendered, inclusive, excluded, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

pub(crate) fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\r' => escaped.push_str("&#xD;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub(crate) fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '"' => escaped.push_str("&quot;"),
            '\t' => escaped.push_str("&#x9;"),
            '\n' => escaped.push_str("&#xA;"),
            '\r' => escaped.push_str("&#xD;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
