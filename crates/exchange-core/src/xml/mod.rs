//! Minimal namespace-aware XML tree for SAML responses.
//!
//! Responses are parsed once into an owned tree so the pipeline can splice
//! decrypted assertions back in and canonicalize signed subtrees. Comments
//! and processing instructions are dropped; DOCTYPE declarations are
//! rejected outright.

pub mod c14n;
mod dom;

pub use dom::{Attribute, Document, Element, Node};

use crate::errors::ExchangeError;
use thiserror::Error;

/// Namespace URIs used across the response pipeline.
pub mod ns {
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const SAML: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
    pub const SAMLP: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
    pub const DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const XMLENC: &str = "http://www.w3.org/2001/04/xmlenc#";
    pub const XMLENC11: &str = "http://www.w3.org/2009/xmlenc11#";
    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
}

/// Maximum element nesting accepted by the parser.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("DOCTYPE declarations are not accepted")]
    DoctypeForbidden,

    #[error("Namespace prefix is not bound: {0}")]
    UnboundPrefix(String),

    #[error("Document has more than one root element")]
    MultipleRoots,

    #[error("Document has no root element")]
    NoRoot,

    #[error("Element nesting exceeds {MAX_DEPTH}")]
    TooDeep,
}

impl From<XmlError> for ExchangeError {
    fn from(_: XmlError) -> Self {
        ExchangeError::MalformedResponse
    }
}
