use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Asn;

/// How a query endpoint should be interpreted before lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    #[serde(rename = "IP")]
    Ip,
    #[serde(rename = "AS")]
    As,
}

/// A query endpoint: either a bare AS number, or an `[addr, kind]` pair
/// asking for translation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
    Plain(String),
    Typed(String, AddressKind),
}

/// Body of a `{"type": "request"}` wire message.
#[derive(Clone, Debug, Deserialize)]
pub struct RequestBody {
    pub tag: String,
    pub src: EndpointSpec,
    pub dst: EndpointSpec,
}

/// An IXP crossing attached to a returned path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IxpAnnotation {
    pub as1: Asn,
    pub as2: Asn,
    pub confidence: String,
}

/// One wire reply; `path: null` means "searched, no path found".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Response {
        tag: String,
        src: Asn,
        dst: Asn,
        path: Option<String>,
        ixps: BTreeMap<String, IxpAnnotation>,
    },
    Error {
        msg: String,
    },
}

impl Response {
    pub fn success(tag: &str, src: &str, dst: &str, path: Option<String>) -> Self {
        Response::Response {
            tag: tag.to_string(),
            src: src.to_string(),
            dst: dst.to_string(),
            path,
            ixps: BTreeMap::new(),
        }
    }

    pub fn error<S: Into<String>>(msg: S) -> Self {
        Response::Error { msg: msg.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Response::Response { path, .. } => path.as_deref(),
            Response::Error { .. } => None,
        }
    }
}
