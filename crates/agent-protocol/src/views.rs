//! Request/response views passed to the inspection capability.
//!
//! These are read-only projections over a `RequestContext`: the capability
//! never sees the wire types directly, only a `RequestView`/`ResponseView`
//! built by the dispatcher for each call.

use crate::context::RequestContext;
use std::collections::HashMap;

/// A read-only view of a request, as seen by the capability.
#[derive(Debug, Clone)]
pub struct RequestView<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub headers: &'a HashMap<String, Vec<String>>,
    pub client_ip: &'a str,
    pub route_id: Option<&'a str>,
    /// Present only for `on_request_body`; the accumulated body so far.
    pub body: Option<&'a [u8]>,
}

impl<'a> RequestView<'a> {
    pub fn from_context(ctx: &'a RequestContext, body: Option<&'a [u8]>) -> Self {
        Self {
            method: &ctx.method,
            uri: &ctx.uri,
            headers: &ctx.headers,
            client_ip: &ctx.client_ip,
            route_id: ctx.route_id.as_deref(),
            body,
        }
    }

    /// Splits `uri` into `(path, query)` on the first `?`. `query` is `None`
    /// when there is no `?`.
    pub fn path_and_query(&self) -> (&'a str, Option<&'a str>) {
        split_path_query(self.uri)
    }

    pub fn path(&self) -> &'a str {
        self.path_and_query().0
    }

    /// Percent-decoded query parameters, preserving insertion order and
    /// repeated keys. `+` is NOT translated to space.
    pub fn query_params(&self) -> Vec<(String, String)> {
        match self.path_and_query().1 {
            Some(q) => parse_query(q),
            None => Vec::new(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        header_first(self.headers, "content-type")
    }

    pub fn is_json(&self) -> bool {
        content_type_contains(self.content_type(), "json")
    }

    pub fn is_html(&self) -> bool {
        content_type_contains(self.content_type(), "html")
    }

    pub fn is_form(&self) -> bool {
        content_type_contains(self.content_type(), "x-www-form-urlencoded")
    }

    pub fn is_multipart(&self) -> bool {
        content_type_contains(self.content_type(), "multipart")
    }

    pub fn is_image(&self) -> bool {
        content_type_contains(self.content_type(), "image")
    }

    pub fn is_xml(&self) -> bool {
        content_type_contains(self.content_type(), "application/xml")
            || content_type_contains(self.content_type(), "text/xml")
    }

    pub fn is_javascript(&self) -> bool {
        content_type_contains(self.content_type(), "application/javascript")
            || content_type_contains(self.content_type(), "text/javascript")
    }
}

/// A read-only view of a response, as seen by the capability.
#[derive(Debug, Clone)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub headers: &'a HashMap<String, Vec<String>>,
    /// For `on_response_body`, the latest chunk only (not accumulated), per
    /// the dispatcher's body-accumulation semantics.
    pub body: Option<&'a [u8]>,
}

impl<'a> ResponseView<'a> {
    pub fn content_type(&self) -> Option<&str> {
        header_first(self.headers, "content-type")
    }

    pub fn is_json(&self) -> bool {
        content_type_contains(self.content_type(), "json")
    }

    pub fn is_html(&self) -> bool {
        content_type_contains(self.content_type(), "html")
    }
}

fn header_first<'a>(headers: &'a HashMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.first())
        .map(|s| s.as_str())
}

fn content_type_contains(content_type: Option<&str>, needle: &str) -> bool {
    match content_type {
        Some(ct) => ct.to_ascii_lowercase().contains(needle),
        None => false,
    }
}

fn split_path_query(uri: &str) -> (&str, Option<&str>) {
    match uri.find('?') {
        Some(idx) => (&uri[..idx], Some(&uri[idx + 1..])),
        None => (uri, None),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Minimal percent-decoder; `+` is left untouched, not treated as a space.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
