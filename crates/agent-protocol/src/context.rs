//! Request context cache: per-connection state keyed by `RequestKey`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Instant;

/// Identifies one in-flight request on a connection. v1 connections key by
/// correlation id; v2 connections key by the 64-bit request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    V1(String),
    V2(i64),
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKey::V1(s) => write!(f, "{s}"),
            RequestKey::V2(id) => write!(f, "{id}"),
        }
    }
}

/// Accumulated per-request state. Created on the first request-headers
/// event; mutated only by the dispatcher (append-only body, set-once
/// response headers); removed on any terminal event.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, Vec<String>>,
    pub client_ip: String,
    pub route_id: Option<String>,
    pub body: Vec<u8>,
    pub response_headers: Option<ResponseHeadersSnapshot>,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ResponseHeadersSnapshot {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
}

impl RequestContext {
    pub fn new(
        method: impl Into<String>,
        uri: impl Into<String>,
        headers: HashMap<String, Vec<String>>,
        client_ip: impl Into<String>,
        route_id: Option<String>,
    ) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers,
            client_ip: client_ip.into(),
            route_id,
            body: Vec::new(),
            response_headers: None,
            created_at: Instant::now(),
        }
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

/// A concurrent map of `RequestKey` -> `RequestContext`, scoped to one
/// connection. Safe to share across tasks if the connection's dispatch model
/// is concurrent; a single-threaded connection loop may also use it directly.
#[derive(Debug, Default)]
pub struct RequestContextCache {
    inner: DashMap<RequestKey, RequestContext>,
}

impl RequestContextCache {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Creates a context for `key` on a request-headers event, replacing any
    /// previous context for the same key (the peer is responsible for not
    /// reusing keys within an overlap window; the core does not enforce it).
    pub fn put_on_headers(&self, key: RequestKey, context: RequestContext) {
        self.inner.insert(key, context);
    }

    pub fn append_body(&self, key: &RequestKey, chunk: &[u8]) -> bool {
        match self.inner.get_mut(key) {
            Some(mut ctx) => {
                ctx.append_body(chunk);
                true
            }
            None => false,
        }
    }

    pub fn set_response_headers(&self, key: &RequestKey, status: u16, headers: HashMap<String, Vec<String>>) -> bool {
        match self.inner.get_mut(key) {
            Some(mut ctx) => {
                ctx.response_headers = Some(ResponseHeadersSnapshot { status, headers });
                true
            }
            None => false,
        }
    }

    pub fn remove_on_terminal(&self, key: &RequestKey) -> Option<RequestContext> {
        self.inner.remove(key).map(|(_, ctx)| ctx)
    }

    pub fn get(&self, key: &RequestKey) -> Option<dashmap::mapref::one::Ref<'_, RequestKey, RequestContext>> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clears every context, returning their keys (for `cancel_all`).
    pub fn clear_all(&self) -> Vec<RequestKey> {
        let keys: Vec<RequestKey> = self.inner.iter().map(|e| e.key().clone()).collect();
        self.inner.clear();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> RequestContext {
        RequestContext::new("GET", "/a", HashMap::new(), "127.0.0.1", None)
    }

    #[test]
    fn put_then_remove_round_trips() {
        let cache = RequestContextCache::new();
        let key = RequestKey::V1("c1".to_string());
        cache.put_on_headers(key.clone(), sample_context());
        assert!(cache.contains(&key));
        let removed = cache.remove_on_terminal(&key);
        assert!(removed.is_some());
        assert!(!cache.contains(&key));
    }

    #[test]
    fn body_chunks_append_in_arrival_order() {
        let cache = RequestContextCache::new();
        let key = RequestKey::V2(7);
        cache.put_on_headers(key.clone(), sample_context());
        cache.append_body(&key, b"foo");
        cache.append_body(&key, b"bar");
        let ctx = cache.get(&key).unwrap();
        assert_eq!(ctx.body, b"foobar");
    }

    #[test]
    fn missing_context_operations_return_false_or_none() {
        let cache = RequestContextCache::new();
        let key = RequestKey::V1("missing".to_string());
        assert!(!cache.append_body(&key, b"x"));
        assert!(!cache.set_response_headers(&key, 200, HashMap::new()));
        assert!(cache.remove_on_terminal(&key).is_none());
    }

    #[test]
    fn clear_all_empties_the_cache() {
        let cache = RequestContextCache::new();
        cache.put_on_headers(RequestKey::V1("a".into()), sample_context());
        cache.put_on_headers(RequestKey::V1("b".into()), sample_context());
        let cleared = cache.clear_all();
        assert_eq!(cleared.len(), 2);
        assert!(cache.is_empty());
    }
}
