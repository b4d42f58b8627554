//! Event dispatcher: routes one decoded inbound event to the
//! inspection capability and produces the outbound decision, per the
//! event -> handler table.

use crate::capability::InspectionCapability;
use crate::context::{RequestContext, RequestContextCache, RequestKey};
use crate::decision::DecisionBuilder;
use crate::views::{RequestView, ResponseView};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Dispatches events for one connection. Owns the connection's request
/// context cache; the capability is shared (`Arc`) across connections.
pub struct EventDispatcher {
    capability: Arc<dyn InspectionCapability>,
    contexts: RequestContextCache,
}

impl EventDispatcher {
    pub fn new(capability: Arc<dyn InspectionCapability>) -> Self {
        Self {
            capability,
            contexts: RequestContextCache::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn contexts(&self) -> &RequestContextCache {
        &self.contexts
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch_request_headers(
        &self,
        key: RequestKey,
        method: String,
        uri: String,
        headers: HashMap<String, Vec<String>>,
        client_ip: String,
        route_id: Option<String>,
    ) -> DecisionBuilder {
        let ctx = RequestContext::new(method, uri, headers, client_ip, route_id);
        self.contexts.put_on_headers(key.clone(), ctx);
        // Clone out of the map and drop the guard before awaiting: no lock
        // may be held across a capability call.
        let ctx_owned = self.contexts.get(&key).expect("just inserted").clone();
        let view = RequestView::from_context(&ctx_owned, None);
        match self.capability.on_request(view).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(request_key = %key, error = %err, "on_request failed");
                DecisionBuilder::deny().block(500).with_body(format!("Agent error: {err}"))
            }
        }
    }

    pub async fn dispatch_request_body_chunk(
        &self,
        key: RequestKey,
        chunk: &[u8],
        is_last: bool,
    ) -> DecisionBuilder {
        if !self.contexts.append_body(&key, chunk) {
            warn!(request_key = %key, "request_body_chunk for unknown context");
            return DecisionBuilder::allow();
        }
        if !is_last {
            return DecisionBuilder::allow();
        }
        let ctx_owned = match self.contexts.get(&key) {
            Some(c) => c.clone(),
            None => return DecisionBuilder::allow(),
        };
        let body = ctx_owned.body.clone();
        let view = RequestView::from_context(&ctx_owned, Some(&body));
        match self.capability.on_request_body(view).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(request_key = %key, error = %err, "on_request_body failed");
                DecisionBuilder::deny().block(500).with_body(format!("Agent error: {err}"))
            }
        }
    }

    pub async fn dispatch_response_headers(
        &self,
        key: RequestKey,
        status: u16,
        headers: HashMap<String, Vec<String>>,
    ) -> DecisionBuilder {
        if !self.contexts.set_response_headers(&key, status, headers) {
            warn!(request_key = %key, "response_headers for unknown context");
            return DecisionBuilder::allow();
        }
        let ctx_owned = match self.contexts.get(&key) {
            Some(c) => c.clone(),
            None => return DecisionBuilder::allow(),
        };
        let req_view = RequestView::from_context(&ctx_owned, None);
        let snapshot = ctx_owned.response_headers.as_ref().expect("just set");
        let resp_view = ResponseView {
            status: snapshot.status,
            headers: &snapshot.headers,
            body: None,
        };
        match self.capability.on_response(req_view, resp_view).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(request_key = %key, error = %err, "on_response failed");
                DecisionBuilder::allow()
            }
        }
    }

    pub async fn dispatch_response_body_chunk(
        &self,
        key: RequestKey,
        chunk: &[u8],
    ) -> DecisionBuilder {
        let ctx_owned = match self.contexts.get(&key) {
            Some(c) => c.clone(),
            None => {
                warn!(request_key = %key, "response_body_chunk for unknown context");
                return DecisionBuilder::allow();
            }
        };
        if ctx_owned.response_headers.is_none() {
            warn!(
                request_key = %key,
                "response_body_chunk arrived before response_headers; treating as allow"
            );
            return DecisionBuilder::allow();
        }
        let req_view = RequestView::from_context(&ctx_owned, None);
        let snapshot = ctx_owned.response_headers.as_ref().expect("checked above");
        let resp_view = ResponseView {
            status: snapshot.status,
            headers: &snapshot.headers,
            body: Some(chunk),
        };
        match self.capability.on_response_body(req_view, resp_view).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(request_key = %key, error = %err, "on_response_body failed");
                DecisionBuilder::allow()
            }
        }
    }

    /// `request_complete` is logging-only; it removes the context and never
    /// produces a reply frame.
    pub async fn dispatch_request_complete(&self, key: RequestKey, status: u16, duration_ms: u64) {
        let removed = self.contexts.remove_on_terminal(&key);
        if let Some(ctx) = removed {
            let view = RequestView::from_context(&ctx, None);
            self.capability.on_request_complete(view, status, duration_ms).await;
        }
    }

    /// `configure` never produces a reply frame.
    pub async fn dispatch_configure(&self, config: serde_json::Value) {
        if let Err(err) = self.capability.on_configure(config).await {
            tracing::error!(error = %err, "on_configure failed");
        }
    }

    pub async fn dispatch_cancel_request(&self, key: RequestKey, reason: Option<String>) {
        self.contexts.remove_on_terminal(&key);
        self.capability
            .on_request_cancelled(&key, reason.as_deref())
            .await;
    }

    pub async fn dispatch_cancel_all(&self, reason: &str) {
        self.contexts.clear_all();
        self.capability.on_all_requests_cancelled(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingCapability {
        body_calls: AtomicUsize,
        last_body: parking_lot::Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl InspectionCapability for RecordingCapability {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn on_request(&self, _request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
            Ok(DecisionBuilder::allow())
        }

        async fn on_request_body(&self, request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
            self.body_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock() = request.body.unwrap_or_default().to_vec();
            Ok(DecisionBuilder::allow())
        }
    }

    fn headers() -> HashMap<String, Vec<String>> {
        HashMap::new()
    }

    #[tokio::test]
    async fn body_chunks_accumulate_before_on_request_body() {
        let cap = Arc::new(RecordingCapability {
            body_calls: AtomicUsize::new(0),
            last_body: parking_lot::Mutex::new(Vec::new()),
        });
        let dispatcher = EventDispatcher::new(cap.clone());
        let key = RequestKey::V2(7);

        dispatcher
            .dispatch_request_headers(key.clone(), "GET".into(), "/x".into(), headers(), "127.0.0.1".into(), None)
            .await;

        let d1 = dispatcher.dispatch_request_body_chunk(key.clone(), b"foo", false).await;
        assert_eq!(cap.body_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(d1.build().decision, crate::protocol::Decision::Allow));

        dispatcher.dispatch_request_body_chunk(key.clone(), b"bar", true).await;
        assert_eq!(cap.body_calls.load(Ordering::SeqCst), 1);
        assert_eq!(&*cap.last_body.lock(), b"foobar");
    }

    #[tokio::test]
    async fn response_body_before_headers_is_rejected_with_allow() {
        let cap = Arc::new(RecordingCapability {
            body_calls: AtomicUsize::new(0),
            last_body: parking_lot::Mutex::new(Vec::new()),
        });
        let dispatcher = EventDispatcher::new(cap);
        let key = RequestKey::V2(1);
        dispatcher
            .dispatch_request_headers(key.clone(), "GET".into(), "/x".into(), headers(), "127.0.0.1".into(), None)
            .await;

        let decision = dispatcher.dispatch_response_body_chunk(key, b"oops").await;
        assert!(matches!(decision.build().decision, crate::protocol::Decision::Allow));
    }

    #[tokio::test]
    async fn cancel_request_removes_context_and_notifies() {
        struct CancelSpy(AtomicUsize);
        #[async_trait]
        impl InspectionCapability for CancelSpy {
            async fn on_request_cancelled(&self, _key: &RequestKey, _reason: Option<&str>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let cap = Arc::new(CancelSpy(AtomicUsize::new(0)));
        let dispatcher = EventDispatcher::new(cap.clone());
        let key = RequestKey::V2(42);
        dispatcher
            .dispatch_request_headers(key.clone(), "GET".into(), "/".into(), headers(), "127.0.0.1".into(), None)
            .await;
        assert_eq!(dispatcher.active_count(), 1);

        dispatcher
            .dispatch_cancel_request(key, Some("client gone".to_string()))
            .await;
        assert_eq!(dispatcher.active_count(), 0);
        assert_eq!(cap.0.load(Ordering::SeqCst), 1);
    }
}
