//! Dispatch one operation over its transport and classify the result.

use crate::channel::{ChannelCorrelator, ChannelEnvelope, PersistentChannel};
use crate::client::RequestResponse;
use crate::request::{HttpRequest, RequestNormalizer};
use std::fmt;
use std::sync::Arc;
use sync_core::{GatewayRetryConfig, Operation, TransportKind};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// The request was rejected as malformed or not allowed.
    Validation,
    NotFound,
    /// The server failed in a way retrying will not fix.
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermanentCause {
    pub kind: PermanentKind,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for PermanentCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PermanentKind::Validation => "validation failed",
            PermanentKind::NotFound => "not found",
            PermanentKind::Server => "server error",
        };
        match self.status {
            Some(status) => write!(f, "{kind} ({status}): {}", self.message),
            None => write!(f, "{kind}: {}", self.message),
        }
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(serde_json::Value),
    /// Network trouble; retry with backoff.
    Transient(String),
    /// The session token was rejected.
    AuthExpired,
    /// Not delivered for a reason unrelated to the operation; requeue.
    Deferred(String),
    Permanent(PermanentCause),
}

fn is_gateway(status: u16) -> bool {
    matches!(status, 502..=504)
}

fn error_message(status: u16, body: &serde_json::Value) -> String {
    ["message", "error"]
        .iter()
        .find_map(|key| body.get(key).and_then(serde_json::Value::as_str))
        .map(str::to_string)
        .or_else(|| body.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("status {status}"))
}

/// Map a response status to an outcome. Gateway statuses map to
/// `Transient`; the request/response path retries them inline first.
pub fn classify_status(status: u16, body: serde_json::Value) -> DispatchOutcome {
    match status {
        200..=299 => DispatchOutcome::Success(body),
        401 => DispatchOutcome::AuthExpired,
        404 => permanent(PermanentKind::NotFound, status, &body),
        400..=499 => permanent(PermanentKind::Validation, status, &body),
        s if is_gateway(s) => DispatchOutcome::Transient(format!("gateway status {s}")),
        _ => permanent(PermanentKind::Server, status, &body),
    }
}

fn permanent(kind: PermanentKind, status: u16, body: &serde_json::Value) -> DispatchOutcome {
    DispatchOutcome::Permanent(PermanentCause {
        kind,
        status: Some(status),
        message: error_message(status, body),
    })
}

/// Sends operations over the transport they name.
pub struct Dispatcher {
    normalizer: RequestNormalizer,
    http: Arc<dyn RequestResponse>,
    channel: Option<Arc<dyn PersistentChannel>>,
    correlator: Arc<ChannelCorrelator>,
    gateway: GatewayRetryConfig,
}

impl Dispatcher {
    pub fn new(base_url: Url, http: Arc<dyn RequestResponse>, gateway: GatewayRetryConfig) -> Self {
        Self {
            normalizer: RequestNormalizer::new(base_url),
            http,
            channel: None,
            correlator: Arc::new(ChannelCorrelator::new()),
            gateway,
        }
    }

    pub fn with_channel(
        mut self,
        channel: Arc<dyn PersistentChannel>,
        correlator: Arc<ChannelCorrelator>,
    ) -> Self {
        self.channel = Some(channel);
        self.correlator = correlator;
        self
    }

    pub fn correlator(&self) -> &Arc<ChannelCorrelator> {
        &self.correlator
    }

    /// Whether `op`'s transport can take it right now. Request/response is
    /// always attempted; offline shows up as a transient failure.
    pub fn can_send(&self, op: &Operation) -> bool {
        match op.transport {
            TransportKind::RequestResponse => true,
            TransportKind::PersistentChannel => {
                self.channel.as_ref().is_some_and(|channel| channel.is_open())
            }
        }
    }

    pub async fn dispatch(&self, op: &Operation, token: Option<&str>) -> DispatchOutcome {
        let request = match self.normalizer.normalize(op, token) {
            Ok(request) => request,
            Err(e) => {
                warn!(operation_id = %op.id, error = %e, "Cannot build request");
                return DispatchOutcome::Permanent(PermanentCause {
                    kind: PermanentKind::Validation,
                    status: None,
                    message: e.to_string(),
                });
            }
        };

        let outcome = match op.transport {
            TransportKind::RequestResponse => self.send_request(op, request).await,
            TransportKind::PersistentChannel => self.send_over_channel(op, request).await,
        };
        debug!(operation_id = %op.id, outcome = ?outcome, "Dispatch finished");
        outcome
    }

    async fn send_request(&self, op: &Operation, request: HttpRequest) -> DispatchOutcome {
        let max_attempts = self.gateway.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.http.send(request.clone()).await {
                Ok(response) if is_gateway(response.status) => {
                    if attempt >= max_attempts {
                        warn!(
                            operation_id = %op.id,
                            status = response.status,
                            attempts = attempt,
                            "Gateway retries exhausted"
                        );
                        return DispatchOutcome::Transient(format!(
                            "gateway status {} after {attempt} attempts",
                            response.status
                        ));
                    }
                    info!(
                        operation_id = %op.id,
                        status = response.status,
                        attempt,
                        delay_ms = self.gateway.delay_ms,
                        "Gateway error, retrying"
                    );
                    tokio::time::sleep(self.gateway.delay()).await;
                }
                Ok(response) => return classify_status(response.status, response.body),
                Err(e) if e.is_transient() => {
                    debug!(operation_id = %op.id, error = %e, "Transport unavailable");
                    return DispatchOutcome::Transient(e.to_string());
                }
                Err(e) => {
                    return DispatchOutcome::Permanent(PermanentCause {
                        kind: PermanentKind::Validation,
                        status: None,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn send_over_channel(&self, op: &Operation, request: HttpRequest) -> DispatchOutcome {
        let Some(channel) = self.channel.as_ref() else {
            return DispatchOutcome::Deferred("no persistent channel configured".to_string());
        };
        if !channel.is_open() {
            return DispatchOutcome::Deferred("channel closed".to_string());
        }

        let reply = self.correlator.register(op.id.clone());
        let envelope = ChannelEnvelope {
            request_id: op.id.clone(),
            method: request.method,
            url: request.url.to_string(),
            headers: request.headers,
            body: request.body,
        };
        if let Err(e) = channel.send(envelope).await {
            self.correlator.cancel(&op.id);
            return DispatchOutcome::Deferred(e.to_string());
        }

        tokio::select! {
            biased;
            reply = reply => match reply {
                Ok(reply) => classify_status(reply.status, reply.body),
                Err(_) => {
                    DispatchOutcome::Deferred("channel closed while awaiting reply".to_string())
                }
            },
            _ = channel.closed() => {
                self.correlator.cancel(&op.id);
                debug!(operation_id = %op.id, "Channel closed while awaiting reply");
                DispatchOutcome::Deferred("channel closed while awaiting reply".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelReply, HttpResponse, MpscChannel, TransportError, TransportResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use sync_core::{HttpMethod, InstanceId, OperationDescriptor, OperationKind};

    /// Replays canned responses in order and records the requests.
    #[derive(Default)]
    struct ScriptedHttp {
        script: Mutex<VecDeque<TransportResult<HttpResponse>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn new(statuses: &[u16]) -> Arc<Self> {
            let script = statuses
                .iter()
                .map(|status| Ok(HttpResponse::new(*status, json!({"status": status}))))
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RequestResponse for ScriptedHttp {
        async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
            self.seen.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Unreachable("script exhausted".into())))
        }
    }

    fn gateway() -> GatewayRetryConfig {
        GatewayRetryConfig {
            max_attempts: 3,
            delay_ms: 1,
        }
    }

    fn dispatcher(http: Arc<ScriptedHttp>) -> Dispatcher {
        Dispatcher::new(
            Url::parse("https://chat.example.com/").unwrap(),
            http,
            gateway(),
        )
    }

    fn op(transport: TransportKind) -> Operation {
        let desc =
            OperationDescriptor::request(OperationKind::Create, HttpMethod::Post, "/conversations")
                .with_payload(json!({"title": "hello"}))
                .over(transport);
        Operation::from_descriptor(desc, InstanceId::from_string("tab-1"), Utc::now(), 0)
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(201, json!({})), DispatchOutcome::Success(_)));
        assert_eq!(classify_status(401, json!({})), DispatchOutcome::AuthExpired);
        assert!(matches!(classify_status(503, json!({})), DispatchOutcome::Transient(_)));

        let DispatchOutcome::Permanent(cause) = classify_status(404, json!({"message": "gone"}))
        else {
            panic!("404 must be permanent");
        };
        assert_eq!(cause.kind, PermanentKind::NotFound);
        assert_eq!(cause.message, "gone");

        let DispatchOutcome::Permanent(cause) =
            classify_status(422, json!({"error": "bad title"}))
        else {
            panic!("422 must be permanent");
        };
        assert_eq!(cause.kind, PermanentKind::Validation);

        let DispatchOutcome::Permanent(cause) = classify_status(500, json!(null)) else {
            panic!("500 must be permanent");
        };
        assert_eq!(cause.kind, PermanentKind::Server);
        assert_eq!(cause.message, "status 500");
    }

    #[tokio::test]
    async fn gateway_errors_retry_inline_then_succeed() {
        let http = ScriptedHttp::new(&[503, 503, 200]);
        let outcome = dispatcher(http.clone())
            .dispatch(&op(TransportKind::RequestResponse), Some("tok"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Success(json!({"status": 200})));
        assert_eq!(http.calls(), 3);
    }

    #[tokio::test]
    async fn gateway_errors_exhaust_into_transient() {
        let http = ScriptedHttp::new(&[502, 504, 503, 200]);
        let outcome = dispatcher(http.clone())
            .dispatch(&op(TransportKind::RequestResponse), None)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Transient(_)));
        assert_eq!(http.calls(), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let http = ScriptedHttp::new(&[401, 200]);
        let outcome = dispatcher(http.clone())
            .dispatch(&op(TransportKind::RequestResponse), Some("old"))
            .await;
        assert_eq!(outcome, DispatchOutcome::AuthExpired);
        assert_eq!(http.calls(), 1);
        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].headers["authorization"], "Bearer old");
        assert_eq!(seen[0].url.as_str(), "https://chat.example.com/conversations");
    }

    #[tokio::test]
    async fn offline_is_transient() {
        let http = ScriptedHttp::new(&[]);
        let outcome = dispatcher(http)
            .dispatch(&op(TransportKind::RequestResponse), None)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn channel_round_trip_uses_correlated_reply() {
        let (channel, mut outbound) = MpscChannel::new(4);
        channel.set_open(true);
        let correlator = Arc::new(ChannelCorrelator::new());
        let dispatcher = dispatcher(ScriptedHttp::new(&[]))
            .with_channel(Arc::new(channel), correlator.clone());

        let op = op(TransportKind::PersistentChannel);
        assert!(dispatcher.can_send(&op));

        let server = tokio::spawn(async move {
            let envelope = outbound.recv().await.unwrap();
            correlator.deliver(ChannelReply {
                request_id: envelope.request_id,
                status: 200,
                body: json!({"delivered": true}),
            });
        });

        let outcome = dispatcher.dispatch(&op, Some("tok")).await;
        server.await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success(json!({"delivered": true})));
    }

    #[tokio::test]
    async fn channel_closing_mid_flight_defers() {
        let (channel, _outbound) = MpscChannel::new(4);
        channel.set_open(true);
        let correlator = Arc::new(ChannelCorrelator::new());
        let dispatcher = Arc::new(
            dispatcher(ScriptedHttp::new(&[])).with_channel(Arc::new(channel), correlator.clone()),
        );

        let op = op(TransportKind::PersistentChannel);
        let task = {
            let dispatcher = dispatcher.clone();
            let op = op.clone();
            tokio::spawn(async move { dispatcher.dispatch(&op, None).await })
        };
        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        correlator.cancel_all();

        assert!(matches!(task.await.unwrap(), DispatchOutcome::Deferred(_)));
    }

    #[tokio::test]
    async fn channel_reporting_closed_releases_the_waiter() {
        let (channel, mut outbound) = MpscChannel::new(4);
        channel.set_open(true);
        let channel = Arc::new(channel);
        let correlator = Arc::new(ChannelCorrelator::new());
        let dispatcher = Arc::new(
            dispatcher(ScriptedHttp::new(&[])).with_channel(channel.clone(), correlator.clone()),
        );

        let op = op(TransportKind::PersistentChannel);
        let task = {
            let dispatcher = dispatcher.clone();
            let op = op.clone();
            tokio::spawn(async move { dispatcher.dispatch(&op, None).await })
        };
        outbound.recv().await.unwrap();
        channel.set_open(false);

        assert!(matches!(task.await.unwrap(), DispatchOutcome::Deferred(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_is_not_sendable() {
        let (channel, _outbound) = MpscChannel::new(4);
        let dispatcher = dispatcher(ScriptedHttp::new(&[]))
            .with_channel(Arc::new(channel), Arc::new(ChannelCorrelator::new()));
        assert!(!dispatcher.can_send(&op(TransportKind::PersistentChannel)));
        assert!(dispatcher.can_send(&op(TransportKind::RequestResponse)));
    }
}
