//! Wire-level request/response values and request normalization.

use crate::TransportResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sync_core::{HttpMethod, Operation};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    /// Lower-case header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// Body text as JSON; empty text becomes `null`, anything else that is
    /// not JSON is kept as a string.
    pub fn from_text(status: u16, text: &str) -> Self {
        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
        };
        Self { status, body }
    }
}

/// Turns an operation into a concrete request against the service.
#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    base_url: Url,
}

impl RequestNormalizer {
    /// Relative endpoints resolve underneath `base_url`'s path.
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn resolve(&self, endpoint: &str) -> TransportResult<Url> {
        match Url::parse(endpoint) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(self.base_url.join(endpoint.trim_start_matches('/'))?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the request for `op`, attaching `token` as a bearer credential
    /// unless the operation carries its own authorization header.
    pub fn normalize(&self, op: &Operation, token: Option<&str>) -> TransportResult<HttpRequest> {
        let url = self.resolve(&op.endpoint)?;
        let mut headers: BTreeMap<String, String> = op
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();

        headers
            .entry("accept".to_string())
            .or_insert_with(|| "application/json".to_string());
        if op.payload.is_some() {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
        }
        if let Some(token) = token {
            headers
                .entry("authorization".to_string())
                .or_insert_with(|| format!("Bearer {token}"));
        }

        Ok(HttpRequest {
            method: op.method,
            url,
            headers,
            body: op.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sync_core::{InstanceId, OperationDescriptor, OperationKind};

    fn normalizer() -> RequestNormalizer {
        RequestNormalizer::new(Url::parse("https://chat.example.com/api/v1").unwrap())
    }

    fn op(desc: OperationDescriptor) -> Operation {
        Operation::from_descriptor(desc, InstanceId::from_string("tab-1"), Utc::now(), 0)
    }

    #[test]
    fn relative_endpoints_resolve_under_base_path() {
        let n = normalizer();
        assert_eq!(
            n.resolve("/conversations").unwrap().as_str(),
            "https://chat.example.com/api/v1/conversations"
        );
        assert_eq!(
            n.resolve("messages?limit=5").unwrap().as_str(),
            "https://chat.example.com/api/v1/messages?limit=5"
        );
        assert_eq!(
            n.resolve("https://files.example.com/upload").unwrap().as_str(),
            "https://files.example.com/upload"
        );
    }

    #[test]
    fn headers_are_lowercased_and_defaulted() {
        let desc =
            OperationDescriptor::request(OperationKind::Create, HttpMethod::Post, "/conversations")
                .with_header("X-Client-Version", "2.1")
                .with_payload(serde_json::json!({"title": "hi"}));
        let request = normalizer().normalize(&op(desc), Some("tok")).unwrap();

        assert_eq!(request.headers["x-client-version"], "2.1");
        assert_eq!(request.headers["accept"], "application/json");
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.headers["authorization"], "Bearer tok");
        assert_eq!(request.method, HttpMethod::Post);
    }

    #[test]
    fn explicit_authorization_is_kept() {
        let desc = OperationDescriptor::request(OperationKind::Delete, HttpMethod::Delete, "/x")
            .with_header("Authorization", "Basic abc");
        let request = normalizer().normalize(&op(desc), Some("tok")).unwrap();
        assert_eq!(request.headers["authorization"], "Basic abc");
        assert!(!request.headers.contains_key("content-type"));
    }

    #[test]
    fn response_text_parsing() {
        assert_eq!(HttpResponse::from_text(204, "").body, serde_json::Value::Null);
        assert_eq!(HttpResponse::from_text(200, r#"{"id":1}"#).body["id"], 1);
        assert_eq!(
            HttpResponse::from_text(502, "Bad Gateway").body,
            serde_json::Value::String("Bad Gateway".into())
        );
    }
}
