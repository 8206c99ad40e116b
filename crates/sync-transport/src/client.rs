//! Request/response collaborator and its reqwest implementation.

use crate::{HttpRequest, HttpResponse, TransportError, TransportResult};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use sync_core::HttpMethod;
use tracing::debug;

/// One HTTP exchange. Implementations do not retry.
#[async_trait]
pub trait RequestResponse: Send + Sync {
    async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse>;
}

/// [`RequestResponse`] over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// Client whose every attempt is bounded by `timeout`.
    pub fn new(timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Unreachable(e.to_string())
    } else {
        TransportError::Http(e)
    }
}

#[async_trait]
impl RequestResponse for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        debug!(method = request.method.as_str(), url = %request.url, "Sending request");

        let mut builder = self.client.request(method(request.method), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(from_reqwest)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(from_reqwest)?;

        debug!(url = %request.url, status, "Received response");
        Ok(HttpResponse::from_text(status, &text))
    }
}
