//! HTTP transport.
//!
//! Request/response only. URL and verb selection are injected strategies;
//! the defaults map `/{version?}/{service}/{operation}` and the usual CRUD
//! operation names. Bodies are JSON except for `GET`, where the payload's
//! top-level fields become query parameters.

use super::{aborted_item, closed_item, Transport};
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, Method, ResponseItem};
use crate::streaming::{self, ItemStream};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type UrlStrategy = Arc<dyn Fn(&Method, &str) -> String + Send + Sync>;
pub type VerbStrategy = Arc<dyn Fn(&Method) -> reqwest::Method + Send + Sync>;

pub fn default_url_strategy(method: &Method, base_url: &str) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();
    if let Some(version) = &method.version {
        url.push('/');
        url.push_str(version);
    }
    url.push('/');
    url.push_str(&method.service);
    url.push('/');
    url.push_str(&method.operation);
    url
}

pub fn default_verb_strategy(method: &Method) -> reqwest::Method {
    match method.operation.as_str() {
        "get" | "list" => reqwest::Method::GET,
        "create" => reqwest::Method::POST,
        "update" => reqwest::Method::PUT,
        "patch" => reqwest::Method::PATCH,
        "delete" => reqwest::Method::DELETE,
        _ => reqwest::Method::POST,
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    url_strategy: UrlStrategy,
    verb_strategy: VerbStrategy,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            url_strategy: Arc::new(default_url_strategy),
            verb_strategy: Arc::new(default_verb_strategy),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_url_strategy(mut self, strategy: UrlStrategy) -> Self {
        self.url_strategy = strategy;
        self
    }

    pub fn with_verb_strategy(mut self, strategy: VerbStrategy) -> Self {
        self.verb_strategy = strategy;
        self
    }

    fn build_request(&self, envelope: &Envelope) -> reqwest::RequestBuilder {
        let url = (self.url_strategy)(&envelope.method, &self.base_url);
        let verb = (self.verb_strategy)(&envelope.method);

        let mut request = self.client.request(verb.clone(), url);
        for (key, value) in &envelope.metadata {
            let header = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(key, header);
        }

        if verb == reqwest::Method::GET {
            if let Value::Object(fields) = &envelope.payload {
                let query: Vec<(String, String)> = fields
                    .iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect();
                request = request.query(&query);
            }
        } else if !envelope.payload.is_null() {
            request = request.json(&envelope.payload);
        }
        request
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, envelope: Envelope) -> ItemStream {
        if self.closed.load(Ordering::SeqCst) {
            return streaming::single(closed_item(&envelope, self.name()));
        }
        if envelope.is_cancelled() {
            return streaming::single(aborted_item(&envelope));
        }

        let request = self.build_request(&envelope);
        let response = match &envelope.cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return streaming::single(aborted_item(&envelope));
                    }
                    response = request.send() => response,
                }
            }
            None => request.send().await,
        };

        let item = match response {
            Ok(response) => {
                let status = response.status();
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                if status.is_success() {
                    ResponseItem::success_with_code(envelope.id.clone(), status.as_u16(), body)
                } else {
                    let message = body
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
                    ResponseItem::error(
                        envelope.id.clone(),
                        RpcError::transport(status.as_u16(), message).with_details(body),
                    )
                }
            }
            // Connection-level failures are transient by nature.
            Err(err) => ResponseItem::error(
                envelope.id.clone(),
                RpcError::new(
                    crate::error::code::EXECUTION_ERROR,
                    format!("HTTP request failed: {}", err),
                    true,
                ),
            ),
        };
        streaming::single(item)
    }

    async fn close(&self) -> RpcResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
