use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::cache::ResponseCache;
use super::link::ControlSink;
use super::policy::HttpRelayPolicy;
use crate::config::join_local_url;
use crate::error::{RelayError, Result};
use crate::protocol::{Outbound, ProxyRequestMessage, ProxyResponseEnvelope, RequestId};

/// A request against the local HTTP service
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// The local HTTP service. Error statuses are responses, not failures;
/// `Err` means the service could not be reached.
#[async_trait]
pub trait LocalHttp: Send + Sync + 'static {
    async fn fetch(&self, request: LocalRequest) -> Result<LocalResponse>;
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// [`LocalHttp`] backed by a pooled reqwest client
pub struct ReqwestLocalHttp {
    client: Client,
}

impl ReqwestLocalHttp {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LocalHttp for ReqwestLocalHttp {
    async fn fetch(&self, request: LocalRequest) -> Result<LocalResponse> {
        let method = reqwest::Method::from_str(&request.method.to_ascii_uppercase())
            .map_err(|_| RelayError::Protocol(format!("invalid method '{}'", request.method)))?;

        let mut header_map = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(header_name), Ok(header_value)) =
                (HeaderName::from_str(name), HeaderValue::from_str(value))
            {
                header_map.insert(header_name, header_value);
            }
        }

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(header_map)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::RequestTimeout
            } else if e.is_builder() {
                RelayError::InvalidUrl(request.url.clone())
            } else {
                RelayError::Http(e)
            }
        })?;

        let status = response.status().as_u16();

        // Repeated headers are folded into one comma-separated value.
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let body = response.bytes().await?.to_vec();

        Ok(LocalResponse {
            status,
            headers,
            body,
        })
    }
}

enum Attempted {
    Response(LocalResponse),
    Rejected(RelayError),
    Exhausted,
}

/// Removes a request id from the in-flight set when the relay finishes
struct InFlight<'a> {
    set: &'a Mutex<HashSet<RequestId>>,
    request_id: RequestId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);
    }
}

/// Executes proxied HTTP calls for one control link.
pub struct HttpRelay {
    name: String,
    base_url: String,
    policy: HttpRelayPolicy,
    local: Arc<dyn LocalHttp>,
    cache: ResponseCache,
    in_flight: Mutex<HashSet<RequestId>>,
}

impl HttpRelay {
    pub fn new(
        name: &str,
        base_url: &str,
        local: Arc<dyn LocalHttp>,
        policy: HttpRelayPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            cache: ResponseCache::new(policy.cache_ttl),
            policy,
            local,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Forget every cached response; ids from an old connection must not replay
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Serve one `proxy-request`, publishing exactly one response.
    ///
    /// Returns the published status. A duplicate of a request still in flight
    /// is dropped; the running relay answers it.
    pub async fn handle(
        &self,
        sink: &dyn ControlSink,
        request: ProxyRequestMessage,
    ) -> Result<Option<u16>> {
        let request_id = request.request_id.clone();

        if let Some(cached) = self.cache.get(&request_id) {
            debug!(tunnel = %self.name, request_id = %request_id, "Replaying cached response");
            let status = cached.status;
            self.publish(sink, &request_id, cached).await?;
            return Ok(Some(status));
        }

        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone());
        if !inserted {
            debug!(tunnel = %self.name, request_id = %request_id, "Already in flight, dropping duplicate");
            return Ok(None);
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            request_id: request_id.clone(),
        };

        // The deadline only races response production. Publishing happens once,
        // after the race is decided, so the loop and the deadline can never
        // both answer.
        let attempted = tokio::select! {
            biased;
            _ = tokio::time::sleep(self.policy.deadline) => None,
            attempted = self.attempt_loop(&request) => Some(attempted),
        };

        let (response, cacheable) = match attempted {
            Some(Attempted::Response(local)) => (
                ProxyResponseEnvelope::from_local(local.status, local.headers, local.body),
                true,
            ),
            Some(Attempted::Rejected(e)) => {
                error!(
                    tunnel = %self.name,
                    request_id = %request_id,
                    "{} {} cannot be sent: {}",
                    request.method,
                    request.path,
                    e,
                );
                (ProxyResponseEnvelope::synthetic(400, &e.to_string()), false)
            }
            Some(Attempted::Exhausted) => {
                error!(
                    tunnel = %self.name,
                    request_id = %request_id,
                    "{} {} failed after {} attempts",
                    request.method,
                    request.path,
                    self.policy.max_attempts,
                );
                (
                    ProxyResponseEnvelope::synthetic(500, "Max retries reached"),
                    false,
                )
            }
            None => {
                error!(
                    tunnel = %self.name,
                    request_id = %request_id,
                    "{} {} exceeded {:?} deadline",
                    request.method,
                    request.path,
                    self.policy.deadline,
                );
                (
                    ProxyResponseEnvelope::synthetic(504, "Gateway Timeout"),
                    false,
                )
            }
        };

        let status = response.status;
        self.publish(sink, &request_id, response.clone()).await?;
        if cacheable {
            self.cache.insert(request_id, response);
        }
        Ok(Some(status))
    }

    async fn attempt_loop(&self, request: &ProxyRequestMessage) -> Attempted {
        let local_request = self.local_request(request);

        for attempt in 1..=self.policy.max_attempts {
            let fetch = self.local.fetch(local_request.clone());
            match tokio::time::timeout(self.policy.attempt_timeout, fetch).await {
                Ok(Ok(response)) => {
                    debug!(
                        tunnel = %self.name,
                        request_id = %request.request_id,
                        "{} {} -> {}",
                        request.method,
                        request.path,
                        response.status,
                    );
                    return Attempted::Response(response);
                }
                Ok(Err(e)) if !e.is_retryable() => return Attempted::Rejected(e),
                Ok(Err(e)) => warn!(
                    tunnel = %self.name,
                    request_id = %request.request_id,
                    "Attempt {}/{} failed: {}",
                    attempt,
                    self.policy.max_attempts,
                    e,
                ),
                Err(_) => warn!(
                    tunnel = %self.name,
                    request_id = %request.request_id,
                    "Attempt {}/{} timed out",
                    attempt,
                    self.policy.max_attempts,
                ),
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        Attempted::Exhausted
    }

    fn local_request(&self, request: &ProxyRequestMessage) -> LocalRequest {
        let body = match &request.body {
            Value::Null => None,
            Value::String(s) => Some(s.clone().into_bytes()),
            other => Some(other.to_string().into_bytes()),
        };

        let mut headers = request.headers.clone();
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        LocalRequest {
            method: request.method.clone(),
            url: join_local_url(&self.base_url, &request.path),
            headers,
            body,
            timeout: self.policy.attempt_timeout,
        }
    }

    async fn publish(
        &self,
        sink: &dyn ControlSink,
        request_id: &RequestId,
        response: ProxyResponseEnvelope,
    ) -> Result<()> {
        if !sink.is_connected() {
            info!(
                tunnel = %self.name,
                request_id = %request_id,
                "Waiting for control link before answering"
            );
            sink.wait_connected(self.policy.reconnect_wait).await?;
        }

        sink.emit_with_ack(
            Outbound::ProxyResponse {
                request_id: request_id.clone(),
                response,
            },
            self.policy.ack_timeout,
        )
        .await?;
        Ok(())
    }
}
