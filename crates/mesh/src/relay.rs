//! Domain-whitelisted HTTP relay.
//!
//! Peers without internet send [`RelayRequest`]s; a connected node executes
//! them against a fixed host allow-list with a per-client sliding-window
//! rate limit.  Errors map to HTTP-ish codes: disallowed host → 403,
//! throttled → 429, transport failure → 502.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use url::Url;

use crate::protocol::{RelayRequest, RelayResponse};

const WINDOW: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RelayHandler {
    allowed_hosts: Vec<String>,
    max_requests_per_window: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    client: reqwest::Client,
}

impl RelayHandler {
    pub fn new(allowed_hosts: Vec<String>, max_requests_per_window: usize) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            allowed_hosts,
            max_requests_per_window,
            windows: Mutex::new(HashMap::new()),
            client,
        }
    }

    /// Executes one relayed request end to end.
    pub async fn handle(&self, request: RelayRequest) -> RelayResponse {
        if !self.host_allowed(&request.url) {
            warn!(url = %request.url, client = %request.client_id, "relay request to disallowed host");
            return error_response(&request, 403, "Domain not allowed");
        }
        if !self.admit(&request.client_id) {
            debug!(client = %request.client_id, "relay client rate limited");
            return error_response(&request, 429, "Rate limited");
        }
        self.execute(request).await
    }

    /// Host must match the allow-list exactly.
    pub fn host_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.allowed_hosts.iter().any(|allowed| allowed == host)
    }

    /// Sliding-window admission: at most `max_requests_per_window` per
    /// client id per 60 seconds.
    fn admit(&self, client_id: &str) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = windows.entry(client_id.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max_requests_per_window {
            return false;
        }
        window.push_back(now);
        true
    }

    async fn execute(&self, request: RelayRequest) -> RelayResponse {
        let method = match request.method.to_uppercase().parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => return error_response(&request, 400, "Unsupported method"),
        };

        let mut builder = self.client.request(method, &request.url);
        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect::<HashMap<_, _>>();
                let body = response.text().await.ok();
                RelayResponse {
                    id: request.id,
                    status_code: status,
                    headers: Some(headers),
                    body,
                    error: None,
                }
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "relay transport failure");
                error_response(&request, 502, &err.to_string())
            }
        }
    }
}

fn error_response(request: &RelayRequest, status: u16, message: &str) -> RelayResponse {
    RelayResponse {
        id: request.id,
        status_code: status,
        headers: None,
        body: None,
        error: Some(message.to_string()),
    }
}
