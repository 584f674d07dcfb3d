//! reCAPTCHA response verification.
//!
//! The verify endpoint rejects a response token that is replayed to it, but a
//! client may legitimately re-submit the same token (reconnect races, the
//! kiwi transport opening several channels), so successful responses are
//! cached per remote address for a short window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

const CACHE_LIFE: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

#[derive(Debug, Clone)]
struct CacheItem {
    created: Instant,
    remote_addr: String,
}

pub struct Verifier {
    url: String,
    secret: String,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CacheItem>>,
}

impl Verifier {
    pub fn new(url: &str, secret: &str) -> Verifier {
        Verifier {
            url: url.to_string(),
            secret: secret.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn verify_response(&self, response: &str, remote_addr: &str) -> bool {
        if response.is_empty() {
            return false;
        }
        if self.verify_cached(response, remote_addr) {
            return true;
        }

        let result = self
            .http
            .post(&self.url)
            .form(&[("secret", self.secret.as_str()), ("response", response)])
            .send()
            .await;

        let parsed: VerifyResponse = match result {
            Ok(http_response) => match http_response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("captcha verify response unreadable: {e}");
                    return false;
                }
            },
            Err(e) => {
                tracing::warn!("captcha verify request failed: {e}");
                return false;
            }
        };

        if parsed.success {
            let mut cache = self.cache.lock();
            let now = Instant::now();
            cache.retain(|_, item| now.duration_since(item.created) < CACHE_LIFE);
            cache.insert(
                response.to_string(),
                CacheItem {
                    created: now,
                    remote_addr: remote_addr.to_string(),
                },
            );
        } else if !parsed.error_codes.is_empty() {
            tracing::debug!("captcha verify rejected: {:?}", parsed.error_codes);
        }

        parsed.success
    }

    fn verify_cached(&self, response: &str, remote_addr: &str) -> bool {
        let mut cache = self.cache.lock();
        match cache.get(response) {
            Some(item) if item.remote_addr != remote_addr => false,
            Some(item) if item.created.elapsed() >= CACHE_LIFE => {
                cache.remove(response);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}
