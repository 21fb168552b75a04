use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::credentials::{key_identifier, Credentials};
use crate::errors::{AppError, AppResult};
use crate::telemetry::TelemetryClient;

const HEALTH_CHECK_ADDRESS: &str = "Berlin";
const HEALTH_CHECK_COUNTRY: &str = "Germany";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeCandidate {
    pub lon: f64,
    pub lat: f64,
}

/// Service-level failure from a lookup backend. `transient` decides whether
/// the client re-attempts the call.
#[derive(Debug, Clone)]
pub struct LookupFailure {
    pub transient: bool,
    pub message: String,
}

impl LookupFailure {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    /// Resolves one query to zero or more candidate locations. `country`
    /// narrows the search; only the health check uses it.
    async fn lookup(
        &self,
        address: &str,
        country: Option<&str>,
    ) -> Result<Vec<GeocodeCandidate>, LookupFailure>;
}

/// Cache-first, rate-limited, retrying front to the geocoding service.
/// Owns the per-run memo of resolved addresses; no eviction.
pub struct GeocodeClient {
    lookup: Arc<dyn GeocodeLookup>,
    cache: HashMap<String, (f64, f64)>,
    limiter: RateLimiter,
    max_retries: u32,
    telemetry: TelemetryClient,
}

impl GeocodeClient {
    pub fn new(config: &AppConfig, credentials: &Credentials, telemetry: TelemetryClient) -> Self {
        let http = HttpGeocodeClient::new(&config.geocode_api_base, credentials.google().clone());
        Self::with_lookup(Arc::new(http), config, telemetry)
    }

    pub fn with_lookup(
        lookup: Arc<dyn GeocodeLookup>,
        config: &AppConfig,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            lookup,
            cache: HashMap::new(),
            limiter: RateLimiter::new(config.min_request_interval()),
            max_retries: config.max_retries,
            telemetry,
        }
    }

    /// One deterministic known-address query to catch a misconfigured or
    /// invalid credential before any bulk work begins.
    pub async fn verify(&mut self) -> AppResult<()> {
        let candidates = self
            .lookup
            .lookup(HEALTH_CHECK_ADDRESS, Some(HEALTH_CHECK_COUNTRY))
            .await
            .map_err(|failure| {
                AppError::Config(format!("geocoder API check call failed: {}", failure.message))
            })?;
        let candidate = candidates.first().ok_or_else(|| {
            AppError::Config("geocoder API check returned no coordinate".to_string())
        })?;
        info!(
            lon = candidate.lon,
            lat = candidate.lat,
            "geocoder API works, key accepted"
        );
        let _ = self.telemetry.record("api_check", serde_json::json!({ "ok": true }));
        Ok(())
    }

    /// Resolves an address to `(lon, lat)`. Cache hits return immediately
    /// without touching the rate-limit timer.
    pub async fn resolve(&mut self, address: &str) -> AppResult<(f64, f64)> {
        if let Some(&coords) = self.cache.get(address) {
            info!("found cached value for {address}");
            return Ok(coords);
        }

        let begin = Instant::now();
        let mut attempt = 0_u32;
        loop {
            self.limiter.wait().await;
            attempt += 1;
            match self.lookup.lookup(address, None).await {
                Ok(candidates) => {
                    let Some(first) = candidates.first().copied() else {
                        self.log_outcome(address, begin.elapsed(), None, attempt);
                        return Err(AppError::geocode(address, attempt, "no results"));
                    };
                    if candidates.len() > 1 {
                        warn!(
                            "received multiple ({}) locations for '{address}'; using the first",
                            candidates.len()
                        );
                    }
                    let coords = (first.lon, first.lat);
                    self.cache.insert(address.to_string(), coords);
                    self.log_outcome(address, begin.elapsed(), Some(coords), attempt);
                    return Ok(coords);
                }
                Err(failure) if failure.transient && attempt <= self.max_retries => {
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        "transient geocode failure for '{address}': {}; retrying",
                        failure.message
                    );
                }
                Err(failure) => {
                    self.log_outcome(address, begin.elapsed(), None, attempt);
                    return Err(AppError::geocode(address, attempt, failure.message));
                }
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn log_outcome(
        &self,
        address: &str,
        elapsed: Duration,
        coords: Option<(f64, f64)>,
        attempts: u32,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match coords {
            Some((lon, lat)) => info!(
                "OK \t ({elapsed_ms} ms) \t {address} ({:.4}, {:.4})",
                lon, lat
            ),
            None => warn!("FAILED \t ({elapsed_ms} ms) \t {address} (attempts {attempts})"),
        }
        let _ = self.telemetry.record(
            "geocode_call",
            serde_json::json!({
                "outcome": if coords.is_some() { "OK" } else { "FAILED" },
                "elapsed_ms": elapsed_ms,
                "attempts": attempts,
            }),
        );
    }
}

/// Pacing guard: enforces a minimum interval since the previous remote
/// call. Not a token bucket; every cache miss is paced independently.
struct RateLimiter {
    min_interval: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(prev) = self.last_request {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

struct HttpGeocodeClient {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
}

impl HttpGeocodeClient {
    fn new(api_base: &str, api_key: SecretString) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("geocode http client");
        info!(key = %key_identifier(&api_key), "geocode client initiated");
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl GeocodeLookup for HttpGeocodeClient {
    async fn lookup(
        &self,
        address: &str,
        country: Option<&str>,
    ) -> Result<Vec<GeocodeCandidate>, LookupFailure> {
        let url = format!("{}/geocode/json", self.api_base);
        let mut query: Vec<(&str, String)> = vec![
            ("address", address.to_string()),
            ("key", self.api_key.expose_secret().to_string()),
        ];
        if let Some(country) = country {
            query.push(("components", format!("country:{country}")));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    LookupFailure::transient(err.to_string())
                } else {
                    LookupFailure::permanent(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(LookupFailure::transient(format!("upstream status {status}")));
        }
        if !status.is_success() {
            return Err(LookupFailure::permanent(format!("upstream status {status}")));
        }

        let parsed: GeocodeResponse = response
            .json()
            .await
            .map_err(|err| LookupFailure::permanent(format!("malformed response: {err}")))?;

        match parsed.status.as_str() {
            "OK" => Ok(parsed
                .results
                .iter()
                .map(|result| GeocodeCandidate {
                    lon: result.geometry.location.lng,
                    lat: result.geometry.location.lat,
                })
                .collect()),
            "ZERO_RESULTS" => Ok(Vec::new()),
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Err(LookupFailure::transient(format!(
                "service status {}: {}",
                parsed.status,
                parsed.error_message.unwrap_or_default()
            ))),
            other => Err(LookupFailure::permanent(format!(
                "service status {other}: {}",
                parsed.error_message.unwrap_or_default()
            ))),
        }
    }
}
