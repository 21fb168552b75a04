use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 200;

pub const NO_ADDRESS_TOKEN: &str = "NO_ADDRESS";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_retries: u32,
    pub max_requests_per_minute: u32,
    pub openai_model: String,
    pub openai_temperature: f64,
    pub openai_api_base: String,
    pub geocode_api_base: String,
    pub credentials_file: String,
    pub system_prompt_file: String,
    pub user_prompt_file: String,
    pub tokens_file: String,
    pub establishments_file: String,
    pub addresses_dir: String,
    pub geocoded_dir: String,
    pub export_csv_file: String,
    pub log_file: Option<String>,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

/// Profile safe to log or print; carries no secret-bearing values.
#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub max_retries: u32,
    pub max_requests_per_minute: u32,
    pub openai_model: String,
    pub openai_temperature: f64,
    pub addresses_dir: String,
    pub geocoded_dir: String,
    pub export_csv_file: String,
    pub telemetry_enabled_by_default: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            max_retries: parse_u32("GEOREF_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            max_requests_per_minute: parse_u32(
                "GEOREF_MAX_REQUESTS_PER_MINUTE",
                DEFAULT_MAX_REQUESTS_PER_MINUTE,
            )
            .max(1),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            openai_temperature: parse_f64("OPENAI_TEMPERATURE", 0.5),
            openai_api_base: trim_base(
                env::var("OPENAI_API_BASE")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            ),
            geocode_api_base: trim_base(
                env::var("GEOCODE_API_BASE")
                    .unwrap_or_else(|_| "https://maps.googleapis.com/maps/api".to_string()),
            ),
            credentials_file: env::var("GEOREF_CREDENTIALS_FILE")
                .unwrap_or_else(|_| "credentials.json".to_string()),
            system_prompt_file: env::var("GEOREF_SYSTEM_PROMPT_FILE")
                .unwrap_or_else(|_| "system.prompt".to_string()),
            user_prompt_file: env::var("GEOREF_USER_PROMPT_FILE")
                .unwrap_or_else(|_| "user.prompt".to_string()),
            tokens_file: env::var("GEOREF_TOKENS_FILE")
                .unwrap_or_else(|_| "tokens.count".to_string()),
            establishments_file: env::var("GEOREF_ESTABLISHMENTS_FILE")
                .unwrap_or_else(|_| "establishments.txt".to_string()),
            addresses_dir: env::var("GEOREF_ADDRESSES_DIR")
                .unwrap_or_else(|_| "addresses".to_string()),
            geocoded_dir: env::var("GEOREF_GEOCODED_DIR")
                .unwrap_or_else(|_| "geocoded".to_string()),
            export_csv_file: env::var("GEOREF_EXPORT_CSV")
                .unwrap_or_else(|_| "geocoded_places.csv".to_string()),
            log_file: match env::var("GEOREF_LOG_FILE") {
                Ok(value) if value.trim().is_empty() => None,
                Ok(value) => Some(value),
                Err(_) => Some("geocoder.log".to_string()),
            },
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
        }
    }

    /// Pacing floor between two remote geocode calls.
    pub fn min_request_interval(&self) -> std::time::Duration {
        let millis = (60_000_f64 / self.max_requests_per_minute as f64).ceil() as u64;
        std::time::Duration::from_millis(millis)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            max_retries: self.max_retries,
            max_requests_per_minute: self.max_requests_per_minute,
            openai_model: self.openai_model.clone(),
            openai_temperature: self.openai_temperature,
            addresses_dir: self.addresses_dir.clone(),
            geocoded_dir: self.geocoded_dir.clone(),
            export_csv_file: self.export_csv_file.clone(),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
        }
    }
}

fn trim_base(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
