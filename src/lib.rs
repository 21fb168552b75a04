pub mod completion;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod export;
pub mod geocode;
pub mod ledger;
pub mod pipeline;
pub mod prompts;
pub mod store;
pub mod telemetry;

use std::fs::OpenOptions;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use completion::CompletionClient;
pub use config::{AppConfig, NO_ADDRESS_TOKEN};
pub use credentials::{key_identifier, Credentials};
pub use errors::{AppError, AppResult};
pub use export::export_csv;
pub use geocode::GeocodeClient;
pub use ledger::UsageLedger;
pub use pipeline::{run_export, run_extraction, run_geocoding};
pub use prompts::Prompts;
pub use store::{read_names, AddressRef, WorkItem, WorkItemStore};
pub use telemetry::TelemetryClient;

/// Console logging plus an optional plain-text log file, initialized once.
pub fn init_tracing(log_file: Option<&str>) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,georef=debug"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());

        let file = log_file.and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        match file {
            Some(file) => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init(),
            None => registry.init(),
        }
    });
}
