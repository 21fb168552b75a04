use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error("extraction failed for '{name}': {message}")]
    Extraction { name: String, message: String },
    #[error("geocoding failed for '{address}' after {attempts} attempt(s): {message}")]
    Geocode {
        address: String,
        attempts: u32,
        message: String,
    },
}

impl AppError {
    pub fn extraction(name: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Extraction {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn geocode(address: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        AppError::Geocode {
            address: address.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Only configuration problems abort a whole run; everything else is
    /// handled item-locally by the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::Path(_))
    }
}
