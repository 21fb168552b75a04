use std::fs;
use std::path::Path;

use tracing::info;

use crate::errors::{AppError, AppResult};

/// Prompt templates for the completion client. Templates are flattened to
/// single-line strings before use: embedded newlines and tabs collapse to
/// single spaces.
#[derive(Debug, Clone)]
pub struct Prompts {
    system: String,
    user: String,
}

impl Prompts {
    pub fn load(system_path: &Path, user_path: &Path) -> AppResult<Self> {
        let system = read_template(system_path)?;
        let user = read_template(user_path)?;
        info!(
            "loaded prompt templates from {} and {}",
            system_path.display(),
            user_path.display()
        );
        Ok(Self { system, user })
    }

    #[cfg(test)]
    pub fn from_templates(system: &str, user: &str) -> Self {
        Self {
            system: collapse_whitespace(system),
            user: collapse_whitespace(user),
        }
    }

    /// System instruction with the no-address sentinel substituted for the
    /// `{no_address}` placeholder.
    pub fn render_system(&self, no_address_token: &str) -> String {
        self.system.replace("{no_address}", no_address_token)
    }

    /// User instruction with the establishment name substituted for the
    /// `{name}` placeholder.
    pub fn render_user(&self, name: &str) -> String {
        self.user.replace("{name}", name)
    }
}

fn read_template(path: &Path) -> AppResult<String> {
    let raw = fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!(
            "prompt file {} could not be read: {err}",
            path.display()
        ))
    })?;
    let flattened = collapse_whitespace(&raw);
    if flattened.is_empty() {
        return Err(AppError::Config(format!(
            "prompt file {} is empty",
            path.display()
        )));
    }
    Ok(flattened)
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
