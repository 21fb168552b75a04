use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

/// Persistent token accounting keyed by credential identity. The backing
/// file holds the full mapping and is read-merge-written on every flush so
/// counts recorded under other identities survive.
pub struct UsageLedger {
    path: PathBuf,
    identity: String,
    loaded_total: u64,
    total: u64,
    session_prompt_tokens: u64,
    session_completion_tokens: u64,
    last_call_tokens: Option<u64>,
}

impl UsageLedger {
    pub fn open(path: impl Into<PathBuf>, identity: impl Into<String>) -> AppResult<Self> {
        let path = path.into();
        let identity = identity.into();
        let loaded_total = read_mapping(&path)?
            .get(&identity)
            .copied()
            .unwrap_or(0);
        if loaded_total > 0 {
            info!(total = loaded_total, "loaded prior token count from ledger");
        }
        Ok(Self {
            path,
            identity,
            loaded_total,
            total: loaded_total,
            session_prompt_tokens: 0,
            session_completion_tokens: 0,
            last_call_tokens: None,
        })
    }

    /// Count found in the ledger when this session opened it.
    pub fn loaded(&self) -> u64 {
        self.loaded_total
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn session_prompt_tokens(&self) -> u64 {
        self.session_prompt_tokens
    }

    pub fn session_completion_tokens(&self) -> u64 {
        self.session_completion_tokens
    }

    pub fn last_call_tokens(&self) -> Option<u64> {
        self.last_call_tokens
    }

    /// Accumulates one completed call and flushes the ledger.
    pub fn add(&mut self, prompt_tokens: u64, completion_tokens: u64) -> AppResult<()> {
        self.session_prompt_tokens += prompt_tokens;
        self.session_completion_tokens += completion_tokens;
        let call_total = prompt_tokens + completion_tokens;
        self.last_call_tokens = Some(call_total);
        self.total += call_total;
        self.flush()
    }

    /// Read-merge-writes the full mapping. Skips the write entirely when
    /// the total has not moved since it was loaded this session.
    pub fn flush(&self) -> AppResult<()> {
        if self.total == self.loaded_total {
            debug!("token count unchanged; skipping ledger write");
            return Ok(());
        }

        let mut mapping = read_mapping(&self.path)?;
        mapping.insert(self.identity.clone(), self.total);
        write_mapping(&self.path, &mapping)
    }
}

fn read_mapping(path: &Path) -> AppResult<BTreeMap<String, u64>> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(mapping) => Ok(mapping),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = ?err,
                    "token ledger is not valid JSON; starting from an empty mapping"
                );
                Ok(BTreeMap::new())
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn write_mapping(path: &Path, mapping: &BTreeMap<String, u64>) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    // Write-then-rename keeps the ledger intact through a crash mid-write.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string(mapping)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn returns_zero_when_no_prior_record() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::open(dir.path().join("tokens.count"), "id-A").unwrap();
        assert_eq!(ledger.loaded(), 0);
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn merges_new_usage_into_prior_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.count");
        fs::write(&path, r#"{"id-A": 100}"#).unwrap();

        let mut ledger = UsageLedger::open(&path, "id-A").unwrap();
        assert_eq!(ledger.loaded(), 100);
        ledger.add(30, 20).unwrap();

        let mapping: BTreeMap<String, u64> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(mapping.get("id-A"), Some(&150));
    }

    #[test]
    fn preserves_other_identities_on_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.count");
        fs::write(&path, r#"{"id-A": 100, "id-B": 7}"#).unwrap();

        let mut ledger = UsageLedger::open(&path, "id-A").unwrap();
        ledger.add(1, 1).unwrap();

        let mapping: BTreeMap<String, u64> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(mapping.get("id-A"), Some(&102));
        assert_eq!(mapping.get("id-B"), Some(&7));
    }

    #[test]
    fn skips_write_when_total_is_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.count");

        let ledger = UsageLedger::open(&path, "id-A").unwrap();
        ledger.flush().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn tracks_session_counters() {
        let dir = tempdir().unwrap();
        let mut ledger = UsageLedger::open(dir.path().join("tokens.count"), "id-A").unwrap();
        ledger.add(10, 5).unwrap();
        ledger.add(4, 6).unwrap();
        assert_eq!(ledger.session_prompt_tokens(), 14);
        assert_eq!(ledger.session_completion_tokens(), 11);
        assert_eq!(ledger.last_call_tokens(), Some(10));
        assert_eq!(ledger.total(), 25);
    }

    #[test]
    fn recovers_from_corrupt_ledger_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.count");
        fs::write(&path, "not json").unwrap();

        let mut ledger = UsageLedger::open(&path, "id-A").unwrap();
        assert_eq!(ledger.loaded(), 0);
        ledger.add(5, 5).unwrap();

        let mapping: BTreeMap<String, u64> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(mapping.get("id-A"), Some(&10));
    }
}
