use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};

/// One address candidate for an establishment. `lon` and `lat` are set
/// together through `set_coordinates` or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRef {
    pub text: String,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
}

impl AddressRef {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            lon: None,
            lat: None,
        }
    }

    pub fn set_coordinates(&mut self, lon: f64, lat: f64) {
        self.lon = Some(lon);
        self.lat = Some(lat);
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => Some((lon, lat)),
            _ => None,
        }
    }
}

/// An establishment flowing through the pipeline. Identity is `name`;
/// extraction fills `refs` and `raw_gpt`, geocoding fills coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub name: String,
    #[serde(default)]
    pub refs: Vec<AddressRef>,
    #[serde(default)]
    pub raw_gpt: Option<String>,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            refs: Vec::new(),
            raw_gpt: None,
        }
    }
}

/// One JSON file per work item under a stage directory, named by the
/// sanitized establishment name.
pub struct WorkItemStore {
    root: PathBuf,
}

impl WorkItemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, name: &str) -> bool {
        self.item_path(name).exists()
    }

    pub fn save(&self, item: &WorkItem) -> AppResult<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.item_path(&item.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(item)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> AppResult<WorkItem> {
        let path = self.item_path(name);
        let contents = fs::read_to_string(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                AppError::Path(format!("no stored work item at {}", path.display()))
            }
            _ => AppError::Io(err),
        })?;
        serde_json::from_str(&contents).map_err(AppError::from)
    }

    /// All stored items, ordered by file name for deterministic runs.
    pub fn load_all(&self) -> AppResult<Vec<WorkItem>> {
        let mut paths = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AppError::Io(err)),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = fs::read_to_string(&path)?;
            items.push(serde_json::from_str(&contents)?);
        }
        let address_count: usize = items.iter().map(|item: &WorkItem| item.refs.len()).sum();
        info!(
            items = items.len(),
            addresses = address_count,
            "loaded work items from {}",
            self.root.display()
        );
        Ok(items)
    }

    fn item_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_name(name)))
    }
}

/// Establishment names from a plain-text list: one per line, trimmed, a
/// trailing comma stripped, empties dropped, order-preserving de-dup.
pub fn read_names(path: &Path) -> AppResult<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!(
            "establishments file {} could not be read: {err}",
            path.display()
        ))
    })?;

    let mut names = Vec::new();
    for line in contents.lines() {
        let name = line.trim().trim_end_matches(',').trim();
        if name.is_empty() || names.iter().any(|existing| existing == name) {
            continue;
        }
        names.push(name.to_string());
    }
    Ok(names)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_work_items() {
        let dir = tempdir().unwrap();
        let store = WorkItemStore::new(dir.path().join("addresses"));

        let mut item = WorkItem::new("Acme Bakery");
        item.raw_gpt = Some("1. 12 Main St".to_string());
        let mut address = AddressRef::new("12 Main St");
        address.set_coordinates(10.0, 20.0);
        item.refs.push(address);

        store.save(&item).unwrap();
        let loaded = store.load("Acme Bakery").unwrap();
        assert_eq!(loaded, item);
    }

    #[test]
    fn serialized_fields_match_storage_contract() {
        let mut item = WorkItem::new("Cafe");
        item.refs.push(AddressRef::new("1 High St"));
        let raw = serde_json::to_string(&item).unwrap();
        assert!(raw.contains("\"name\""));
        assert!(raw.contains("\"refs\""));
        assert!(raw.contains("\"raw_gpt\":null"));
        assert!(raw.contains("\"lon\":null"));
    }

    #[test]
    fn coordinates_are_all_or_nothing() {
        let mut address = AddressRef::new("12 Main St");
        assert_eq!(address.coordinates(), None);
        address.set_coordinates(10.0, 20.0);
        assert_eq!(address.coordinates(), Some((10.0, 20.0)));
    }

    #[test]
    fn sanitizes_names_used_as_file_names() {
        let dir = tempdir().unwrap();
        let store = WorkItemStore::new(dir.path());
        let item = WorkItem::new("Fish & Chips: The \"Original\" / est. 1900");
        store.save(&item).unwrap();

        assert!(store.contains("Fish & Chips: The \"Original\" / est. 1900"));
        let loaded = store.load("Fish & Chips: The \"Original\" / est. 1900").unwrap();
        assert_eq!(loaded.name, item.name);
    }

    #[test]
    fn load_all_returns_empty_for_missing_directory() {
        let dir = tempdir().unwrap();
        let store = WorkItemStore::new(dir.path().join("nothing-here"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn reads_names_deduplicated_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("establishments.txt");
        fs::write(&path, "Acme Bakery,\n\n  Beta Cafe\nAcme Bakery\nGamma Pub,\n").unwrap();
        let names = read_names(&path).unwrap();
        assert_eq!(names, vec!["Acme Bakery", "Beta Cafe", "Gamma Pub"]);
    }
}
