use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::completion::CompletionClient;
use crate::config::NO_ADDRESS_TOKEN;
use crate::errors::AppResult;
use crate::export::export_csv;
use crate::geocode::GeocodeClient;
use crate::store::WorkItemStore;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExtractionReport {
    pub extracted: usize,
    pub already_present: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GeocodeReport {
    pub items: usize,
    pub already_present: usize,
    pub no_address: usize,
    pub resolved_addresses: usize,
    pub failed_addresses: usize,
}

/// Stage 1: one completion call per establishment not yet extracted.
/// Extraction failures skip the item and keep the run going; only
/// configuration errors abort.
pub async fn run_extraction(
    names: &[String],
    completion: &mut CompletionClient,
    store: &WorkItemStore,
) -> AppResult<ExtractionReport> {
    let mut report = ExtractionReport::default();
    for name in names {
        if store.contains(name) {
            report.already_present += 1;
            continue;
        }
        match completion.extract(name).await {
            Ok(item) => {
                store.save(&item)?;
                report.extracted += 1;
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("skipping '{name}': {err}");
                report.failed += 1;
            }
        }
    }
    info!(
        extracted = report.extracted,
        already_present = report.already_present,
        failed = report.failed,
        "extraction stage complete"
    );
    Ok(report)
}

/// Stage 2: resolve every address reference that still lacks coordinates.
/// A failed address leaves its coordinates unset and never aborts the item
/// or the run; items already in the target store are treated as complete.
pub async fn run_geocoding(
    client: &mut GeocodeClient,
    source: &WorkItemStore,
    target: &WorkItemStore,
) -> AppResult<GeocodeReport> {
    client.verify().await?;

    let mut report = GeocodeReport::default();
    for mut item in source.load_all()? {
        if target.contains(&item.name) {
            report.already_present += 1;
            continue;
        }

        if item.refs.is_empty() {
            if item
                .raw_gpt
                .as_deref()
                .map(|raw| raw.contains(NO_ADDRESS_TOKEN))
                .unwrap_or(false)
            {
                warn!("skipped empty address for {}", item.name);
            }
            report.no_address += 1;
            target.save(&item)?;
            continue;
        }

        for address in &mut item.refs {
            if address.coordinates().is_some() {
                continue;
            }
            match client.resolve(&address.text).await {
                Ok((lon, lat)) => {
                    address.set_coordinates(lon, lat);
                    report.resolved_addresses += 1;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("leaving '{}' unresolved: {err}", address.text);
                    report.failed_addresses += 1;
                }
            }
        }

        target.save(&item)?;
        report.items += 1;
    }
    info!(
        items = report.items,
        already_present = report.already_present,
        no_address = report.no_address,
        resolved = report.resolved_addresses,
        failed = report.failed_addresses,
        "geocoding stage complete"
    );
    Ok(report)
}

/// Stage 3: flatten geocoded items into the CSV export.
pub fn run_export(store: &WorkItemStore, csv_path: &Path) -> AppResult<usize> {
    let items = store.load_all()?;
    export_csv(&items, csv_path)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::completion::{ChatCompleter, ChatOutcome, ChatUsage};
    use crate::config::AppConfig;
    use crate::errors::AppError;
    use crate::geocode::{GeocodeCandidate, GeocodeLookup, LookupFailure};
    use crate::ledger::UsageLedger;
    use crate::prompts::Prompts;
    use crate::store::{AddressRef, WorkItem};
    use crate::telemetry::TelemetryClient;

    struct MapLookup {
        known: Vec<(&'static str, (f64, f64))>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeLookup for MapLookup {
        async fn lookup(
            &self,
            address: &str,
            country: Option<&str>,
        ) -> Result<Vec<GeocodeCandidate>, LookupFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if country.is_some() {
                // health check
                return Ok(vec![GeocodeCandidate { lon: 13.4, lat: 52.5 }]);
            }
            Ok(self
                .known
                .iter()
                .filter(|(known, _)| *known == address)
                .map(|(_, (lon, lat))| GeocodeCandidate {
                    lon: *lon,
                    lat: *lat,
                })
                .collect())
        }
    }

    struct FixedCompleter {
        content: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatCompleter for FixedCompleter {
        async fn complete(&self, _system: &str, _user: &str) -> crate::errors::AppResult<ChatOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = self
                .content
                .lock()
                .pop()
                .ok_or_else(|| AppError::Config("completer exhausted".to_string()))?;
            Ok(ChatOutcome {
                content: Some(content),
                usage: Some(ChatUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }),
                choices: 1,
            })
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.max_requests_per_minute = 60_000;
        config
    }

    fn geocode_client(
        known: Vec<(&'static str, (f64, f64))>,
        dir: &std::path::Path,
    ) -> (GeocodeClient, Arc<MapLookup>) {
        let config = fast_config();
        let lookup = Arc::new(MapLookup {
            known,
            calls: AtomicUsize::new(0),
        });
        let telemetry = TelemetryClient::new(dir, &config).unwrap();
        (
            GeocodeClient::with_lookup(lookup.clone(), &config, telemetry),
            lookup,
        )
    }

    #[tokio::test]
    async fn extraction_skips_items_already_on_disk() {
        let dir = tempdir().unwrap();
        let store = WorkItemStore::new(dir.path().join("addresses"));
        store.save(&WorkItem::new("Acme Bakery")).unwrap();

        let completer = Arc::new(FixedCompleter {
            content: Mutex::new(vec!["1. 9 Oak Ln".to_string()]),
            calls: AtomicUsize::new(0),
        });
        let config = fast_config();
        let ledger = UsageLedger::open(dir.path().join("tokens.count"), "id-A").unwrap();
        let telemetry = TelemetryClient::new(dir.path(), &config).unwrap();
        let prompts = Prompts::from_templates("{no_address}", "{name}");
        let mut completion =
            CompletionClient::with_completer(completer.clone(), prompts, ledger, telemetry);

        let names = vec!["Acme Bakery".to_string(), "Beta Cafe".to_string()];
        let report = run_extraction(&names, &mut completion, &store).await.unwrap();

        assert_eq!(report.already_present, 1);
        assert_eq!(report.extracted, 1);
        assert_eq!(completer.calls.load(Ordering::SeqCst), 1);
        assert!(store.contains("Beta Cafe"));
    }

    #[tokio::test]
    async fn failed_address_never_aborts_the_item() {
        let dir = tempdir().unwrap();
        let source = WorkItemStore::new(dir.path().join("addresses"));
        let target = WorkItemStore::new(dir.path().join("geocoded"));

        let mut item = WorkItem::new("Acme Bakery");
        item.refs.push(AddressRef::new("12 Main St"));
        item.refs.push(AddressRef::new("Unknown Alley"));
        item.refs.push(AddressRef::new("34 Side Ave"));
        source.save(&item).unwrap();

        let (mut client, _lookup) = geocode_client(
            vec![("12 Main St", (10.0, 20.0)), ("34 Side Ave", (30.0, 40.0))],
            dir.path(),
        );
        let report = run_geocoding(&mut client, &source, &target).await.unwrap();

        assert_eq!(report.resolved_addresses, 2);
        assert_eq!(report.failed_addresses, 1);

        let geocoded = target.load("Acme Bakery").unwrap();
        assert_eq!(geocoded.refs[0].coordinates(), Some((10.0, 20.0)));
        assert_eq!(geocoded.refs[1].coordinates(), None);
        assert_eq!(geocoded.refs[2].coordinates(), Some((30.0, 40.0)));
    }

    #[tokio::test]
    async fn no_address_items_are_persisted_without_geocoding() {
        let dir = tempdir().unwrap();
        let source = WorkItemStore::new(dir.path().join("addresses"));
        let target = WorkItemStore::new(dir.path().join("geocoded"));

        let mut item = WorkItem::new("Unknown Tavern");
        item.raw_gpt = Some(NO_ADDRESS_TOKEN.to_string());
        source.save(&item).unwrap();

        let (mut client, lookup) = geocode_client(vec![], dir.path());
        let report = run_geocoding(&mut client, &source, &target).await.unwrap();

        assert_eq!(report.no_address, 1);
        assert!(target.contains("Unknown Tavern"));
        // one call total: the health check
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_run_resumes_without_remote_calls() {
        let dir = tempdir().unwrap();
        let source = WorkItemStore::new(dir.path().join("addresses"));
        let target = WorkItemStore::new(dir.path().join("geocoded"));

        let mut item = WorkItem::new("Acme Bakery");
        item.refs.push(AddressRef::new("12 Main St"));
        source.save(&item).unwrap();

        let (mut client, lookup) = geocode_client(vec![("12 Main St", (10.0, 20.0))], dir.path());
        run_geocoding(&mut client, &source, &target).await.unwrap();
        let after_first = lookup.calls.load(Ordering::SeqCst);

        let report = run_geocoding(&mut client, &source, &target).await.unwrap();
        assert_eq!(report.already_present, 1);
        assert_eq!(report.items, 0);
        // only the second health check was issued
        assert_eq!(lookup.calls.load(Ordering::SeqCst), after_first + 1);
    }

    #[tokio::test]
    async fn export_flattens_geocoded_store() {
        let dir = tempdir().unwrap();
        let target = WorkItemStore::new(dir.path().join("geocoded"));

        let mut item = WorkItem::new("Acme Bakery");
        let mut address = AddressRef::new("12 Main St");
        address.set_coordinates(10.0, 20.0);
        item.refs.push(address);
        target.save(&item).unwrap();

        let csv_path = dir.path().join("out.csv");
        let rows = run_export(&target, &csv_path).unwrap();
        assert_eq!(rows, 1);
        assert!(std::fs::read_to_string(&csv_path)
            .unwrap()
            .contains("12 Main St,Acme Bakery,10,20"));
    }
}
