use std::fs;
use std::path::Path;

use tracing::info;

use crate::errors::AppResult;
use crate::store::WorkItem;

/// Flattens resolved work items into `address,establishment,lon,lat` rows.
/// Unresolved coordinates stay as empty fields; every address reference
/// gets one row.
pub fn export_csv(items: &[WorkItem], path: &Path) -> AppResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp)?;
    writer.write_record(["address", "establishment", "lon", "lat"])?;

    let mut rows = 0;
    for item in items {
        for address in &item.refs {
            let (lon, lat) = match address.coordinates() {
                Some((lon, lat)) => (lon.to_string(), lat.to_string()),
                None => (String::new(), String::new()),
            };
            writer.write_record([&address.text, &item.name, &lon, &lat])?;
            rows += 1;
        }
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&tmp, path)?;

    info!(rows, "exported geocoded places to {}", path.display());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::AddressRef;

    #[test]
    fn writes_header_and_one_row_per_address() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let mut resolved = WorkItem::new("Acme Bakery");
        let mut first = AddressRef::new("12 Main St");
        first.set_coordinates(10.0, 20.0);
        resolved.refs.push(first);
        resolved.refs.push(AddressRef::new("34 Side Ave"));

        let empty = WorkItem::new("Unknown Tavern");

        let rows = export_csv(&[resolved, empty], &path).unwrap();
        assert_eq!(rows, 2);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "address,establishment,lon,lat");
        assert_eq!(lines[1], "12 Main St,Acme Bakery,10,20");
        assert_eq!(lines[2], "34 Side Ave,Acme Bakery,,");
        assert_eq!(lines.len(), 3);
    }
}
