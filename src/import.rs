// CSV ingestion for provider dumps.
//
// Format (header row required, column order free):
//   source_id,name,website,countries,rssd,rssd_hd,lei,cusip,isin,ein,control,regions,tag,description
// Only source_id and name are mandatory. countries and regions are
// ';'-separated; control is a JSON object keyed by controller RSSD.

use crate::datasource::{upsert_records, Control, DatasourceKind, Identifiers, ImportStats, RecordInput};
use crate::error::{Error, Result};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CsvRow {
    source_id: String,
    name: String,
    #[serde(default)]
    website: String,
    #[serde(default)]
    countries: String,
    #[serde(default)]
    rssd: String,
    #[serde(default)]
    rssd_hd: String,
    #[serde(default)]
    lei: String,
    #[serde(default)]
    cusip: String,
    #[serde(default)]
    isin: String,
    #[serde(default)]
    ein: String,
    #[serde(default)]
    control: String,
    #[serde(default)]
    regions: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    description: String,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

impl CsvRow {
    fn into_input(self, kind: DatasourceKind, line: usize) -> Result<RecordInput> {
        let control: Control = if self.control.trim().is_empty() {
            Control::new()
        } else {
            serde_json::from_str(&self.control).map_err(|e| {
                Error::invalid(format!("line {}: control is not a JSON object: {}", line, e))
            })?
        };

        let input = RecordInput {
            kind,
            source_id: self.source_id.trim().to_string(),
            name: self.name.trim().to_string(),
            website: self.website.trim().to_string(),
            countries: split_list(&self.countries)
                .into_iter()
                .map(|c| c.to_uppercase())
                .collect(),
            tag: non_empty(&self.tag),
            identifiers: Identifiers {
                rssd: non_empty(&self.rssd),
                rssd_hd: non_empty(&self.rssd_hd),
                lei: non_empty(&self.lei),
                cusip: non_empty(&self.cusip),
                isin: non_empty(&self.isin),
                ein: non_empty(&self.ein),
            },
            control,
            regions: split_list(&self.regions),
            description: self.description.trim().to_string(),
        };

        if input.source_id.is_empty() || input.name.is_empty() {
            return Err(Error::invalid(format!(
                "line {}: source_id and name are required",
                line
            )));
        }
        Ok(input)
    }
}

/// Parse a provider CSV into record inputs, failing on the first bad line.
pub fn load_csv(path: &Path, kind: DatasourceKind) -> Result<Vec<RecordInput>> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);

    let mut inputs = Vec::new();
    for (idx, row) in reader.deserialize::<CsvRow>().enumerate() {
        let line = idx + 2; // 1-indexed plus header row
        let row = row?;
        inputs.push(row.into_input(kind, line)?);
    }

    tracing::debug!(path = %path.display(), %kind, rows = inputs.len(), "csv loaded");
    Ok(inputs)
}

pub fn import_csv(conn: &rusqlite::Connection, path: &Path, kind: DatasourceKind, actor: &str) -> Result<ImportStats> {
    let inputs = load_csv(path, kind)?;
    let stats = upsert_records(conn, &inputs, actor)?;
    tracing::info!(
        path = %path.display(),
        %kind,
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        "csv import finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::find_record;
    use crate::db::open_in_memory;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_row() {
        let file = write_csv(
            "source_id,name,website,countries,rssd,rssd_hd,lei,cusip,isin,ein,control,regions,tag,description\n\
             852218,JPMorgan Chase Bank,https://jpmorganchase.com,us;gb,852218,1039502,,,,,\"{\"\"1039502\"\": {\"\"percent\"\": 100}}\",US-NY;US-TX,,Largest US bank\n",
        );

        let inputs = load_csv(file.path(), DatasourceKind::Usnic).unwrap();

        assert_eq!(inputs.len(), 1);
        let input = &inputs[0];
        assert_eq!(input.countries, vec!["US", "GB"]);
        assert_eq!(input.identifiers.rssd_hd.as_deref(), Some("1039502"));
        assert_eq!(input.identifiers.lei, None);
        assert!(input.control.contains_key("1039502"));
        assert_eq!(input.regions, vec!["US-NY", "US-TX"]);
        assert_eq!(input.resolved_tag(), "usnic_852218");
    }

    #[test]
    fn test_minimal_columns() {
        let file = write_csv("name,source_id\nTriodos Bank,42\n");

        let inputs = load_csv(file.path(), DatasourceKind::Gabv).unwrap();
        assert_eq!(inputs[0].name, "Triodos Bank");
        assert!(inputs[0].control.is_empty());
        assert!(inputs[0].countries.is_empty());
    }

    #[test]
    fn test_bad_control_names_line() {
        let file = write_csv("source_id,name,control\n1,Good,\n2,Bad,not-json\n");

        let err = load_csv(file.path(), DatasourceKind::Usnic).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref msg) if msg.starts_with("line 3")));
    }

    #[test]
    fn test_missing_name_rejected() {
        let file = write_csv("source_id,name\n1,\n");
        assert!(matches!(
            load_csv(file.path(), DatasourceKind::Usnic),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_import_csv_then_reimport() {
        let conn = open_in_memory().unwrap();
        let file = write_csv("source_id,name,website\n1,Alpha,alpha.example\n2,Bravo,\n");

        let first = import_csv(&conn, file.path(), DatasourceKind::Banktrack, "test").unwrap();
        let second = import_csv(&conn, file.path(), DatasourceKind::Banktrack, "test").unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.unchanged, 2);
        let alpha = find_record(&conn, DatasourceKind::Banktrack, "1").unwrap().unwrap();
        assert_eq!(alpha.website, "alpha.example");
    }
}
