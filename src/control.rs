// Control relationships between institutions.
//
// A record's control map is keyed by the RSSD of each controlling
// institution. Controllers are resolved against every provider's records, so
// a Usnic subsidiary can point at a Wikidata parent.

use crate::datasource::{record_from_row, DatasourceKind, DatasourceRecord, RECORD_COLUMNS};
use crate::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// A controller that resolved to a record in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRef {
    pub rssd: String,
    pub record_id: i64,
    pub kind: DatasourceKind,
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSummary {
    pub rssd: Option<String>,
    pub independent: bool,
    pub controllers: Vec<ControllerRef>,
    /// Controller RSSDs with no matching record
    pub unresolved: Vec<String>,
}

fn records_with_rssd(conn: &Connection, rssd: &str) -> Result<Vec<DatasourceRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM datasource_records WHERE rssd = ?1 ORDER BY name COLLATE NOCASE, id",
        RECORD_COLUMNS
    ))?;
    let records = stmt
        .query_map([rssd], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Records whose RSSD appears as a key of `record.control`, ordered by name
pub fn controlling_orgs(conn: &Connection, record: &DatasourceRecord) -> Result<Vec<DatasourceRecord>> {
    let mut controllers = Vec::new();
    for rssd in record.control.keys() {
        controllers.extend(records_with_rssd(conn, rssd)?);
    }
    controllers.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then(a.id.cmp(&b.id))
    });
    Ok(controllers)
}

/// Records that list this record's RSSD among their controllers
pub fn controlled_orgs(conn: &Connection, record: &DatasourceRecord) -> Result<Vec<DatasourceRecord>> {
    let Some(rssd) = record.identifiers.rssd.as_deref() else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM datasource_records
         WHERE EXISTS (SELECT 1 FROM json_each(control) WHERE key = ?1)
         ORDER BY name COLLATE NOCASE, id",
        RECORD_COLUMNS
    ))?;
    let records = stmt
        .query_map([rssd], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn control_summary(conn: &Connection, record: &DatasourceRecord) -> Result<ControlSummary> {
    let mut controllers = Vec::new();
    let mut unresolved = Vec::new();

    for rssd in record.control.keys() {
        let found = records_with_rssd(conn, rssd)?;
        if found.is_empty() {
            unresolved.push(rssd.clone());
            continue;
        }
        controllers.extend(found.into_iter().map(|r| ControllerRef {
            rssd: rssd.clone(),
            record_id: r.id,
            kind: r.kind,
            name: r.name,
            tag: r.tag,
        }));
    }

    if !unresolved.is_empty() {
        tracing::debug!(record_id = record.id, ?unresolved, "controllers missing from catalog");
    }

    Ok(ControlSummary {
        rssd: record.identifiers.rssd.clone(),
        independent: record.is_independent(),
        controllers,
        unresolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{find_record, upsert_records, RecordInput};
    use crate::db::open_in_memory;

    fn setup() -> Connection {
        let conn = open_in_memory().unwrap();

        let mut parent = RecordInput::new(DatasourceKind::Usnic, "p", "Holding Corp");
        parent.identifiers.rssd = Some("1000".to_string());

        let mut parent_wiki = RecordInput::new(DatasourceKind::Wikidata, "Q1", "Holding Corporation");
        parent_wiki.identifiers.rssd = Some("1000".to_string());

        let mut child = RecordInput::new(DatasourceKind::Usnic, "c", "Child Bank");
        child.identifiers.rssd = Some("2000".to_string());
        child.control.insert("1000".to_string(), serde_json::json!({"percent": 80}));
        child.control.insert("9999".to_string(), serde_json::json!({"percent": 20}));

        let loner = RecordInput::new(DatasourceKind::Gabv, "l", "Loner Bank");

        upsert_records(&conn, &[parent, parent_wiki, child, loner], "test").unwrap();
        conn
    }

    fn record(conn: &Connection, kind: DatasourceKind, source_id: &str) -> DatasourceRecord {
        find_record(conn, kind, source_id).unwrap().unwrap()
    }

    #[test]
    fn test_controlling_orgs_across_providers() {
        let conn = setup();
        let child = record(&conn, DatasourceKind::Usnic, "c");

        let controllers = controlling_orgs(&conn, &child).unwrap();
        let names: Vec<&str> = controllers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Holding Corp", "Holding Corporation"]);
    }

    #[test]
    fn test_controlled_orgs() {
        let conn = setup();
        let parent = record(&conn, DatasourceKind::Usnic, "p");

        let controlled = controlled_orgs(&conn, &parent).unwrap();
        assert_eq!(controlled.len(), 1);
        assert_eq!(controlled[0].name, "Child Bank");

        // No RSSD, nothing can point at it
        let loner = record(&conn, DatasourceKind::Gabv, "l");
        assert!(controlled_orgs(&conn, &loner).unwrap().is_empty());
    }

    #[test]
    fn test_control_summary_reports_unresolved() {
        let conn = setup();
        let child = record(&conn, DatasourceKind::Usnic, "c");

        let summary = control_summary(&conn, &child).unwrap();
        assert!(!summary.independent);
        assert_eq!(summary.rssd.as_deref(), Some("2000"));
        assert_eq!(summary.controllers.len(), 2);
        assert!(summary.controllers.iter().all(|c| c.rssd == "1000"));
        assert_eq!(summary.unresolved, vec!["9999"]);

        let loner = record(&conn, DatasourceKind::Gabv, "l");
        let summary = control_summary(&conn, &loner).unwrap();
        assert!(summary.independent);
        assert!(summary.controllers.is_empty());
    }
}
