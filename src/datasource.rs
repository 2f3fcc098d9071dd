// Datasource records: one row per institution as reported by one provider.
//
// Every provider shares the `datasource_records` table; `kind` tells them
// apart. A record may point at one canonical Brand, and a brand accepts at
// most one record per provider.

use crate::db::{parse_json, parse_timestamp, record_event, to_timestamp};
use crate::error::{Error, Result};
use crate::query::{Page, PageRequest, RecordFilter};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// DATASOURCE KIND
// ============================================================================

/// The external data providers the catalog is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    Banktrack,
    Bimpact,
    Bocc,
    /// Entered by hand in the admin, not imported
    Custombank,
    Fairfinance,
    Gabv,
    Marketforces,
    Switchit,
    /// US National Information Center (FFIEC), carries RSSD control data
    Usnic,
    Wikidata,
}

impl DatasourceKind {
    pub const ALL: [DatasourceKind; 10] = [
        DatasourceKind::Banktrack,
        DatasourceKind::Bimpact,
        DatasourceKind::Bocc,
        DatasourceKind::Custombank,
        DatasourceKind::Fairfinance,
        DatasourceKind::Gabv,
        DatasourceKind::Marketforces,
        DatasourceKind::Switchit,
        DatasourceKind::Usnic,
        DatasourceKind::Wikidata,
    ];

    /// Lowercase code used in URLs, tags and the database
    pub fn code(&self) -> &'static str {
        match self {
            DatasourceKind::Banktrack => "banktrack",
            DatasourceKind::Bimpact => "bimpact",
            DatasourceKind::Bocc => "bocc",
            DatasourceKind::Custombank => "custombank",
            DatasourceKind::Fairfinance => "fairfinance",
            DatasourceKind::Gabv => "gabv",
            DatasourceKind::Marketforces => "marketforces",
            DatasourceKind::Switchit => "switchit",
            DatasourceKind::Usnic => "usnic",
            DatasourceKind::Wikidata => "wikidata",
        }
    }

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            DatasourceKind::Banktrack => "BankTrack",
            DatasourceKind::Bimpact => "B Impact",
            DatasourceKind::Bocc => "OCC",
            DatasourceKind::Custombank => "Custom bank",
            DatasourceKind::Fairfinance => "Fair Finance Guide",
            DatasourceKind::Gabv => "GABV",
            DatasourceKind::Marketforces => "Market Forces",
            DatasourceKind::Switchit => "Switch It",
            DatasourceKind::Usnic => "US NIC",
            DatasourceKind::Wikidata => "Wikidata",
        }
    }

    /// Records of this kind are maintained by hand in the admin
    pub fn is_manual(&self) -> bool {
        matches!(self, DatasourceKind::Custombank)
    }
}

impl fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DatasourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        DatasourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.code() == wanted)
            .ok_or_else(|| Error::invalid(format!("unknown datasource '{}'", s)))
    }
}

// ============================================================================
// IDENTIFIERS & CONTROL
// ============================================================================

/// External regulatory identifiers, carried through from source data as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssd: Option<String>,
    /// RSSD of the top holding company
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssd_hd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lei: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cusip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ein: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        *self == Identifiers::default()
    }

    /// (label, value) pairs of the identifiers that are present
    pub fn present(&self) -> Vec<(&'static str, &str)> {
        [
            ("RSSD", &self.rssd),
            ("RSSD HD", &self.rssd_hd),
            ("LEI", &self.lei),
            ("CUSIP", &self.cusip),
            ("ISIN", &self.isin),
            ("EIN", &self.ein),
        ]
        .into_iter()
        .filter_map(|(label, v)| v.as_deref().map(|v| (label, v)))
        .collect()
    }
}

/// Controller RSSD -> detail reported by the source (e.g. ownership share).
/// Empty means the institution is independent.
pub type Control = BTreeMap<String, serde_json::Value>;

// ============================================================================
// RECORD
// ============================================================================

/// Source-owned fields of a record, as delivered by an import or typed into
/// the admin for custom banks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInput {
    pub kind: DatasourceKind,
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub countries: Vec<String>,
    /// Defaults to `<kind>_<source_id>`
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub identifiers: Identifiers,
    #[serde(default)]
    pub control: Control,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl RecordInput {
    pub fn new(kind: DatasourceKind, source_id: impl Into<String>, name: impl Into<String>) -> Self {
        RecordInput {
            kind,
            source_id: source_id.into(),
            name: name.into(),
            website: String::new(),
            countries: Vec::new(),
            tag: None,
            identifiers: Identifiers::default(),
            control: Control::new(),
            regions: Vec::new(),
            description: String::new(),
        }
    }

    pub fn resolved_tag(&self) -> String {
        self.tag
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_tag(self.kind, &self.source_id))
    }

    /// Hash of the source-owned fields; decides whether a re-import changed anything
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        // serde_json output is stable here: BTreeMap keys and Vec order
        hasher.update(serde_json::to_string(self).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(Error::invalid(format!("{} record without source id", self.kind)));
        }
        if self.name.trim().is_empty() {
            return Err(Error::invalid(format!(
                "{} record '{}' has no name",
                self.kind, self.source_id
            )));
        }
        Ok(())
    }
}

pub fn default_tag(kind: DatasourceKind, source_id: &str) -> String {
    format!("{}_{}", kind.code(), source_id.trim())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRecord {
    pub id: i64,
    pub kind: DatasourceKind,
    pub source_id: String,
    pub name: String,
    pub website: String,
    pub countries: Vec<String>,
    pub tag: String,
    pub identifiers: Identifiers,
    pub control: Control,
    pub regions: Vec<String>,
    pub description: String,
    pub brand_id: Option<i64>,
    pub content_hash: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DatasourceRecord {
    /// Controlled: the control map is not an empty object
    pub fn is_controlled(&self) -> bool {
        !self.control.is_empty()
    }

    pub fn is_independent(&self) -> bool {
        self.control.is_empty()
    }

    pub fn has_regions(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Linked: the brand foreign key is set
    pub fn is_linked(&self) -> bool {
        self.brand_id.is_some()
    }

    /// Source-owned view of this record
    pub fn to_input(&self) -> RecordInput {
        RecordInput {
            kind: self.kind,
            source_id: self.source_id.clone(),
            name: self.name.clone(),
            website: self.website.clone(),
            countries: self.countries.clone(),
            tag: Some(self.tag.clone()),
            identifiers: self.identifiers.clone(),
            control: self.control.clone(),
            regions: self.regions.clone(),
            description: self.description.clone(),
        }
    }
}

pub(crate) const RECORD_COLUMNS: &str = "id, kind, source_id, name, website, countries, tag, \
     rssd, rssd_hd, lei, cusip, isin, ein, control, regions, description, \
     brand_id, content_hash, created, modified";

pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DatasourceRecord> {
    let kind: String = row.get(1)?;
    let countries: String = row.get(5)?;
    let control: String = row.get(13)?;
    let regions: String = row.get(14)?;
    let created: String = row.get(18)?;
    let modified: String = row.get(19)?;

    Ok(DatasourceRecord {
        id: row.get(0)?,
        kind: kind.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        source_id: row.get(2)?,
        name: row.get(3)?,
        website: row.get(4)?,
        countries: parse_json(5, &countries)?,
        tag: row.get(6)?,
        identifiers: Identifiers {
            rssd: row.get(7)?,
            rssd_hd: row.get(8)?,
            lei: row.get(9)?,
            cusip: row.get(10)?,
            isin: row.get(11)?,
            ein: row.get(12)?,
        },
        control: parse_json(13, &control)?,
        regions: parse_json(14, &regions)?,
        description: row.get(15)?,
        brand_id: row.get(16)?,
        content_hash: row.get(17)?,
        created: parse_timestamp(18, &created)?,
        modified: parse_timestamp(19, &modified)?,
    })
}

// ============================================================================
// IMPORT / UPSERT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ImportStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Insert new records and refresh changed ones, keyed by (kind, source_id).
///
/// The brand link is owned by the admin and survives re-imports.
pub fn upsert_records(conn: &Connection, inputs: &[RecordInput], actor: &str) -> Result<ImportStats> {
    let tx = conn.unchecked_transaction()?;
    let mut stats = ImportStats::default();
    let now = to_timestamp(&Utc::now());

    for input in inputs {
        input.validate()?;
        let hash = input.content_hash();

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, content_hash FROM datasource_records WHERE kind = ?1 AND source_id = ?2",
                params![input.kind.code(), input.source_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO datasource_records (
                        kind, source_id, name, website, countries, tag,
                        rssd, rssd_hd, lei, cusip, isin, ein,
                        control, regions, description, content_hash, created, modified
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                    params![
                        input.kind.code(),
                        input.source_id,
                        input.name,
                        input.website,
                        serde_json::to_string(&input.countries)?,
                        input.resolved_tag(),
                        input.identifiers.rssd,
                        input.identifiers.rssd_hd,
                        input.identifiers.lei,
                        input.identifiers.cusip,
                        input.identifiers.isin,
                        input.identifiers.ein,
                        serde_json::to_string(&input.control)?,
                        serde_json::to_string(&input.regions)?,
                        input.description,
                        hash,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                record_event(
                    &tx,
                    "record_imported",
                    "datasource_record",
                    id,
                    serde_json::json!({ "kind": input.kind, "source_id": input.source_id }),
                    actor,
                )?;
                stats.inserted += 1;
            }
            Some((_, ref old_hash)) if *old_hash == hash => {
                stats.unchanged += 1;
            }
            Some((id, _)) => {
                write_source_fields(&tx, id, input, &hash, &now)?;
                record_event(
                    &tx,
                    "record_updated",
                    "datasource_record",
                    id,
                    serde_json::json!({ "kind": input.kind, "source_id": input.source_id }),
                    actor,
                )?;
                stats.updated += 1;
            }
        }
    }

    tx.commit()?;
    tracing::info!(
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        "datasource records upserted"
    );
    Ok(stats)
}

fn write_source_fields(
    conn: &Connection,
    id: i64,
    input: &RecordInput,
    hash: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE datasource_records SET
            name = ?2, website = ?3, countries = ?4, tag = ?5,
            rssd = ?6, rssd_hd = ?7, lei = ?8, cusip = ?9, isin = ?10, ein = ?11,
            control = ?12, regions = ?13, description = ?14,
            content_hash = ?15, modified = ?16
         WHERE id = ?1",
        params![
            id,
            input.name,
            input.website,
            serde_json::to_string(&input.countries)?,
            input.resolved_tag(),
            input.identifiers.rssd,
            input.identifiers.rssd_hd,
            input.identifiers.lei,
            input.identifiers.cusip,
            input.identifiers.isin,
            input.identifiers.ein,
            serde_json::to_string(&input.control)?,
            serde_json::to_string(&input.regions)?,
            input.description,
            hash,
            now,
        ],
    )?;
    Ok(())
}

/// Persist edited source fields of an existing record (admin change form).
pub fn save_record_fields(conn: &Connection, id: i64, input: &RecordInput, actor: &str) -> Result<DatasourceRecord> {
    input.validate()?;
    let current = get_record(conn, id)?;
    if current.kind != input.kind || current.source_id != input.source_id {
        return Err(Error::ReadOnlyField("source_id".to_string()));
    }

    let hash = input.content_hash();
    write_source_fields(conn, id, input, &hash, &to_timestamp(&Utc::now()))?;
    record_event(
        conn,
        "record_edited",
        "datasource_record",
        id,
        serde_json::to_value(input)?,
        actor,
    )?;
    get_record(conn, id)
}

// ============================================================================
// READS
// ============================================================================

pub fn get_record(conn: &Connection, id: i64) -> Result<DatasourceRecord> {
    conn.query_row(
        &format!("SELECT {} FROM datasource_records WHERE id = ?1", RECORD_COLUMNS),
        [id],
        record_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("datasource record {}", id)))
}

pub fn find_record(conn: &Connection, kind: DatasourceKind, source_id: &str) -> Result<Option<DatasourceRecord>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM datasource_records WHERE kind = ?1 AND source_id = ?2",
                RECORD_COLUMNS
            ),
            params![kind.code(), source_id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

pub fn count_records(conn: &Connection, filter: &RecordFilter) -> Result<usize> {
    let (clause, values) = filter.to_sql();
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM datasource_records WHERE {}", clause),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Filtered, name-ordered, paginated listing
pub fn list_records(conn: &Connection, filter: &RecordFilter, page: &PageRequest) -> Result<Page<DatasourceRecord>> {
    let count = count_records(conn, filter)?;
    let num_pages = Page::<DatasourceRecord>::check_bounds(page, count)?;

    let (clause, mut values) = filter.to_sql();
    values.push(rusqlite::types::Value::Integer(clamp_i64(page.page_size)));
    values.push(rusqlite::types::Value::Integer(clamp_i64(page.offset())));
    let n = values.len();

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM datasource_records WHERE {}
         ORDER BY name COLLATE NOCASE, id
         LIMIT ?{} OFFSET ?{}",
        RECORD_COLUMNS,
        clause,
        n - 1,
        n
    ))?;
    let results = stmt
        .query_map(params_from_iter(values.iter()), record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page {
        count,
        page: page.page,
        page_size: page.page_size,
        num_pages,
        results,
    })
}

/// Every record linked to a brand, ordered by provider then name
pub fn records_linked_to(conn: &Connection, brand_id: i64) -> Result<Vec<DatasourceRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM datasource_records WHERE brand_id = ?1 ORDER BY kind, name COLLATE NOCASE",
        RECORD_COLUMNS
    ))?;
    let records = stmt
        .query_map([brand_id], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Record counts per provider: (kind, total, linked)
pub fn count_by_kind(conn: &Connection) -> Result<Vec<(DatasourceKind, usize, usize)>> {
    let mut stmt = conn.prepare(
        "SELECT kind, COUNT(*), SUM(CASE WHEN brand_id IS NOT NULL THEN 1 ELSE 0 END)
         FROM datasource_records GROUP BY kind",
    )?;
    let rows: Vec<(String, i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts: Vec<(DatasourceKind, usize, usize)> = DatasourceKind::ALL
        .iter()
        .map(|k| (*k, 0, 0))
        .collect();
    for (kind, total, linked) in rows {
        let kind: DatasourceKind = kind.parse()?;
        if let Some(entry) = counts.iter_mut().find(|(k, _, _)| *k == kind) {
            entry.1 = total as usize;
            entry.2 = linked as usize;
        }
    }
    Ok(counts)
}

// ============================================================================
// BRAND LINKS & DELETION
// ============================================================================

/// Id of a record of `kind` other than `except` already linked to `brand_id`
pub(crate) fn linked_sibling(
    conn: &Connection,
    brand_id: i64,
    kind: DatasourceKind,
    except: i64,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM datasource_records WHERE brand_id = ?1 AND kind = ?2 AND id != ?3 LIMIT 1",
            params![brand_id, kind.code(), except],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Point a record at a brand. A brand takes one record per provider.
pub fn link_record(conn: &Connection, record_id: i64, brand_id: i64, actor: &str) -> Result<DatasourceRecord> {
    let record = get_record(conn, record_id)?;

    let brand_exists: bool = conn
        .query_row("SELECT 1 FROM brands WHERE id = ?1", [brand_id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !brand_exists {
        return Err(Error::not_found(format!("brand {}", brand_id)));
    }

    if record.brand_id == Some(brand_id) {
        return Ok(record);
    }

    if let Some(other) = linked_sibling(conn, brand_id, record.kind, record_id)? {
        return Err(Error::Conflict(format!(
            "brand {} already has {} record {} linked",
            brand_id, record.kind, other
        )));
    }

    conn.execute(
        "UPDATE datasource_records SET brand_id = ?2, modified = ?3 WHERE id = ?1",
        params![record_id, brand_id, to_timestamp(&Utc::now())],
    )?;
    record_event(
        conn,
        "record_linked",
        "datasource_record",
        record_id,
        serde_json::json!({ "brand_id": brand_id, "previous_brand_id": record.brand_id }),
        actor,
    )?;
    tracing::info!(record_id, brand_id, kind = %record.kind, "record linked to brand");

    get_record(conn, record_id)
}

pub fn unlink_record(conn: &Connection, record_id: i64, actor: &str) -> Result<DatasourceRecord> {
    let record = get_record(conn, record_id)?;
    if record.brand_id.is_none() {
        return Ok(record);
    }

    conn.execute(
        "UPDATE datasource_records SET brand_id = NULL, modified = ?2 WHERE id = ?1",
        params![record_id, to_timestamp(&Utc::now())],
    )?;
    record_event(
        conn,
        "record_unlinked",
        "datasource_record",
        record_id,
        serde_json::json!({ "previous_brand_id": record.brand_id }),
        actor,
    )?;

    get_record(conn, record_id)
}

/// Delete records by id; unknown ids are skipped. Returns the number deleted.
pub fn delete_records(conn: &Connection, ids: &[i64], limit: usize, actor: &str) -> Result<usize> {
    if ids.len() > limit {
        return Err(Error::invalid(format!(
            "cannot delete {} records at once (limit {})",
            ids.len(),
            limit
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0;
    for id in ids {
        let n = tx.execute("DELETE FROM datasource_records WHERE id = ?1", [id])?;
        if n > 0 {
            record_event(&tx, "record_deleted", "datasource_record", *id, serde_json::json!({}), actor)?;
            deleted += n;
        }
    }
    tx.commit()?;

    tracing::info!(deleted, requested = ids.len(), "datasource records deleted");
    Ok(deleted)
}

fn clamp_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::{create_brand, NewBrand};
    use crate::db::{get_events_for_entity, open_in_memory};

    fn usnic(source_id: &str, name: &str, rssd: &str) -> RecordInput {
        let mut input = RecordInput::new(DatasourceKind::Usnic, source_id, name);
        input.identifiers.rssd = Some(rssd.to_string());
        input.countries = vec!["US".to_string()];
        input
    }

    fn import(conn: &Connection, inputs: &[RecordInput]) -> ImportStats {
        upsert_records(conn, inputs, "test").unwrap()
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in DatasourceKind::ALL {
            assert_eq!(kind.code().parse::<DatasourceKind>().unwrap(), kind);
        }
        assert_eq!("USNIC".parse::<DatasourceKind>().unwrap(), DatasourceKind::Usnic);
        assert!("bank_of_nowhere".parse::<DatasourceKind>().is_err());
        assert!(DatasourceKind::Custombank.is_manual());
        assert!(!DatasourceKind::Banktrack.is_manual());
    }

    #[test]
    fn test_default_tag() {
        let input = RecordInput::new(DatasourceKind::Banktrack, " 42 ", "Example");
        assert_eq!(input.resolved_tag(), "banktrack_42");

        let mut tagged = input.clone();
        tagged.tag = Some("custom".to_string());
        assert_eq!(tagged.resolved_tag(), "custom");
    }

    #[test]
    fn test_import_twice_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let inputs = vec![usnic("1", "First Bank", "100"), usnic("2", "Second Bank", "200")];

        let first = import(&conn, &inputs);
        let second = import(&conn, &inputs);

        assert_eq!(first, ImportStats { inserted: 2, updated: 0, unchanged: 0 });
        assert_eq!(second, ImportStats { inserted: 0, updated: 0, unchanged: 2 });
        assert_eq!(count_records(&conn, &RecordFilter::default()).unwrap(), 2);
    }

    #[test]
    fn test_reimport_updates_but_keeps_brand_link() {
        let conn = open_in_memory().unwrap();
        import(&conn, &[usnic("1", "First Bank", "100")]);
        let brand = create_brand(&conn, NewBrand::named("First Bank"), "test").unwrap();
        let record = find_record(&conn, DatasourceKind::Usnic, "1").unwrap().unwrap();
        link_record(&conn, record.id, brand.id, "test").unwrap();

        let mut changed = usnic("1", "First Bank NA", "100");
        changed.website = "https://firstbank.example".to_string();
        let stats = import(&conn, &[changed]);

        assert_eq!(stats.updated, 1);
        let after = get_record(&conn, record.id).unwrap();
        assert_eq!(after.name, "First Bank NA");
        assert_eq!(after.brand_id, Some(brand.id));

        let events = get_events_for_entity(&conn, "datasource_record", &record.id.to_string()).unwrap();
        assert!(events.iter().any(|e| e.event_type == "record_updated"));
    }

    #[test]
    fn test_upsert_rejects_nameless_record() {
        let conn = open_in_memory().unwrap();
        let bad = RecordInput::new(DatasourceKind::Gabv, "9", "  ");

        assert!(matches!(upsert_records(&conn, &[bad], "test"), Err(Error::InvalidInput(_))));
        assert_eq!(count_records(&conn, &RecordFilter::default()).unwrap(), 0);
    }

    #[test]
    fn test_controlled_and_regions_filters() {
        let conn = open_in_memory().unwrap();
        let mut controlled = usnic("1", "Subsidiary Bank", "100");
        controlled.control.insert("900".to_string(), serde_json::json!({"percent": 100}));
        let mut regional = usnic("2", "Regional Bank", "200");
        regional.regions = vec!["US-CA".to_string(), "US-OR".to_string()];
        import(&conn, &[controlled, regional]);

        let page = PageRequest::new(1, 50);
        let controlled_only = list_records(
            &conn,
            &RecordFilter { controlled: Some(true), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(controlled_only.count, 1);
        assert_eq!(controlled_only.results[0].name, "Subsidiary Bank");
        assert!(controlled_only.results[0].is_controlled());

        let independent = list_records(
            &conn,
            &RecordFilter { controlled: Some(false), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(independent.count, 1);
        assert!(independent.results[0].is_independent());

        let with_regions = list_records(
            &conn,
            &RecordFilter { has_regions: Some(true), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(with_regions.results[0].name, "Regional Bank");
        assert!(with_regions.results[0].has_regions());
    }

    #[test]
    fn test_search_and_kind_filter() {
        let conn = open_in_memory().unwrap();
        let mut triodos = RecordInput::new(DatasourceKind::Gabv, "t", "Triodos Bank");
        triodos.website = "https://www.triodos.com".to_string();
        import(&conn, &[triodos, usnic("1", "First Bank", "100")]);

        let page = PageRequest::new(1, 10);
        let by_website = list_records(
            &conn,
            &RecordFilter { search: Some("TRIODOS.com".to_string()), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(by_website.count, 1);

        let usnic_only = list_records(&conn, &RecordFilter::for_kind(DatasourceKind::Usnic), &page).unwrap();
        assert_eq!(usnic_only.count, 1);
        assert_eq!(usnic_only.results[0].kind, DatasourceKind::Usnic);

        let us = list_records(
            &conn,
            &RecordFilter { country: Some("us".to_string()), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(us.count, 1);
    }

    #[test]
    fn test_pagination_orders_by_name() {
        let conn = open_in_memory().unwrap();
        import(
            &conn,
            &[usnic("1", "charlie", "1"), usnic("2", "Alpha", "2"), usnic("3", "bravo", "3")],
        );

        let first = list_records(&conn, &RecordFilter::default(), &PageRequest::new(1, 2)).unwrap();
        let second = list_records(&conn, &RecordFilter::default(), &PageRequest::new(2, 2)).unwrap();

        assert_eq!(first.num_pages, 2);
        assert_eq!(first.results.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["Alpha", "bravo"]);
        assert_eq!(second.results[0].name, "charlie");
        assert!(first.has_next());
        assert!(second.has_previous());
        assert!(list_records(&conn, &RecordFilter::default(), &PageRequest::new(3, 2)).is_err());
    }

    #[test]
    fn test_linked_filter_and_conflict() {
        let conn = open_in_memory().unwrap();
        import(&conn, &[usnic("1", "First Bank", "100"), usnic("2", "First Bank Again", "101")]);
        let brand = create_brand(&conn, NewBrand::named("First Bank"), "test").unwrap();
        let a = find_record(&conn, DatasourceKind::Usnic, "1").unwrap().unwrap();
        let b = find_record(&conn, DatasourceKind::Usnic, "2").unwrap().unwrap();

        let linked = link_record(&conn, a.id, brand.id, "test").unwrap();
        assert!(linked.is_linked());

        // Second usnic record for the same brand is refused
        let err = link_record(&conn, b.id, brand.id, "test").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let page = PageRequest::new(1, 10);
        let linked_only = list_records(&conn, &RecordFilter { linked: Some(true), ..Default::default() }, &page).unwrap();
        assert_eq!(linked_only.count, 1);

        // Relinking the same pair is a no-op
        link_record(&conn, a.id, brand.id, "test").unwrap();

        unlink_record(&conn, a.id, "test").unwrap();
        link_record(&conn, b.id, brand.id, "test").unwrap();
        assert_eq!(records_linked_to(&conn, brand.id).unwrap().len(), 1);
    }

    #[test]
    fn test_link_missing_brand() {
        let conn = open_in_memory().unwrap();
        import(&conn, &[usnic("1", "First Bank", "100")]);
        let record = find_record(&conn, DatasourceKind::Usnic, "1").unwrap().unwrap();

        assert!(matches!(link_record(&conn, record.id, 999, "test"), Err(Error::NotFound(_))));
        assert!(matches!(link_record(&conn, 999, 1, "test"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_records_respects_limit() {
        let conn = open_in_memory().unwrap();
        import(&conn, &[usnic("1", "A", "1"), usnic("2", "B", "2"), usnic("3", "C", "3")]);
        let ids: Vec<i64> = list_records(&conn, &RecordFilter::default(), &PageRequest::all())
            .unwrap()
            .results
            .iter()
            .map(|r| r.id)
            .collect();

        assert!(matches!(delete_records(&conn, &ids, 2, "test"), Err(Error::InvalidInput(_))));
        assert_eq!(delete_records(&conn, &[ids[0], 12345], 10, "test").unwrap(), 1);
        assert_eq!(count_records(&conn, &RecordFilter::default()).unwrap(), 2);
    }

    #[test]
    fn test_count_by_kind_lists_every_provider() {
        let conn = open_in_memory().unwrap();
        import(&conn, &[usnic("1", "A", "1"), usnic("2", "B", "2")]);

        let counts = count_by_kind(&conn).unwrap();
        assert_eq!(counts.len(), DatasourceKind::ALL.len());
        let usnic_counts = counts.iter().find(|(k, _, _)| *k == DatasourceKind::Usnic).unwrap();
        assert_eq!((usnic_counts.1, usnic_counts.2), (2, 0));
    }

    #[test]
    fn test_identifiers_present() {
        let ids = Identifiers {
            rssd: Some("480228".to_string()),
            lei: Some("B4TYDEB6GKMZO031MB27".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ids.present(),
            vec![("RSSD", "480228"), ("LEI", "B4TYDEB6GKMZO031MB27")]
        );
        assert!(Identifiers::default().is_empty());
    }
}
