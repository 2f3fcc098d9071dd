//! Admin semantics: changelist columns, read-only enforcement, form choices
//! and bulk actions
//!
//! Both the TUI and the admin API endpoints go through this module so the two
//! surfaces agree on what an operator can see and change.

use crate::brand::{brand_from_row, get_brand_by_tag, list_brands, Brand, BRAND_COLUMNS};
use crate::datasource::{
    delete_records, get_record, link_record, list_records, save_record_fields, unlink_record, Control,
    DatasourceKind, DatasourceRecord, Identifiers,
};
use crate::error::{Error, Result};
use crate::query::{BrandFilter, PageRequest, RecordFilter};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// MODEL ADMIN DESCRIPTORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelAdmin {
    pub model: &'static str,
    pub list_display: &'static [&'static str],
    pub search_fields: &'static [&'static str],
    pub list_filter: &'static [&'static str],
    /// Fields read-only on every object of the model. Datasource records
    /// lock more per provider, see [`readonly_fields`].
    pub readonly_fields: &'static [&'static str],
}

pub const DATASOURCE_ADMIN: ModelAdmin = ModelAdmin {
    model: "datasource",
    list_display: &["name", "website", "kind", "brand", "controlled"],
    search_fields: &["name", "website"],
    list_filter: &["kind", "controlled", "linked", "regions", "country"],
    readonly_fields: &["kind", "source_id", "tag", "created", "modified"],
};

pub const BRAND_ADMIN: ModelAdmin = ModelAdmin {
    model: "brand",
    list_display: &["name", "tag", "website", "record_count", "sources"],
    search_fields: &["name", "tag", "website", "aliases"],
    list_filter: &["country", "has_records"],
    readonly_fields: &["id", "created", "modified"],
};

// ============================================================================
// CHANGELISTS
// ============================================================================

const EMPTY_VALUE: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangelistRow {
    pub id: i64,
    /// One rendered cell per `list_display` column
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Changelist {
    pub columns: Vec<&'static str>,
    pub rows: Vec<ChangelistRow>,
    pub count: usize,
    pub page: usize,
    pub num_pages: usize,
}

fn display(value: &str) -> String {
    if value.trim().is_empty() {
        EMPTY_VALUE.to_string()
    } else {
        value.to_string()
    }
}

fn yes_no(flag: bool) -> String {
    let text = if flag { "yes" } else { "no" };
    text.to_string()
}

fn brand_tag(conn: &Connection, brand_id: Option<i64>) -> Result<Option<String>> {
    let Some(id) = brand_id else {
        return Ok(None);
    };
    let tag = conn
        .query_row("SELECT tag FROM brands WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(tag)
}

fn record_cell(record: &DatasourceRecord, column: &str, brand: Option<&str>) -> String {
    match column {
        "name" => display(&record.name),
        "website" => display(&record.website),
        "kind" => record.kind.name().to_string(),
        "brand" => display(brand.unwrap_or_default()),
        "controlled" => yes_no(record.is_controlled()),
        _ => EMPTY_VALUE.to_string(),
    }
}

pub fn datasource_changelist(conn: &Connection, filter: &RecordFilter, page: &PageRequest) -> Result<Changelist> {
    let listing = list_records(conn, filter, page)?;

    let mut rows = Vec::with_capacity(listing.results.len());
    for record in &listing.results {
        let brand = brand_tag(conn, record.brand_id)?;
        rows.push(ChangelistRow {
            id: record.id,
            cells: DATASOURCE_ADMIN
                .list_display
                .iter()
                .map(|col| record_cell(record, col, brand.as_deref()))
                .collect(),
        });
    }

    Ok(Changelist {
        columns: DATASOURCE_ADMIN.list_display.to_vec(),
        rows,
        count: listing.count,
        page: listing.page,
        num_pages: listing.num_pages,
    })
}

/// Provider codes of the records linked to a brand
fn brand_sources(conn: &Connection, brand_id: i64) -> Result<Vec<DatasourceKind>> {
    let mut stmt = conn.prepare("SELECT kind FROM datasource_records WHERE brand_id = ?1 ORDER BY kind")?;
    let kinds: Vec<String> = stmt
        .query_map([brand_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    kinds.iter().map(|k| k.parse()).collect()
}

fn brand_cell(brand: &Brand, column: &str, sources: &[DatasourceKind]) -> String {
    match column {
        "name" => display(&brand.name),
        "tag" => brand.tag.clone(),
        "website" => display(&brand.website),
        "record_count" => sources.len().to_string(),
        "sources" => display(
            &sources
                .iter()
                .map(|k| k.code())
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => EMPTY_VALUE.to_string(),
    }
}

pub fn brand_changelist(conn: &Connection, filter: &BrandFilter, page: &PageRequest) -> Result<Changelist> {
    let listing = list_brands(conn, filter, page)?;

    let mut rows = Vec::with_capacity(listing.results.len());
    for brand in &listing.results {
        let sources = brand_sources(conn, brand.id)?;
        rows.push(ChangelistRow {
            id: brand.id,
            cells: BRAND_ADMIN
                .list_display
                .iter()
                .map(|col| brand_cell(brand, col, &sources))
                .collect(),
        });
    }

    Ok(Changelist {
        columns: BRAND_ADMIN.list_display.to_vec(),
        rows,
        count: listing.count,
        page: listing.page,
        num_pages: listing.num_pages,
    })
}

// ============================================================================
// CHANGE FORM
// ============================================================================

/// `Some(None)` for an explicit `null`, `None` when the key is absent
fn explicit_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A submitted change form. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordChanges {
    pub kind: Option<DatasourceKind>,
    pub source_id: Option<String>,
    pub tag: Option<String>,
    pub name: Option<String>,
    pub website: Option<String>,
    pub countries: Option<Vec<String>>,
    pub description: Option<String>,
    pub identifiers: Option<Identifiers>,
    pub control: Option<Control>,
    pub regions: Option<Vec<String>>,
    /// Brand tag to link, or `null` to unlink
    #[serde(default, deserialize_with = "explicit_null")]
    pub brand: Option<Option<String>>,
}

fn differs<T: PartialEq>(new: &Option<T>, current: &T) -> bool {
    new.as_ref().is_some_and(|v| v != current)
}

/// Fields an operator may change on a record of `kind`
pub fn editable_fields(kind: DatasourceKind) -> &'static [&'static str] {
    if kind.is_manual() {
        &[
            "name",
            "website",
            "countries",
            "description",
            "identifiers",
            "control",
            "regions",
            "brand",
        ]
    } else {
        &["brand"]
    }
}

/// Fields of the record form in display order
pub const RECORD_FIELDS: &[&str] = &[
    "kind",
    "source_id",
    "tag",
    "name",
    "website",
    "countries",
    "description",
    "identifiers",
    "control",
    "regions",
    "brand",
];

/// Fields the change form shows read-only for a record of `kind`
pub fn readonly_fields(kind: DatasourceKind) -> Vec<&'static str> {
    let editable = editable_fields(kind);
    RECORD_FIELDS
        .iter()
        .copied()
        .filter(|field| !editable.contains(field))
        .chain(["created", "modified"])
        .collect()
}

impl RecordChanges {
    pub fn link(tag: impl Into<String>) -> Self {
        RecordChanges {
            brand: Some(Some(tag.into())),
            ..Default::default()
        }
    }

    /// Source fields whose submitted value differs from the record
    pub fn changed_fields(&self, record: &DatasourceRecord) -> Vec<&'static str> {
        let checks = [
            ("kind", differs(&self.kind, &record.kind)),
            ("source_id", differs(&self.source_id, &record.source_id)),
            ("tag", differs(&self.tag, &record.tag)),
            ("name", differs(&self.name, &record.name)),
            ("website", differs(&self.website, &record.website)),
            ("countries", differs(&self.countries, &record.countries)),
            ("description", differs(&self.description, &record.description)),
            ("identifiers", differs(&self.identifiers, &record.identifiers)),
            ("control", differs(&self.control, &record.control)),
            ("regions", differs(&self.regions, &record.regions)),
        ];
        checks
            .into_iter()
            .filter_map(|(field, changed)| changed.then_some(field))
            .collect()
    }

    /// Resubmitting a read-only field unchanged is accepted.
    pub fn check_editable(&self, record: &DatasourceRecord) -> Result<()> {
        let editable = editable_fields(record.kind);
        match self
            .changed_fields(record)
            .into_iter()
            .find(|field| !editable.contains(field))
        {
            Some(field) => Err(Error::ReadOnlyField(field.to_string())),
            None => Ok(()),
        }
    }
}

/// Validate and save a change form for one record.
pub fn apply_record_changes(
    conn: &Connection,
    record_id: i64,
    changes: &RecordChanges,
    actor: &str,
) -> Result<DatasourceRecord> {
    let mut record = get_record(conn, record_id)?;
    changes.check_editable(&record)?;

    let tx = conn.unchecked_transaction()?;

    if !changes.changed_fields(&record).is_empty() {
        let mut input = record.to_input();
        if let Some(name) = &changes.name {
            input.name = name.clone();
        }
        if let Some(website) = &changes.website {
            input.website = website.clone();
        }
        if let Some(countries) = &changes.countries {
            input.countries = countries.clone();
        }
        if let Some(description) = &changes.description {
            input.description = description.clone();
        }
        if let Some(identifiers) = &changes.identifiers {
            input.identifiers = identifiers.clone();
        }
        if let Some(control) = &changes.control {
            input.control = control.clone();
        }
        if let Some(regions) = &changes.regions {
            input.regions = regions.clone();
        }
        record = save_record_fields(&tx, record_id, &input, actor)?;
    }

    match &changes.brand {
        Some(Some(tag)) => {
            let brand = get_brand_by_tag(&tx, tag)?;
            record = link_record(&tx, record_id, brand.id, actor)?;
        }
        Some(None) => record = unlink_record(&tx, record_id, actor)?,
        None => {}
    }

    tx.commit()?;
    Ok(record)
}

/// Brands offered in the record form's brand dropdown: everything, by name,
/// minus brands that already carry another record of the same provider.
pub fn brand_choices(conn: &Connection, record: &DatasourceRecord) -> Result<Vec<Brand>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM brands b
         WHERE NOT EXISTS (
             SELECT 1 FROM datasource_records r
             WHERE r.brand_id = b.id AND r.kind = ?1 AND r.id != ?2
         )
         ORDER BY b.name COLLATE NOCASE, b.id",
        BRAND_COLUMNS
    ))?;
    let brands = stmt
        .query_map(params![record.kind.code(), record.id], brand_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(brands)
}

// ============================================================================
// BULK ACTIONS
// ============================================================================

pub fn bulk_delete_records(conn: &Connection, ids: &[i64], limit: usize, actor: &str) -> Result<usize> {
    delete_records(conn, ids, limit, actor)
}

/// Unlink every listed record that is linked; returns how many changed.
pub fn bulk_unlink_records(conn: &Connection, ids: &[i64], limit: usize, actor: &str) -> Result<usize> {
    if ids.len() > limit {
        return Err(Error::invalid(format!(
            "cannot unlink {} records at once (limit {})",
            ids.len(),
            limit
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let mut unlinked = 0;
    for &id in ids {
        match get_record(&tx, id) {
            Ok(record) if record.is_linked() => {
                unlink_record(&tx, id, actor)?;
                unlinked += 1;
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    tx.commit()?;

    tracing::info!(unlinked, requested = ids.len(), "bulk unlink");
    Ok(unlinked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::{create_brand, NewBrand};
    use crate::datasource::{find_record, upsert_records, RecordInput};
    use crate::db::open_in_memory;

    fn record(conn: &Connection, kind: DatasourceKind, source_id: &str, name: &str) -> DatasourceRecord {
        upsert_records(conn, &[RecordInput::new(kind, source_id, name)], "test").unwrap();
        find_record(conn, kind, source_id).unwrap().unwrap()
    }

    fn brand(conn: &Connection, name: &str) -> Brand {
        create_brand(conn, NewBrand::named(name), "test").unwrap()
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(DATASOURCE_ADMIN.search_fields, &["name", "website"]);
        assert!(DATASOURCE_ADMIN.list_display.contains(&"controlled"));
        assert!(BRAND_ADMIN.search_fields.contains(&"aliases"));
    }

    #[test]
    fn test_readonly_fields_match_enforcement() {
        assert_eq!(
            readonly_fields(DatasourceKind::Custombank),
            DATASOURCE_ADMIN.readonly_fields.to_vec()
        );

        let imported = readonly_fields(DatasourceKind::Usnic);
        assert!(imported.contains(&"name"));
        assert!(imported.contains(&"control"));
        assert!(!imported.contains(&"brand"));

        for kind in DatasourceKind::ALL {
            let locked = readonly_fields(kind);
            assert!(DATASOURCE_ADMIN.readonly_fields.iter().all(|f| locked.contains(f)));
            for field in editable_fields(kind) {
                assert!(!locked.contains(field), "{} is editable on {}", field, kind.code());
            }
        }
    }

    #[test]
    fn test_datasource_changelist_renders_empty_as_dash() {
        let conn = open_in_memory().unwrap();
        let mut input = RecordInput::new(DatasourceKind::Usnic, "1", "Child Bank");
        input.control.insert("1000".to_string(), serde_json::json!({}));
        upsert_records(&conn, &[input], "test").unwrap();

        let list = datasource_changelist(&conn, &RecordFilter::default(), &PageRequest::new(1, 10)).unwrap();

        assert_eq!(list.columns, vec!["name", "website", "kind", "brand", "controlled"]);
        assert_eq!(list.rows[0].cells, vec!["Child Bank", "-", "US NIC", "-", "yes"]);
    }

    #[test]
    fn test_brand_changelist_counts_sources() {
        let conn = open_in_memory().unwrap();
        let b = brand(&conn, "Triodos");
        let gabv = record(&conn, DatasourceKind::Gabv, "t", "Triodos Bank");
        let bimpact = record(&conn, DatasourceKind::Bimpact, "t", "Triodos");
        link_record(&conn, gabv.id, b.id, "test").unwrap();
        link_record(&conn, bimpact.id, b.id, "test").unwrap();

        let list = brand_changelist(&conn, &BrandFilter::default(), &PageRequest::new(1, 10)).unwrap();
        assert_eq!(list.rows[0].cells, vec!["Triodos", "triodos", "-", "2", "bimpact, gabv"]);
    }

    #[test]
    fn test_imported_records_only_accept_brand_changes() {
        let conn = open_in_memory().unwrap();
        let r = record(&conn, DatasourceKind::Banktrack, "1", "Big Bank");
        let b = brand(&conn, "Big Bank");

        let rename = RecordChanges {
            name: Some("Bigger Bank".to_string()),
            ..Default::default()
        };
        let err = apply_record_changes(&conn, r.id, &rename, "test").unwrap_err();
        assert!(matches!(err, Error::ReadOnlyField(ref f) if f == "name"));

        // Unchanged value is fine
        let same = RecordChanges {
            name: Some("Big Bank".to_string()),
            brand: Some(Some(b.tag.clone())),
            ..Default::default()
        };
        let linked = apply_record_changes(&conn, r.id, &same, "test").unwrap();
        assert_eq!(linked.brand_id, Some(b.id));

        let unlink = RecordChanges {
            brand: Some(None),
            ..Default::default()
        };
        assert_eq!(apply_record_changes(&conn, r.id, &unlink, "test").unwrap().brand_id, None);
    }

    #[test]
    fn test_custombank_is_editable_except_keys() {
        let conn = open_in_memory().unwrap();
        let r = record(&conn, DatasourceKind::Custombank, "c1", "My Credit Union");

        let edit = RecordChanges {
            website: Some("https://mycu.example".to_string()),
            regions: Some(vec!["US-WA".to_string()]),
            ..Default::default()
        };
        let saved = apply_record_changes(&conn, r.id, &edit, "test").unwrap();
        assert_eq!(saved.website, "https://mycu.example");
        assert!(saved.has_regions());

        let retag = RecordChanges {
            tag: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            apply_record_changes(&conn, r.id, &retag, "test"),
            Err(Error::ReadOnlyField(ref f)) if f == "tag"
        ));
    }

    #[test]
    fn test_record_changes_json() {
        let absent: RecordChanges = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.brand, None);

        let null: RecordChanges = serde_json::from_str(r#"{"brand": null}"#).unwrap();
        assert_eq!(null.brand, Some(None));

        let tag: RecordChanges = serde_json::from_str(r#"{"brand": "triodos"}"#).unwrap();
        assert_eq!(tag, RecordChanges::link("triodos"));

        assert!(serde_json::from_str::<RecordChanges>(r#"{"colour": "green"}"#).is_err());
    }

    #[test]
    fn test_brand_choices_exclude_taken_brands() {
        let conn = open_in_memory().unwrap();
        let taken = brand(&conn, "Alpha");
        brand(&conn, "Bravo");
        let first = record(&conn, DatasourceKind::Usnic, "1", "Alpha One");
        let second = record(&conn, DatasourceKind::Usnic, "2", "Alpha Two");
        let other_kind = record(&conn, DatasourceKind::Wikidata, "Q1", "Alpha");
        link_record(&conn, first.id, taken.id, "test").unwrap();

        let names = |r: &DatasourceRecord| -> Vec<String> {
            brand_choices(&conn, r).unwrap().into_iter().map(|b| b.name).collect()
        };

        assert_eq!(names(&second), vec!["Bravo"]);
        // The record already linked still sees its own brand
        assert_eq!(names(&first), vec!["Alpha", "Bravo"]);
        assert_eq!(names(&other_kind), vec!["Alpha", "Bravo"]);
    }

    #[test]
    fn test_bulk_actions_are_bounded() {
        let conn = open_in_memory().unwrap();
        let b = brand(&conn, "Alpha");
        let a = record(&conn, DatasourceKind::Usnic, "1", "A");
        let c = record(&conn, DatasourceKind::Gabv, "2", "C");
        link_record(&conn, a.id, b.id, "test").unwrap();

        assert!(matches!(
            bulk_unlink_records(&conn, &[a.id, c.id], 1, "test"),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(bulk_unlink_records(&conn, &[a.id, c.id, 999], 10, "test").unwrap(), 1);

        assert_eq!(bulk_delete_records(&conn, &[a.id, c.id], 10, "test").unwrap(), 2);
    }
}
