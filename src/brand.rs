// Brand: the canonical institution that datasource records link to.
//
// "Bank of America" from BankTrack, the FFIEC and Wikidata are three records
// and one brand. The tag is the brand's stable public key.

use crate::datasource::{self, get_record, link_record, DatasourceRecord};
use crate::db::{parse_json, parse_timestamp, record_event, to_timestamp};
use crate::error::{Error, Result};
use crate::query::{BrandFilter, ConnectionArgs, ConnectionPage, Page, PageRequest};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// BRAND ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
    pub id: i64,
    pub tag: String,
    pub name: String,
    /// Alternative names, e.g. ["BofA", "Bank of America NA"]
    pub aliases: Vec<String>,
    pub website: String,
    pub countries: Vec<String>,
    pub description: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Brand {
    /// Canonical name followed by aliases
    pub fn all_names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBrand {
    /// Defaults to `slugify(name)`
    #[serde(default)]
    pub tag: Option<String>,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl NewBrand {
    pub fn named(name: impl Into<String>) -> Self {
        NewBrand {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Editable brand fields; `None` leaves the value untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrandChanges {
    pub tag: Option<String>,
    pub name: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub website: Option<String>,
    pub countries: Option<Vec<String>>,
    pub description: Option<String>,
}

pub(crate) const BRAND_COLUMNS: &str =
    "b.id, b.tag, b.name, b.aliases, b.website, b.countries, b.description, b.created, b.modified";

pub(crate) fn brand_from_row(row: &Row<'_>) -> rusqlite::Result<Brand> {
    let aliases: String = row.get(3)?;
    let countries: String = row.get(5)?;
    let created: String = row.get(7)?;
    let modified: String = row.get(8)?;

    Ok(Brand {
        id: row.get(0)?,
        tag: row.get(1)?,
        name: row.get(2)?,
        aliases: parse_json(3, &aliases)?,
        website: row.get(4)?,
        countries: parse_json(5, &countries)?,
        description: row.get(6)?,
        created: parse_timestamp(7, &created)?,
        modified: parse_timestamp(8, &modified)?,
    })
}

// ============================================================================
// TAGS
// ============================================================================

/// Lowercase ASCII alphanumerics; any other run of characters becomes one `_`.
///
/// "Bank of America, N.A." -> "bank_of_america_n_a"
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    slug
}

pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Tag without one trailing `_<digits>` suffix: "triodos_2" -> "triodos"
pub fn tag_stem(tag: &str) -> &str {
    match tag.rsplit_once('_') {
        Some((stem, suffix))
            if !stem.is_empty() && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) =>
        {
            stem
        }
        _ => tag,
    }
}

fn tag_taken(conn: &Connection, tag: &str) -> Result<bool> {
    let taken = conn
        .query_row("SELECT 1 FROM brands WHERE tag = ?1", [tag], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    Ok(taken)
}

/// `base`, or the first free `base_2`, `base_3`, ...
pub fn unique_tag(conn: &Connection, base: &str) -> Result<String> {
    if !tag_taken(conn, base)? {
        return Ok(base.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !tag_taken(conn, &candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

// ============================================================================
// CRUD
// ============================================================================

pub fn create_brand(conn: &Connection, new: NewBrand, actor: &str) -> Result<Brand> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(Error::invalid("brand name is required"));
    }

    let tag = match new.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(tag) => tag.to_string(),
        None => slugify(name),
    };
    if !is_valid_tag(&tag) {
        return Err(Error::invalid(format!(
            "'{}' is not a valid tag (lowercase letters, digits, '_' and '-')",
            tag
        )));
    }
    if tag_taken(conn, &tag)? {
        return Err(Error::Conflict(format!("brand tag '{}' already exists", tag)));
    }

    let now = to_timestamp(&Utc::now());
    conn.execute(
        "INSERT INTO brands (tag, name, aliases, website, countries, description, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            tag,
            name,
            serde_json::to_string(&new.aliases)?,
            new.website.trim(),
            serde_json::to_string(&new.countries)?,
            new.description,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    record_event(conn, "brand_created", "brand", id, serde_json::json!({ "tag": tag }), actor)?;
    tracing::info!(brand_id = id, %tag, "brand created");

    get_brand(conn, id)
}

/// Create a brand from an unlinked record and link the record to it.
pub fn create_brand_from_record(conn: &Connection, record_id: i64, actor: &str) -> Result<Brand> {
    let record = get_record(conn, record_id)?;
    if let Some(brand_id) = record.brand_id {
        return Err(Error::Conflict(format!(
            "record {} is already linked to brand {}",
            record_id, brand_id
        )));
    }

    let base = slugify(&record.name);
    if base.is_empty() {
        return Err(Error::invalid(format!(
            "cannot derive a tag from record name '{}'",
            record.name
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let brand = create_brand(
        &tx,
        NewBrand {
            tag: Some(unique_tag(&tx, &base)?),
            name: record.name.clone(),
            aliases: Vec::new(),
            website: record.website.clone(),
            countries: record.countries.clone(),
            description: record.description.clone(),
        },
        actor,
    )?;
    link_record(&tx, record_id, brand.id, actor)?;
    tx.commit()?;

    Ok(brand)
}

pub fn get_brand(conn: &Connection, id: i64) -> Result<Brand> {
    conn.query_row(
        &format!("SELECT {} FROM brands b WHERE b.id = ?1", BRAND_COLUMNS),
        [id],
        brand_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("brand {}", id)))
}

pub fn get_brand_by_tag(conn: &Connection, tag: &str) -> Result<Brand> {
    conn.query_row(
        &format!("SELECT {} FROM brands b WHERE b.tag = ?1", BRAND_COLUMNS),
        [tag],
        brand_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("brand '{}'", tag)))
}

pub fn update_brand(conn: &Connection, id: i64, changes: BrandChanges, actor: &str) -> Result<Brand> {
    let mut brand = get_brand(conn, id)?;

    if let Some(tag) = changes.tag.as_deref().map(str::trim) {
        if tag != brand.tag {
            if !is_valid_tag(tag) {
                return Err(Error::invalid(format!("'{}' is not a valid tag", tag)));
            }
            if tag_taken(conn, tag)? {
                return Err(Error::Conflict(format!("brand tag '{}' already exists", tag)));
            }
            brand.tag = tag.to_string();
        }
    }
    if let Some(name) = changes.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err(Error::invalid("brand name is required"));
        }
        brand.name = name.to_string();
    }
    if let Some(aliases) = changes.aliases.clone() {
        brand.aliases = aliases;
    }
    if let Some(website) = changes.website.as_deref() {
        brand.website = website.trim().to_string();
    }
    if let Some(countries) = changes.countries.clone() {
        brand.countries = countries;
    }
    if let Some(description) = changes.description.clone() {
        brand.description = description;
    }

    conn.execute(
        "UPDATE brands SET tag = ?2, name = ?3, aliases = ?4, website = ?5,
            countries = ?6, description = ?7, modified = ?8
         WHERE id = ?1",
        params![
            id,
            brand.tag,
            brand.name,
            serde_json::to_string(&brand.aliases)?,
            brand.website,
            serde_json::to_string(&brand.countries)?,
            brand.description,
            to_timestamp(&Utc::now()),
        ],
    )?;
    record_event(conn, "brand_updated", "brand", id, serde_json::to_value(&changes)?, actor)?;

    get_brand(conn, id)
}

/// Delete a brand; its records stay and become unlinked.
pub fn delete_brand(conn: &Connection, id: i64, actor: &str) -> Result<()> {
    let brand = get_brand(conn, id)?;

    let tx = conn.unchecked_transaction()?;
    // Explicit so the unlink does not depend on the foreign_keys pragma
    let unlinked = tx.execute(
        "UPDATE datasource_records SET brand_id = NULL, modified = ?2 WHERE brand_id = ?1",
        params![id, to_timestamp(&Utc::now())],
    )?;
    tx.execute("DELETE FROM brands WHERE id = ?1", [id])?;
    record_event(
        &tx,
        "brand_deleted",
        "brand",
        id,
        serde_json::json!({ "tag": brand.tag, "unlinked_records": unlinked }),
        actor,
    )?;
    tx.commit()?;

    tracing::info!(brand_id = id, tag = %brand.tag, unlinked, "brand deleted");
    Ok(())
}

// ============================================================================
// LISTINGS
// ============================================================================

pub fn count_brands(conn: &Connection, filter: &BrandFilter) -> Result<usize> {
    let (clause, values) = filter.to_sql();
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM brands b WHERE {}", clause),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn fetch_brands(conn: &Connection, filter: &BrandFilter, limit: usize, offset: usize) -> Result<Vec<Brand>> {
    let (clause, mut values) = filter.to_sql();
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
    let n = values.len();

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM brands b WHERE {}
         ORDER BY b.name COLLATE NOCASE, b.id
         LIMIT ?{} OFFSET ?{}",
        BRAND_COLUMNS,
        clause,
        n - 1,
        n
    ))?;
    let brands = stmt
        .query_map(params_from_iter(values.iter()), brand_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(brands)
}

pub fn list_brands(conn: &Connection, filter: &BrandFilter, page: &PageRequest) -> Result<Page<Brand>> {
    let count = count_brands(conn, filter)?;
    let num_pages = Page::<Brand>::check_bounds(page, count)?;
    let results = fetch_brands(conn, filter, page.page_size, page.offset())?;

    Ok(Page {
        count,
        page: page.page,
        page_size: page.page_size,
        num_pages,
        results,
    })
}

/// Cursor-paginated brand listing; `first` is capped by `max_limit`.
pub fn brand_connection(
    conn: &Connection,
    filter: &BrandFilter,
    args: &ConnectionArgs,
    max_limit: usize,
) -> Result<ConnectionPage<Brand>> {
    let (offset, limit) = args.resolve(max_limit)?;
    let total = count_brands(conn, filter)?;
    let nodes = fetch_brands(conn, filter, limit, offset)?;
    Ok(ConnectionPage::from_nodes(nodes, offset, total))
}

pub fn all_brands(conn: &Connection) -> Result<Vec<Brand>> {
    fetch_brands(conn, &BrandFilter::default(), usize::MAX, 0)
}

pub fn linked_records(conn: &Connection, brand_id: i64) -> Result<Vec<DatasourceRecord>> {
    get_brand(conn, brand_id)?;
    datasource::records_linked_to(conn, brand_id)
}

pub fn brands_with_tag_prefix(conn: &Connection, prefix: &str) -> Result<Vec<Brand>> {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM brands b WHERE b.tag LIKE ?1 ESCAPE '\\' ORDER BY b.tag",
        BRAND_COLUMNS
    ))?;
    let brands = stmt
        .query_map([format!("{}%", escaped)], brand_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(brands)
}

// ============================================================================
// TAG-PREFIX DEDUPLICATION
// ============================================================================

/// Brands whose tags share a stem, e.g. `triodos` and `triodos_2`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub stem: String,
    pub brands: Vec<Brand>,
}

pub fn find_duplicates(conn: &Connection) -> Result<Vec<DuplicateGroup>> {
    let mut groups: BTreeMap<String, Vec<Brand>> = BTreeMap::new();
    for brand in all_brands(conn)? {
        groups
            .entry(tag_stem(&brand.tag).to_string())
            .or_default()
            .push(brand);
    }

    Ok(groups
        .into_iter()
        .filter(|(_, brands)| brands.len() > 1)
        .map(|(stem, mut brands)| {
            brands.sort_by(|a, b| a.tag.cmp(&b.tag));
            DuplicateGroup { stem, brands }
        })
        .collect())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{find_record, upsert_records, DatasourceKind, RecordInput};
    use crate::db::{get_events_for_entity, open_in_memory};

    fn brand(conn: &Connection, name: &str) -> Brand {
        create_brand(conn, NewBrand::named(name), "test").unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Bank of America, N.A."), "bank_of_america_n_a");
        assert_eq!(slugify("  Triodos  Bank "), "triodos_bank");
        assert_eq!(slugify("Caixa Geral de Depósitos"), "caixa_geral_de_dep_sitos");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_tag_stem() {
        assert_eq!(tag_stem("triodos_2"), "triodos");
        assert_eq!(tag_stem("bank_2_3"), "bank_2");
        assert_eq!(tag_stem("bank_of_america"), "bank_of_america");
        assert_eq!(tag_stem("_2"), "_2");
        assert_eq!(tag_stem("abc_"), "abc_");
    }

    #[test]
    fn test_create_brand_defaults_tag() {
        let conn = open_in_memory().unwrap();
        let b = brand(&conn, "Triodos Bank");

        assert_eq!(b.tag, "triodos_bank");
        assert_eq!(get_brand_by_tag(&conn, "triodos_bank").unwrap().id, b.id);
        assert_eq!(get_events_for_entity(&conn, "brand", &b.id.to_string()).unwrap().len(), 1);
    }

    #[test]
    fn test_create_brand_validation() {
        let conn = open_in_memory().unwrap();
        brand(&conn, "Triodos Bank");

        assert!(matches!(
            create_brand(&conn, NewBrand::named("Triodos Bank"), "test"),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            create_brand(&conn, NewBrand::named("   "), "test"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            create_brand(&conn, NewBrand::named("???"), "test"),
            Err(Error::InvalidInput(_))
        ));
        let bad_tag = NewBrand {
            tag: Some("Not A Tag".to_string()),
            ..NewBrand::named("Other")
        };
        assert!(matches!(create_brand(&conn, bad_tag, "test"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_unique_tag_and_duplicates() {
        let conn = open_in_memory().unwrap();
        brand(&conn, "Triodos");
        assert_eq!(unique_tag(&conn, "triodos").unwrap(), "triodos_2");

        create_brand(
            &conn,
            NewBrand { tag: Some("triodos_2".to_string()), ..NewBrand::named("Triodos UK") },
            "test",
        )
        .unwrap();
        brand(&conn, "GLS Bank");

        assert_eq!(unique_tag(&conn, "triodos").unwrap(), "triodos_3");

        let groups = find_duplicates(&conn).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].stem, "triodos");
        let tags: Vec<&str> = groups[0].brands.iter().map(|b| b.tag.as_str()).collect();
        assert_eq!(tags, vec!["triodos", "triodos_2"]);

        let prefixed = brands_with_tag_prefix(&conn, "triodos").unwrap();
        assert_eq!(prefixed.len(), 2);
        assert!(brands_with_tag_prefix(&conn, "tri_").unwrap().is_empty());
    }

    #[test]
    fn test_create_brand_from_record_links_it() {
        let conn = open_in_memory().unwrap();
        brand(&conn, "Ethical Bank");
        let mut input = RecordInput::new(DatasourceKind::Bimpact, "e1", "Ethical Bank");
        input.website = "https://ethical.example".to_string();
        upsert_records(&conn, &[input], "test").unwrap();
        let record = find_record(&conn, DatasourceKind::Bimpact, "e1").unwrap().unwrap();

        let created = create_brand_from_record(&conn, record.id, "test").unwrap();

        assert_eq!(created.tag, "ethical_bank_2");
        assert_eq!(created.website, "https://ethical.example");
        assert_eq!(linked_records(&conn, created.id).unwrap()[0].id, record.id);

        // Already linked now
        assert!(matches!(
            create_brand_from_record(&conn, record.id, "test"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_update_brand() {
        let conn = open_in_memory().unwrap();
        let b = brand(&conn, "Wise");
        brand(&conn, "Stripe");

        let updated = update_brand(
            &conn,
            b.id,
            BrandChanges {
                aliases: Some(vec!["TransferWise".to_string()]),
                countries: Some(vec!["GB".to_string()]),
                ..Default::default()
            },
            "test",
        )
        .unwrap();
        assert_eq!(updated.aliases, vec!["TransferWise"]);
        assert_eq!(updated.all_names(), vec!["Wise", "TransferWise"]);
        assert_eq!(updated.created, b.created);

        let clash = BrandChanges {
            tag: Some("stripe".to_string()),
            ..Default::default()
        };
        assert!(matches!(update_brand(&conn, b.id, clash, "test"), Err(Error::Conflict(_))));
        assert!(matches!(
            update_brand(&conn, 999, BrandChanges::default(), "test"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_brand_unlinks_records() {
        let conn = open_in_memory().unwrap();
        let b = brand(&conn, "Umpqua");
        upsert_records(&conn, &[RecordInput::new(DatasourceKind::Usnic, "u", "Umpqua Bank")], "test").unwrap();
        let record = find_record(&conn, DatasourceKind::Usnic, "u").unwrap().unwrap();
        link_record(&conn, record.id, b.id, "test").unwrap();

        delete_brand(&conn, b.id, "test").unwrap();

        assert!(matches!(get_brand(&conn, b.id), Err(Error::NotFound(_))));
        assert_eq!(get_record(&conn, record.id).unwrap().brand_id, None);
    }

    #[test]
    fn test_brand_connection_pages_through() {
        let conn = open_in_memory().unwrap();
        for name in ["Alpha", "Bravo", "Charlie", "Delta", "Echo"] {
            brand(&conn, name);
        }

        let first = brand_connection(
            &conn,
            &BrandFilter::default(),
            &ConnectionArgs { first: Some(2), after: None },
            10_000,
        )
        .unwrap();
        assert_eq!(first.total_count, 5);
        assert!(first.page_info.has_next_page);
        let names: Vec<&str> = first.nodes().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Bravo"]);

        let rest = brand_connection(
            &conn,
            &BrandFilter::default(),
            &ConnectionArgs { first: None, after: first.page_info.end_cursor.clone() },
            10_000,
        )
        .unwrap();
        assert_eq!(rest.edges.len(), 3);
        assert!(!rest.page_info.has_next_page);
        assert!(rest.page_info.has_previous_page);
    }

    #[test]
    fn test_brand_filters() {
        let conn = open_in_memory().unwrap();
        let wise = brand(&conn, "Wise");
        update_brand(
            &conn,
            wise.id,
            BrandChanges { aliases: Some(vec!["TransferWise".to_string()]), ..Default::default() },
            "test",
        )
        .unwrap();
        brand(&conn, "Stripe");

        let page = PageRequest::new(1, 10);
        let by_alias = list_brands(
            &conn,
            &BrandFilter { search: Some("transfer".to_string()), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(by_alias.count, 1);
        assert_eq!(by_alias.results[0].tag, "wise");

        let without_records = list_brands(
            &conn,
            &BrandFilter { has_records: Some(false), ..Default::default() },
            &page,
        )
        .unwrap();
        assert_eq!(without_records.count, 2);
    }
}
