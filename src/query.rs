//! Filters and pagination for the catalog listings
//!
//! Filters mirror the admin changelist: every criterion that is set narrows
//! the result and criteria are combined with AND. Two pagination styles are
//! supported: numbered pages for the datasource listings and relay-style
//! cursor connections for brands.

use crate::datasource::DatasourceKind;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

// ============================================================================
// RECORD FILTER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub kind: Option<DatasourceKind>,

    /// Some(true): control map not empty. Some(false): independent.
    pub controlled: Option<bool>,

    /// Some(true): brand foreign key set
    pub linked: Option<bool>,

    /// Some(true): at least one regional branch
    pub has_regions: Option<bool>,

    pub country: Option<String>,

    /// Case-insensitive substring over name and website
    pub search: Option<String>,
}

impl RecordFilter {
    pub fn for_kind(kind: DatasourceKind) -> Self {
        RecordFilter {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == RecordFilter::default()
    }

    /// Render as a SQL `WHERE` clause (without the keyword) plus bound values.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(kind) = self.kind {
            values.push(Value::Text(kind.code().to_string()));
            clauses.push(format!("kind = ?{}", values.len()));
        }

        match self.controlled {
            Some(true) => clauses.push("(SELECT COUNT(*) FROM json_each(control)) > 0".to_string()),
            Some(false) => clauses.push("(SELECT COUNT(*) FROM json_each(control)) = 0".to_string()),
            None => {}
        }

        match self.linked {
            Some(true) => clauses.push("brand_id IS NOT NULL".to_string()),
            Some(false) => clauses.push("brand_id IS NULL".to_string()),
            None => {}
        }

        match self.has_regions {
            Some(true) => clauses.push("(SELECT COUNT(*) FROM json_each(regions)) > 0".to_string()),
            Some(false) => clauses.push("(SELECT COUNT(*) FROM json_each(regions)) = 0".to_string()),
            None => {}
        }

        if let Some(country) = self.country.as_deref().filter(|c| !c.is_empty()) {
            values.push(Value::Text(country.to_uppercase()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(countries) WHERE upper(value) = ?{})",
                values.len()
            ));
        }

        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(like_pattern(search)));
            let n = values.len();
            clauses.push(format!(
                "(name LIKE ?{n} ESCAPE '\\' OR website LIKE ?{n} ESCAPE '\\')"
            ));
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (clause, values)
    }
}

// ============================================================================
// BRAND FILTER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrandFilter {
    /// Case-insensitive substring over name, tag, website and aliases
    pub search: Option<String>,
    pub country: Option<String>,
    /// Some(true): at least one datasource record linked
    pub has_records: Option<bool>,
}

impl BrandFilter {
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(like_pattern(search)));
            let n = values.len();
            clauses.push(format!(
                "(b.name LIKE ?{n} ESCAPE '\\' OR b.tag LIKE ?{n} ESCAPE '\\' \
                 OR b.website LIKE ?{n} ESCAPE '\\' OR b.aliases LIKE ?{n} ESCAPE '\\')"
            ));
        }

        if let Some(country) = self.country.as_deref().filter(|c| !c.is_empty()) {
            values.push(Value::Text(country.to_uppercase()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(b.countries) WHERE upper(value) = ?{})",
                values.len()
            ));
        }

        match self.has_records {
            Some(true) => clauses.push(
                "EXISTS (SELECT 1 FROM datasource_records r WHERE r.brand_id = b.id)".to_string(),
            ),
            Some(false) => clauses.push(
                "NOT EXISTS (SELECT 1 FROM datasource_records r WHERE r.brand_id = b.id)".to_string(),
            ),
            None => {}
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (clause, values)
    }
}

/// `%term%` with LIKE wildcards in the term escaped. SQLite LIKE is
/// case-insensitive for ASCII.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

// ============================================================================
// PAGE-NUMBER PAGINATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        PageRequest { page, page_size }
    }

    /// Everything on one page, for callers that want the full list
    pub fn all() -> Self {
        PageRequest {
            page: 1,
            page_size: usize::MAX / 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(Error::invalid("page numbers start at 1"));
        }
        if self.page_size == 0 {
            return Err(Error::invalid("page size must be at least 1"));
        }
        Ok(())
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: usize,
    pub page: usize,
    pub page_size: usize,
    pub num_pages: usize,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    /// Fail when `request` points past the last page. Page 1 always exists.
    pub(crate) fn check_bounds(request: &PageRequest, count: usize) -> Result<usize> {
        request.validate()?;
        let num_pages = num_pages(count, request.page_size);
        if request.page > num_pages {
            return Err(Error::not_found(format!(
                "page {} (last page is {})",
                request.page, num_pages
            )));
        }
        Ok(num_pages)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.num_pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page {
            count: self.count,
            page: self.page,
            page_size: self.page_size,
            num_pages: self.num_pages,
            results: self.results.into_iter().map(f).collect(),
        }
    }
}

fn num_pages(count: usize, page_size: usize) -> usize {
    if count == 0 {
        1
    } else {
        count.div_ceil(page_size)
    }
}

// ============================================================================
// RELAY CONNECTION PAGINATION
// ============================================================================

const CURSOR_PREFIX: &str = "arrayconnection:";

pub fn encode_cursor(offset: usize) -> String {
    STANDARD.encode(format!("{}{}", CURSOR_PREFIX, offset))
}

pub fn decode_cursor(cursor: &str) -> Result<usize> {
    let bytes = STANDARD
        .decode(cursor.trim())
        .map_err(|_| Error::invalid(format!("malformed cursor '{}'", cursor)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::invalid(format!("malformed cursor '{}'", cursor)))?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| Error::invalid(format!("malformed cursor '{}'", cursor)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionArgs {
    pub first: Option<usize>,
    pub after: Option<String>,
}

impl ConnectionArgs {
    /// Resolve to `(offset, limit)` given the configured maximum.
    pub fn resolve(&self, max_limit: usize) -> Result<(usize, usize)> {
        let limit = match self.first {
            Some(first) if first > max_limit => {
                return Err(Error::invalid(format!(
                    "requesting {} records exceeds the limit of {}",
                    first, max_limit
                )))
            }
            Some(first) => first,
            None => max_limit,
        };
        let offset = match self.after.as_deref() {
            Some(cursor) => decode_cursor(cursor)?
                .checked_add(1)
                .ok_or_else(|| Error::invalid(format!("cursor '{}' is out of range", cursor)))?,
            None => 0,
        };
        Ok((offset, limit))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPage<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
    pub total_count: usize,
}

impl<T> ConnectionPage<T> {
    /// Wrap the slice of nodes fetched at `offset` out of `total_count`.
    pub fn from_nodes(nodes: Vec<T>, offset: usize, total_count: usize) -> Self {
        let edges: Vec<Edge<T>> = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| Edge {
                cursor: encode_cursor(offset + i),
                node,
            })
            .collect();

        let page_info = PageInfo {
            has_next_page: offset + edges.len() < total_count,
            has_previous_page: offset > 0,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        };

        ConnectionPage {
            edges,
            page_info,
            total_count,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }
}
