// Brand suggestions for unlinked records.
//
// Two signals: the record's website domain equals the brand's, or the
// normalized names are within LEV_DISTANCE edits of each other.

use crate::admin::brand_choices;
use crate::brand::{all_brands, Brand};
use crate::datasource::{link_record, list_records, DatasourceKind, DatasourceRecord};
use crate::error::Result;
use crate::query::{PageRequest, RecordFilter};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use strsim::levenshtein;
use url::Url;

/// Maximum edit distance for two normalized names to count as a match
pub const LEV_DISTANCE: usize = 3;

const STOPWORDS: &[&str] = &[
    "the",
    "bank",
    "of",
    "inc",
    "na",
    "plc",
    "ag",
    "sa",
    "ltd",
    "corporation",
    "company",
];

/// "The Bank of Nova Scotia, Inc." -> "nova scotia"
pub fn normalize_name(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    lowered
        .split_whitespace()
        .filter(|word| !STOPWORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bare host of a website: no scheme, credentials, `www.`, port or path.
/// Values without a scheme are read as `https://`.
pub fn website_domain(website: &str) -> Option<String> {
    let website = website.trim();
    if website.is_empty() {
        return None;
    }

    let parsed = Url::parse(website)
        .ok()
        .filter(|url| url.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{}", website)).ok())?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.trim_end_matches('.');
    let host = host.strip_prefix("www.").unwrap_or(host);

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub brand_id: i64,
    pub tag: String,
    /// 0 for a website match
    pub distance: usize,
    pub website_match: bool,
}

fn name_distance(record_name: &str, brand: &Brand) -> Option<usize> {
    if record_name.is_empty() {
        return None;
    }
    brand
        .all_names()
        .into_iter()
        .map(normalize_name)
        .filter(|n| !n.is_empty())
        .map(|n| levenshtein(record_name, &n))
        .min()
}

/// Candidate brands for `record`, best first
pub fn suggest_brands(record: &DatasourceRecord, brands: &[Brand]) -> Vec<Suggestion> {
    let record_name = normalize_name(&record.name);
    let record_domain = website_domain(&record.website);

    let mut suggestions: Vec<Suggestion> = brands
        .iter()
        .filter_map(|brand| {
            let website_match = record_domain.is_some() && record_domain == website_domain(&brand.website);
            let distance = if website_match {
                Some(0)
            } else {
                name_distance(&record_name, brand).filter(|d| *d <= LEV_DISTANCE)
            };

            distance.map(|distance| Suggestion {
                brand_id: brand.id,
                tag: brand.tag.clone(),
                distance,
                website_match,
            })
        })
        .collect();

    suggestions.sort_by(|a, b| {
        (!a.website_match, a.distance, &a.tag).cmp(&(!b.website_match, b.distance, &b.tag))
    });
    suggestions
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoLinkReport {
    pub linked: usize,
    /// More than one exact candidate
    pub ambiguous: usize,
    pub unmatched: usize,
}

/// Link every unlinked record of `kind` that has exactly one exact candidate
/// among the brands it may still be linked to.
pub fn auto_link(conn: &Connection, kind: DatasourceKind, actor: &str) -> Result<AutoLinkReport> {
    let brands = all_brands(conn)?;
    let filter = RecordFilter {
        kind: Some(kind),
        linked: Some(false),
        ..Default::default()
    };
    let unlinked = list_records(conn, &filter, &PageRequest::all())?.results;
    let mut report = AutoLinkReport::default();

    for record in &unlinked {
        // Choices shrink as records get linked
        let allowed: Vec<i64> = brand_choices(conn, record)?.iter().map(|b| b.id).collect();
        let exact: Vec<Suggestion> = suggest_brands(record, &brands)
            .into_iter()
            .filter(|s| s.distance == 0 && allowed.contains(&s.brand_id))
            .collect();

        match exact.as_slice() {
            [only] => {
                link_record(conn, record.id, only.brand_id, actor)?;
                report.linked += 1;
            }
            [] => report.unmatched += 1,
            _ => {
                tracing::debug!(record_id = record.id, candidates = exact.len(), "ambiguous auto-link");
                report.ambiguous += 1;
            }
        }
    }

    tracing::info!(
        %kind,
        linked = report.linked,
        ambiguous = report.ambiguous,
        unmatched = report.unmatched,
        "auto-link finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::{create_brand, update_brand, BrandChanges, NewBrand};
    use crate::datasource::{find_record, get_record, upsert_records, RecordInput};
    use crate::db::open_in_memory;

    fn new_brand(conn: &Connection, name: &str, website: &str) -> Brand {
        create_brand(
            conn,
            NewBrand {
                website: website.to_string(),
                ..NewBrand::named(name)
            },
            "test",
        )
        .unwrap()
    }

    fn new_record(conn: &Connection, kind: DatasourceKind, id: &str, name: &str, website: &str) -> DatasourceRecord {
        let mut input = RecordInput::new(kind, id, name);
        input.website = website.to_string();
        upsert_records(conn, &[input], "test").unwrap();
        find_record(conn, kind, id).unwrap().unwrap()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("The Bank of Nova Scotia, Inc."), "nova scotia");
        assert_eq!(normalize_name("JPMorgan Chase Bank, N.A."), "jpmorgan chase n a");
        assert_eq!(normalize_name("Bank of America"), "america");
        assert_eq!(normalize_name("  BANK  "), "");
    }

    #[test]
    fn test_website_domain() {
        assert_eq!(website_domain("https://www.Triodos.com/en/"), Some("triodos.com".to_string()));
        assert_eq!(website_domain("http://example.org:8080?x=1"), Some("example.org".to_string()));
        assert_eq!(website_domain("gls.de"), Some("gls.de".to_string()));
        assert_eq!(website_domain("   "), None);
    }

    #[test]
    fn test_website_domain_edge_cases() {
        assert_eq!(website_domain("https://admin@bank.example/"), Some("bank.example".to_string()));
        assert_eq!(website_domain("ftp://bank.example"), Some("bank.example".to_string()));
        assert_eq!(website_domain("https://www.bank.example./"), Some("bank.example".to_string()));
        assert_eq!(website_domain("bank.example:8443/login"), Some("bank.example".to_string()));
    }

    #[test]
    fn test_suggestions_ranked() {
        let conn = open_in_memory().unwrap();
        let triodos = new_brand(&conn, "Triodos Bank", "https://www.triodos.com");
        new_brand(&conn, "Triodes", "");
        new_brand(&conn, "Barclays", "https://barclays.co.uk");
        let record = new_record(&conn, DatasourceKind::Gabv, "t", "Triodos", "http://triodos.com/about");

        let suggestions = suggest_brands(&record, &all_brands(&conn).unwrap());

        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].brand_id, triodos.id);
        assert!(suggestions[0].website_match);
        assert_eq!(suggestions[1].tag, "triodes");
        assert_eq!(suggestions[1].distance, 1);
    }

    #[test]
    fn test_alias_counts_as_name() {
        let conn = open_in_memory().unwrap();
        let wise = new_brand(&conn, "Wise", "");
        update_brand(
            &conn,
            wise.id,
            BrandChanges { aliases: Some(vec!["TransferWise".to_string()]), ..Default::default() },
            "test",
        )
        .unwrap();
        let record = new_record(&conn, DatasourceKind::Switchit, "w", "TransferWise Ltd", "");

        let suggestions = suggest_brands(&record, &all_brands(&conn).unwrap());
        assert_eq!(suggestions[0].distance, 0);
        assert!(!suggestions[0].website_match);
    }

    #[test]
    fn test_auto_link() {
        let conn = open_in_memory().unwrap();
        let gls = new_brand(&conn, "GLS Bank", "https://gls.de");
        new_brand(&conn, "Ethical One", "https://ethical.example");
        new_brand(&conn, "Ethical Two", "https://ethical.example");

        let linked = new_record(&conn, DatasourceKind::Gabv, "1", "GLS Gemeinschaftsbank", "https://www.gls.de");
        let ambiguous = new_record(&conn, DatasourceKind::Gabv, "2", "Ethical", "ethical.example");
        let unmatched = new_record(&conn, DatasourceKind::Gabv, "3", "Nobody", "");
        // Same domain as GLS, but sorted last: GLS already has its gabv record by then
        let blocked = new_record(&conn, DatasourceKind::Gabv, "4", "Zed mirror", "gls.de");

        let report = auto_link(&conn, DatasourceKind::Gabv, "test").unwrap();

        assert_eq!(report, AutoLinkReport { linked: 1, ambiguous: 1, unmatched: 2 });
        assert_eq!(get_record(&conn, linked.id).unwrap().brand_id, Some(gls.id));
        assert_eq!(get_record(&conn, ambiguous.id).unwrap().brand_id, None);
        assert_eq!(get_record(&conn, unmatched.id).unwrap().brand_id, None);
        assert_eq!(get_record(&conn, blocked.id).unwrap().brand_id, None);
    }
}
