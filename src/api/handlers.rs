// ============================================================================
// API Handlers
// ============================================================================

use super::{ApiResponse, ApiResult, AppState};
use crate::admin::{apply_record_changes, bulk_delete_records, bulk_unlink_records, RecordChanges};
use crate::brand::{
    all_brands, brand_connection, create_brand_from_record as brand_from_record, find_duplicates,
    get_brand_by_tag, linked_records, Brand, DuplicateGroup,
};
use crate::control::{control_summary, controlled_orgs, ControlSummary};
use crate::datasource::{
    count_by_kind, get_record, link_record, list_records, unlink_record, DatasourceKind, DatasourceRecord,
};
use crate::error::{Error, Result};
use crate::matching::{suggest_brands, Suggestion};
use crate::query::{BrandFilter, ConnectionArgs, ConnectionPage, PageRequest, RecordFilter};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::{Deserialize, Serialize};

const ADMIN_ACTOR: &str = "api";

fn parse_kind(kind: &str) -> Result<DatasourceKind> {
    kind.parse()
        .map_err(|_| Error::not_found(format!("datasource '{}'", kind)))
}

fn query<T>(extracted: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    extracted
        .map(|Query(q)| q)
        .map_err(|e| Error::invalid(e.body_text()))
}

fn body<T>(extracted: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    extracted
        .map(|Json(b)| b)
        .map_err(|e| Error::invalid(e.body_text()))
}

/// Record `id` if it belongs to provider `kind`
fn record_of_kind(conn: &rusqlite::Connection, kind: &str, id: i64) -> Result<DatasourceRecord> {
    let kind = parse_kind(kind)?;
    let record = get_record(conn, id)?;
    if record.kind != kind {
        return Err(Error::not_found(format!("{} record {}", kind, id)));
    }
    Ok(record)
}

// ============================================================================
// Service
// ============================================================================

/// GET /api/health - Health check
pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::ok("OK"))
}

#[derive(Serialize)]
pub struct KindInfo {
    code: &'static str,
    name: &'static str,
}

#[derive(Serialize)]
pub struct MetaResponse {
    version: &'static str,
    datasources: Vec<KindInfo>,
    calendar_url: Option<String>,
    page_size: usize,
    connection_max_limit: usize,
}

/// GET /api/meta
pub async fn meta(State(state): State<AppState>) -> Json<ApiResponse<MetaResponse>> {
    Json(ApiResponse::ok(MetaResponse {
        version: crate::VERSION,
        datasources: DatasourceKind::ALL
            .iter()
            .map(|k| KindInfo {
                code: k.code(),
                name: k.name(),
            })
            .collect(),
        calendar_url: state.settings.calendar_url.clone(),
        page_size: state.settings.page_size,
        connection_max_limit: state.settings.connection_max_limit,
    }))
}

#[derive(Serialize)]
pub struct KindStat {
    kind: DatasourceKind,
    total: usize,
    linked: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    total_records: usize,
    linked_records: usize,
    by_kind: Vec<KindStat>,
}

/// GET /api/stats - Record counts per provider
pub async fn stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let conn = state.conn();
    let by_kind: Vec<KindStat> = count_by_kind(&conn)?
        .into_iter()
        .map(|(kind, total, linked)| KindStat { kind, total, linked })
        .collect();

    Ok(Json(ApiResponse::ok(StatsResponse {
        total_records: by_kind.iter().map(|s| s.total).sum(),
        linked_records: by_kind.iter().map(|s| s.linked).sum(),
        by_kind,
    })))
}

// ============================================================================
// Brands
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct BrandsQuery {
    first: Option<usize>,
    after: Option<String>,
    search: Option<String>,
    country: Option<String>,
}

/// GET /api/brands - Relay-style connection over brands
pub async fn brands(
    State(state): State<AppState>,
    params: std::result::Result<Query<BrandsQuery>, QueryRejection>,
) -> ApiResult<ConnectionPage<Brand>> {
    let params = query(params)?;
    let filter = BrandFilter {
        search: params.search,
        country: params.country,
        has_records: None,
    };
    let args = ConnectionArgs {
        first: params.first,
        after: params.after,
    };

    let conn = state.conn();
    let page = brand_connection(&conn, &filter, &args, state.settings.connection_max_limit)?;
    Ok(Json(ApiResponse::ok(page)))
}

#[derive(Serialize)]
pub struct BrandDetail {
    #[serde(flatten)]
    brand: Brand,
    datasources: Vec<DatasourceRecord>,
}

/// GET /api/brands/:tag - Brand with its linked records
pub async fn brand_detail(State(state): State<AppState>, Path(tag): Path<String>) -> ApiResult<BrandDetail> {
    let conn = state.conn();
    let brand = get_brand_by_tag(&conn, &tag)?;
    let datasources = linked_records(&conn, brand.id)?;
    Ok(Json(ApiResponse::ok(BrandDetail { brand, datasources })))
}

/// GET /api/brands/duplicates - Brands sharing a tag stem
pub async fn duplicates(State(state): State<AppState>) -> ApiResult<Vec<DuplicateGroup>> {
    let conn = state.conn();
    Ok(Json(ApiResponse::ok(find_duplicates(&conn)?)))
}

// ============================================================================
// Datasources
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DatasourceQuery {
    page: Option<usize>,
    controlled: Option<bool>,
    linked: Option<bool>,
    regions: Option<bool>,
    country: Option<String>,
    search: Option<String>,
}

impl DatasourceQuery {
    /// Absolute path of `page` with the same filters
    fn page_url(&self, kind: DatasourceKind, page: usize) -> String {
        let mut params = vec![format!("page={}", page)];
        let flags = [
            ("controlled", self.controlled),
            ("linked", self.linked),
            ("regions", self.regions),
        ];
        for (name, value) in flags {
            if let Some(value) = value {
                params.push(format!("{}={}", name, value));
            }
        }
        if let Some(country) = &self.country {
            params.push(format!("country={}", urlencoding::encode(country)));
        }
        if let Some(search) = &self.search {
            params.push(format!("search={}", urlencoding::encode(search)));
        }
        format!("/api/datasources/{}?{}", kind, params.join("&"))
    }
}

#[derive(Serialize)]
pub struct PagedResponse<T> {
    count: usize,
    num_pages: usize,
    next: Option<String>,
    previous: Option<String>,
    results: Vec<T>,
}

/// GET /api/datasources/:kind - Page-number listing of one provider
pub async fn datasources(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    params: std::result::Result<Query<DatasourceQuery>, QueryRejection>,
) -> ApiResult<PagedResponse<DatasourceRecord>> {
    let kind = parse_kind(&kind)?;
    let params = query(params)?;
    let filter = RecordFilter {
        kind: Some(kind),
        controlled: params.controlled,
        linked: params.linked,
        has_regions: params.regions,
        country: params.country.clone(),
        search: params.search.clone(),
    };
    let request = PageRequest::new(params.page.unwrap_or(1), state.settings.page_size);

    let conn = state.conn();
    let page = list_records(&conn, &filter, &request)?;

    Ok(Json(ApiResponse::ok(PagedResponse {
        count: page.count,
        num_pages: page.num_pages,
        next: page.has_next().then(|| params.page_url(kind, page.page + 1)),
        previous: page.has_previous().then(|| params.page_url(kind, page.page - 1)),
        results: page.results,
    })))
}

/// GET /api/datasources/:kind/:id
pub async fn datasource_detail(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<DatasourceRecord> {
    let conn = state.conn();
    Ok(Json(ApiResponse::ok(record_of_kind(&conn, &kind, id)?)))
}

#[derive(Serialize)]
pub struct ControlResponse {
    #[serde(flatten)]
    summary: ControlSummary,
    controlled: Vec<DatasourceRecord>,
}

/// GET /api/datasources/:kind/:id/control - Who controls it, whom it controls
pub async fn datasource_control(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<ControlResponse> {
    let conn = state.conn();
    let record = record_of_kind(&conn, &kind, id)?;
    Ok(Json(ApiResponse::ok(ControlResponse {
        summary: control_summary(&conn, &record)?,
        controlled: controlled_orgs(&conn, &record)?,
    })))
}

/// GET /api/datasources/:kind/:id/suggestions - Candidate brands
pub async fn datasource_suggestions(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<Vec<Suggestion>> {
    let conn = state.conn();
    let record = record_of_kind(&conn, &kind, id)?;
    let brands = all_brands(&conn)?;
    Ok(Json(ApiResponse::ok(suggest_brands(&record, &brands))))
}

// ============================================================================
// Admin
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    brand: String,
}

/// POST /api/admin/records/:id/link
pub async fn link(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: std::result::Result<Json<LinkRequest>, JsonRejection>,
) -> ApiResult<DatasourceRecord> {
    let payload = body(payload)?;
    let conn = state.conn();
    let brand = get_brand_by_tag(&conn, &payload.brand)?;
    Ok(Json(ApiResponse::ok(link_record(&conn, id, brand.id, ADMIN_ACTOR)?)))
}

/// POST /api/admin/records/:id/unlink
pub async fn unlink(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<DatasourceRecord> {
    let conn = state.conn();
    Ok(Json(ApiResponse::ok(unlink_record(&conn, id, ADMIN_ACTOR)?)))
}

/// POST /api/admin/records/:id/create-brand
pub async fn create_brand_from_record(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Brand> {
    let conn = state.conn();
    Ok(Json(ApiResponse::ok(brand_from_record(&conn, id, ADMIN_ACTOR)?)))
}

/// PATCH /api/admin/records/:id - Change form, read-only fields enforced
pub async fn update_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: std::result::Result<Json<RecordChanges>, JsonRejection>,
) -> ApiResult<DatasourceRecord> {
    let changes = body(payload)?;
    let conn = state.conn();
    Ok(Json(ApiResponse::ok(apply_record_changes(&conn, id, &changes, ADMIN_ACTOR)?)))
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    ids: Vec<i64>,
}

#[derive(Serialize)]
pub struct BulkResponse {
    requested: usize,
    affected: usize,
}

/// POST /api/admin/records/bulk-delete
pub async fn bulk_delete(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BulkRequest>, JsonRejection>,
) -> ApiResult<BulkResponse> {
    let payload = body(payload)?;
    let conn = state.conn();
    let affected = bulk_delete_records(&conn, &payload.ids, state.settings.bulk_action_limit, ADMIN_ACTOR)?;
    Ok(Json(ApiResponse::ok(BulkResponse {
        requested: payload.ids.len(),
        affected,
    })))
}

/// POST /api/admin/records/bulk-unlink
pub async fn bulk_unlink(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BulkRequest>, JsonRejection>,
) -> ApiResult<BulkResponse> {
    let payload = body(payload)?;
    let conn = state.conn();
    let affected = bulk_unlink_records(&conn, &payload.ids, state.settings.bulk_action_limit, ADMIN_ACTOR)?;
    Ok(Json(ApiResponse::ok(BulkResponse {
        requested: payload.ids.len(),
        affected,
    })))
}
