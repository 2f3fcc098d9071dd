// Bankgreen - Core Library
// Bank catalog shared by the CLI, the API server and the tests

pub mod admin;
pub mod brand;
pub mod config;
pub mod control;
pub mod datasource;
pub mod db;
pub mod error;
pub mod import;
pub mod logging;
pub mod matching;
pub mod query;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use admin::{
    apply_record_changes, brand_choices, brand_changelist, bulk_delete_records, bulk_unlink_records,
    datasource_changelist, Changelist, ChangelistRow, ModelAdmin, RecordChanges, BRAND_ADMIN,
    DATASOURCE_ADMIN,
};
pub use brand::{
    create_brand, create_brand_from_record, delete_brand, find_duplicates, get_brand, get_brand_by_tag,
    list_brands, slugify, tag_stem, update_brand, Brand, BrandChanges, DuplicateGroup, NewBrand,
};
pub use config::Settings;
pub use control::{control_summary, controlled_orgs, controlling_orgs, ControlSummary, ControllerRef};
pub use datasource::{
    get_record, link_record, list_records, unlink_record, upsert_records, Control, DatasourceKind,
    DatasourceRecord, Identifiers, ImportStats, RecordInput,
};
pub use db::{get_events_for_entity, open_database, open_in_memory, setup_database, Event};
pub use error::{Error, Result};
pub use import::{import_csv, load_csv};
pub use matching::{auto_link, suggest_brands, AutoLinkReport, Suggestion, LEV_DISTANCE};
pub use query::{BrandFilter, ConnectionArgs, ConnectionPage, Page, PageRequest, RecordFilter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
