pub mod catalog;
pub mod error;
pub mod intent;
pub mod models;

pub use catalog::{
    default_catalog, load_catalog_file, read_catalog_file, validate_catalog, CatalogReport,
};
pub use error::{CatalogError, ResolveError, SupportError};
pub use intent::{
    classify, detect_language, normalize_text, resolve_reply, unknown_reply, CONFIDENCE_THRESHOLD,
};
pub use models::*;
