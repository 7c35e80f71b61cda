pub mod url_utils;

pub use url_utils::{
    asset_local_path, decode_entities, has_non_page_extension, normalize, page_filename,
    relative_from,
};

/// User agent sent on out-of-band HTTP requests so asset servers treat the
/// archiver like the browser that triggered the crawl.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";
