//! Start-URL discovery: classification, sitemaps, and llms.txt files.
//!
//! Everything here is pure text processing. Fetching belongs to the
//! crawler; this crate only decides what a URL is and how to read what
//! came back.

pub mod classify;
pub mod llms;
pub mod sitemap;

pub use classify::{UrlKind, classify_url, is_llms_full, is_llms_index, is_sitemap, is_text_file};
pub use llms::{
    LlmsEntry, LlmsFullSection, LlmsIndex, LlmsSection, parse_llms_txt, section_url, slugify,
    split_llms_full,
};
pub use sitemap::{Sitemap, parse_sitemap, parse_sitemap_document};
