//! Parsers for model output.
//!
//! Each parser is a small explicit grammar with a `Result<T, ParseError>`
//! contract and a best-effort repair pre-pass before strict validation.

pub mod json;
pub mod tags;
pub mod title;

pub use json::{Parsed, extract_json_candidate, parse_json, parse_json_strict, parse_json_value, repair_json};
pub use tags::{
    extract_all_tags, extract_fenced_blocks, extract_optional_tag, extract_tag, parse_index_list,
};
pub use title::{Heading, markdown_headings, parse_title, report_title};
