pub mod chunking;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod generation;
pub mod logging;
pub mod overview;
pub mod parse;
pub mod store;
pub mod tokens;
pub mod ui;
