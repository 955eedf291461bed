pub mod icons;
pub mod progress;

pub use progress::{CompactionUI, OverviewUI, format_ratio, status_line, styled_status};
