pub mod json;
mod text;

pub use json::{create_report, print_json, write_json};
pub use text::{print_check_results, print_summary};
