//! Input validation helpers.

pub mod sfid;

pub use sfid::{is_valid_id, to_18};
