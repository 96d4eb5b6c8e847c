mod json;
pub use json::{JsonLayer, JsonService};
