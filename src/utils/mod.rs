//! Shared utility functions for story-forge.

pub mod json_extraction;

pub use json_extraction::{extract_json_value, find_matching_brace, JsonExtractionError};
