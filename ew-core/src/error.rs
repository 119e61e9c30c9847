//! Error types, re-exported from `ew-error` so core users need one import

pub use ew_error::{DecodeError, EmberwatchError, Result};
