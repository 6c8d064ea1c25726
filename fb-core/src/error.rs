//! Error types re-exported from the fb-error crate

pub use fb_error::{FanbindError, Result};
