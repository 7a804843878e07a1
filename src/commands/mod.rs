//! External interface boundary.
//!
//! Each operation takes the caller's JSON payload (tolerating legacy string
//! arguments and snake_case aliases), validates it into a typed shape, and
//! delegates to the service modules. Missing or malformed required fields
//! are rejected here rather than defaulted silently.

pub mod dayclose;
pub mod sessions;
pub mod settlement;
