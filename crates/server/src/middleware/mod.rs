pub mod auth;

pub use auth::{extract_user_from_headers, CurrentUser};
