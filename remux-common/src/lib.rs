pub mod config;
pub mod encoding;
pub mod model;
pub mod time;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Like `Display`, but guaranteed not to leak internal details (connection
/// strings, file paths of other users, raw database errors) into strings
/// that are returned to API clients.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}
