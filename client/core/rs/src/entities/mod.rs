pub mod config;
pub mod entity;
pub mod external_key;
pub mod logger;
pub mod server;
pub mod sync_request;

/// Unix timestamp in milliseconds.
pub type I64 = i64;

/// Timestamp in milliseconds as used across all Keywarden entities.
pub fn keywarden_timestamp() -> I64 {
  chrono::Utc::now().timestamp_millis()
}

/// Convert an empty string to None, all other strings to Some.
pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() { None } else { Some(string) }
}
