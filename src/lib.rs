pub mod agent;
pub mod app;
pub mod call;
pub mod callrecord;
pub mod config;
pub mod event;
pub mod handler;
pub mod media;

/// Opaque carrier-assigned call identifier.
pub type CallId = String;
/// Identifier of the carrier's audio media session, distinct from the call itself.
pub type StreamId = String;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
