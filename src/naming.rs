//! Stream, reply-stream and consumer naming.
//!
//! Stream naming: `{prefix}:{canonical pattern}`
//! Reply streams: `{prefix}:reply:{client instance id}`

use uuid::Uuid;

/// Segment separating reply streams from pattern streams.
pub const REPLY_SEGMENT: &str = "reply";

/// Build the stream name for a canonical pattern.
pub fn stream_name(prefix: &str, canonical: &str) -> String {
    format!("{}:{}", prefix, canonical)
}

/// Recover the canonical pattern from a stream name.
///
/// Returns `None` if the stream does not carry `prefix`.
pub fn pattern_of<'a>(prefix: &str, stream: &'a str) -> Option<&'a str> {
    stream
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
}

/// Build the private reply stream name for a client instance.
pub fn reply_stream_name(prefix: &str, instance_id: &str) -> String {
    format!("{}:{}:{}", prefix, REPLY_SEGMENT, instance_id)
}

/// Process-unique consumer name.
pub fn default_consumer_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("consumer-{}-{}", std::process::id(), &suffix[..8])
}
