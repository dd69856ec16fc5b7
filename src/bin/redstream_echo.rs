//! redstream-echo: demo service
//!
//! Joins the consumer group and serves two patterns:
//! - `echo` (request): answers with the request payload
//! - `log` (event): logs the payload
//!
//! ## Configuration
//! - REDSTREAM_CONFIG: Path to a YAML options file (optional)
//! - REDSTREAM__URL, REDSTREAM__STREAM_PREFIX, ...: Option overrides
//! - REDSTREAM_LOG: Log filter (default: info)
//!
//! Runs until Ctrl-C, then closes the server.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};

use redstream::utils::bootstrap::init_tracing;
use redstream::utils::retry::{connection_backoff, is_retryable};
use redstream::{
    event_fn, request_fn, HandlerMap, StreamsOptions, StreamsServer, TransportError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let options = StreamsOptions::load(None)?;

    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler(
        "echo",
        request_fn(|data, ctx| async move {
            info!(id = %ctx.message_id(), "Echoing request");
            Ok(data)
        }),
    );
    handlers.add_event_handler(
        "log",
        event_fn(|data, ctx| async move {
            info!(stream = %ctx.stream(), id = %ctx.message_id(), payload = %data, "Event received");
            Ok(())
        }),
    );

    let server = StreamsServer::redis(options, handlers);
    let endpoint = server.options().url.clone();
    (|| server.connect())
        .retry(connection_backoff())
        .when(is_retryable)
        .notify(|err: &TransportError, dur: Duration| {
            warn!(endpoint = %endpoint, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    server.listen().await?;

    info!(
        prefix = %server.options().stream_prefix,
        group = %server.options().consumer_group,
        consumer = %server.options().consumer_name,
        "redstream-echo started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.close().await?;

    Ok(())
}
