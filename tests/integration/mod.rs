//! Integration tests for wg-stream
//!
//! These exercise the stream bind and codec against real localhost sockets
//! and the supervisor wiring end to end.

mod codec_stream;
mod stream_bind;
mod supervision;

use std::sync::Once;

static INIT_TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
