//! Model transports.
//!
//! A transport sends one [`EncodedRequest`] and yields the raw `data:`
//! payloads of the response stream. It knows nothing about the wire protocol.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::EncodedRequest;

/// Raw SSE payloads, in arrival order.
pub type RawEventStream = BoxStream<'static, Result<String>>;

/// Opens streaming model calls.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Open the response stream. Fails with [`crate::error::AgentError::Aborted`]
    /// if `abort` fires before the response headers arrive.
    async fn open_stream(
        &self,
        request: &EncodedRequest,
        abort: &CancellationToken,
    ) -> Result<RawEventStream>;
}
