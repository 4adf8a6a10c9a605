//! Provider stream decoding.

pub mod accumulator;

pub use accumulator::StreamEventAccumulator;

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::WireProtocolAdapter;
use crate::types::{StreamEvent, Usage};

/// Pairs a protocol adapter with an accumulator for one model turn.
pub struct StreamDecoder {
    adapter: Arc<dyn WireProtocolAdapter>,
    accumulator: StreamEventAccumulator,
}

impl StreamDecoder {
    pub fn new(adapter: Arc<dyn WireProtocolAdapter>) -> Self {
        Self {
            adapter,
            accumulator: StreamEventAccumulator::new(),
        }
    }

    /// Decode one raw SSE payload.
    pub fn decode(&mut self, raw: &str) -> Result<Vec<StreamEvent>> {
        let deltas = self.adapter.decode_stream_event(raw)?;
        let mut events = Vec::new();
        for delta in deltas {
            events.extend(self.accumulator.push(delta));
        }
        Ok(events)
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.accumulator.finish()
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        self.accumulator.fail(message)
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.accumulator.continuation_token()
    }

    pub fn usage(&self) -> Usage {
        self.accumulator.usage()
    }
}
