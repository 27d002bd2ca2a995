//! Per-request bookkeeping shared across the admission pipeline.

use std::time::Instant;
use uuid::Uuid;

/// Runtime context threaded through one request's lifetime, from admission to
/// the final usage row. Cheap to construct; one per inbound HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self { request_id: format!("req_{}", Uuid::new_v4()), started_at: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("req_"));
    }
}
