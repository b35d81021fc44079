// =============================================================================
// Dashboard API — JSON endpoints plus the SSE feed
// =============================================================================

pub mod rest;
pub mod sse;
