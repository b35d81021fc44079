// =============================================================================
// Learning pipeline — two tiers of post-trade adaptation
// =============================================================================
//
// Tier 1 (`quick_update`) runs synchronously inside the tick path after every
// exit: coin score + pattern confidence, nothing else. Tier 2 runs on the
// slow loops: `reflection` asks the LLM to analyse the journal, `adaptation`
// turns high-confidence insights into concrete knowledge mutations, and
// `effectiveness` measures each mutation after the fact and drives rollback.
// =============================================================================

pub mod adaptation;
pub mod effectiveness;
pub mod quick_update;
pub mod reflection;
