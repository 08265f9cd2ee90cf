//! Cost accounting for priced provider calls.
//!
//! - [`CostLedger`]: append-only record of priced calls for one stage, shared
//!   with the unit of work as a cheap clonable handle
//! - [`CategoryRules`]: ordered (pattern, category) rules mapping service
//!   names onto `gemini | tts | render | unknown`
//! - [`PricingTable`]: rates used by the ledger's convenience recorders
//! - [`CostRecorder`]: merges stage summaries into the per-run cost document

mod category;
mod document;
mod ledger;
mod pricing;

pub use category::{CategoryRule, CategoryRules, ServiceCategory};
pub use document::{CostRecorder, PipelineCostDocument};
pub use ledger::{CostEntry, CostLedger, CostSummary, ServiceCostBreakdown};
pub use pricing::PricingTable;
