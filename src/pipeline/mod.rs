//! Pipeline stages for turning a BOQ document into a priced table.
//!
//! Each submodule implements exactly one transformation step. The stages
//! only meet through plain data (`PageFragment`, `StitchedTable`,
//! `CostSheet`), so each is testable on its own and the network-facing ones
//! sit behind traits that tests replace with doubles.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ images ──▶ stitch ──▶ costing ──▶ tiers
//! (URL/path) (layout API) (HTTP GET) (merge)   (factors)   (catalog)
//!                 │           │         │
//!                 └───── markup (parse / splice) ─────┘
//! ```
//!
//! 1. [`input`]: canonicalise the user-supplied path or URL to bytes and
//!    detect PDF vs image
//! 2. [`extract`]: submit to the layout service, poll, collect per-page
//!    fragments; failed pages become non-fatal errors
//! 3. [`images`]: download every remote image reference with bounded
//!    concurrency and per-reference retry, then point the markup at the
//!    local copies
//! 4. [`stitch`]: merge per-page tables into one, dropping repeated
//!    headers and separator rows
//! 5. [`costing`]: apply cost factors row by row with a full breakdown
//! 6. [`tiers`]: cost the table three times against a product catalog
//!
//! [`markup`] is shared: it reads the service's HTML table markup into a
//! grid and writes it back after image references are rewritten.

pub mod costing;
pub mod extract;
pub mod images;
pub mod input;
pub mod markup;
pub mod stitch;
pub mod tiers;
