//! director-changeset — structural diff of YAML-like trees.
//!
//! Two documents are walked side by side and rendered as indented,
//! YAML-like lines. Each line is marked added, removed, or left as
//! context. Arrays of hashes are matched by `name` (or `range` for
//! subnets), so reordering alone never shows up as a change.

pub mod diff;
pub mod redact;
pub mod render;
pub mod summary;

pub use diff::{Changeset, Line, Status};
pub use redact::{is_sensitive_key, redact_properties, REDACTED};
pub use render::render;
pub use summary::{render_summary, summarize, SectionSummary};
