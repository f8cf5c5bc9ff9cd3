//! director-resolve — variables and links.
//!
//! Variables: every deploy pins one variable set. `((name))` placeholders
//! in the manifest resolve against that set, versioning values into it on
//! first use so a whole deploy sees consistent values.
//!
//! Links: jobs declare what they provide and consume. Providers and
//! consumers are collected into two flat lists and joined by an explicit
//! resolution step that yields immutable `Link` rows.

pub mod error;
pub mod generate;
pub mod links;
pub mod placeholder;
pub mod variables;

pub use error::{LinkFailure, LinkFailureKind, ResolveError, ResolveResult};
pub use links::{collect_intents, insert_path, lookup_path, InstanceAddress, LinkResolver, ResolvedLinks};
pub use placeholder::{interpolate, placeholders, Placeholder};
pub use variables::VariableResolver;
