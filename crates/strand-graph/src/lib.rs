//! strand-graph: schema-driven graph engine over a key-value store.
//!
//! Every read and write flows through a stamped [`Passport`], which carries
//! the schema and the caller's revocation set. Mutations are validated in
//! memory and committed as one batch; queries resolve a format tree against
//! the schema and post-process each section.

pub mod client;
pub mod format;
pub mod hash;
pub mod mutations;
pub mod passport;
pub mod pipeline;
pub mod queries;
pub mod response;

pub use client::{GraphClient, ListOptions, MemoryStorage, Storage, StorageError};
pub use mutations::{IdentityResolver, MutationRequest, MutationResponse, SertItem};
pub use passport::{Action, Passport, Revocation, Scope};
pub use queries::{QueryItem, QueryRequest, RequestCache};
pub use response::ResponsePair;
