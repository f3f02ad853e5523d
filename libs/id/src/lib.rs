//! # stevedore-id
//!
//! Identifier types for the stevedore control plane.
//!
//! Two families of identifiers exist:
//!
//! - **System IDs** for immutable records (builds, configs, releases,
//!   containers) use a prefixed ULID format: `{prefix}_{ulid}`, e.g.
//!   `rel_01HV4Z3MXNKPQR9HSTZ7WCLD4E`. They are typed so a `BuildId` can
//!   never be passed where a `ConfigId` is expected.
//! - **App IDs** are user-facing slugs (`[a-z0-9-]+`), either chosen by the
//!   caller or generated as a random `adjective-noun` pair.
//!
//! Release versions are a separate sequence newtype starting at `v1`.

mod app;
mod error;
mod macros;
mod types;

pub use app::{AppId, RESERVED_APP_IDS};
pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
