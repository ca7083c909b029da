pub mod models;
pub mod restore;
pub mod store;

// Re-export main types
pub use models::{Catalog, Media, MediaStatus, MediaType, ProfileKey, TransitionError};
pub use restore::RestoreScanner;
pub use store::{CatalogError, ProfileStore};
