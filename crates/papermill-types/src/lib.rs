//! Papermill Types
//!
//! Shared vocabulary of the ingestion pipeline:
//! - [`Item`] and its normalized [`ItemIdentifiers`]
//! - [`ExtractionTargetSet`] and its order-insensitive [`TargetHash`]
//! - [`ContentHash`], the blake3 digest behind every stable key
//!
//! # Example
//!
//! ```rust
//! use papermill_types::{ExtractionTarget, ExtractionTargetSet, Item, ItemMetadata};
//!
//! let item = Item::new(ItemMetadata::titled("Attention Is All You Need"))
//!     .with_provider_id("arxiv:1706.03762");
//! assert_eq!(item.key().unwrap().as_str(), "pid:arxiv:1706.03762");
//!
//! let targets = ExtractionTargetSet::new()
//!     .with_target(ExtractionTarget::new("datasets", "List datasets used"));
//! let hash = targets.hash();
//! assert_eq!(hash, targets.clone().hash());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod hash;
pub mod ident;
pub mod item;
pub mod target;

pub use hash::{ContentHash, HashError};
pub use ident::{normalize_doi, normalize_provider_id, normalize_title};
pub use item::{DocumentRef, Grouping, Item, ItemError, ItemIdentifiers, ItemKey, ItemMetadata};
pub use target::{ExtractionTarget, ExtractionTargetSet, TargetHash};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
