//! # Notebook Sync Core
//!
//! Store-agnostic logic for keeping a notebook's three stores consistent:
//! fingerprints, change classification, leader-wins reconciliation, and
//! address routing between local notes and the public sphere.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete stores
//! plug in through the traits in [`store`].

pub mod address;
pub mod change;
pub mod fingerprint;
pub mod memo;
pub mod reconcile;
pub mod router;
pub mod slug;
pub mod store;

pub use address::{Address, Audience};
pub use change::{calc_changes, Change, ChangeError, ChangeStatus};
pub use fingerprint::Fingerprint;
pub use memo::Memo;
pub use reconcile::{reconcile, Follower, ReconcileReport};
pub use router::{AddressRouter, RouterError};
pub use slug::{Slug, SlugError};
