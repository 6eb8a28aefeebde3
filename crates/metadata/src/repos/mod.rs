//! Repository traits for metadata operations.

pub mod activity;
pub mod files;
pub mod users;

pub use activity::ActivityRepo;
pub use files::{BlobHook, FileRepo, LinkOutcome, MAX_TAGS, PhysicalInsert, Reclaimed, Unlinked};
pub use users::UserRepo;
