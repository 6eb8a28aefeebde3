pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{blob_key, seeded_bytes, sha256_hash};
