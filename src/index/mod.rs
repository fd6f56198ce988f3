//! Key Index
//!
//! The index answers "where does the latest value of this key live" and
//! "which resident chunk has this id". Both maps sit behind their own lock,
//! always taken in the same order, so compaction of a chunk and lookups of
//! the keys inside it never interleave.

pub mod key_index;

pub use key_index::KeyIndex;

#[cfg(test)]
mod tests;
