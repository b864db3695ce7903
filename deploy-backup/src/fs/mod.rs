//! File system helpers: tree walking, copying, permissions and scratch space.

pub mod metadata;
pub mod scratch;
pub mod walker;
