//! # pmkv Configuration Module
//!
//! This module centralizes the layout constants of a pmkv pool. The on-media
//! layout is a compatibility contract: every region offset below is baked into
//! pool files written by earlier runs, so interdependent values are co-located
//! and checked at compile time.
//!
//! Runtime knobs (pool path, pool size, memory limit, eviction policy) are not
//! constants; they live on [`crate::tier::StoreBuilder`].
//!
//! ## Module Organization
//!
//! - [`constants`]: Region offsets, allocator size classes, node geometry

pub mod constants;
pub use constants::*;
