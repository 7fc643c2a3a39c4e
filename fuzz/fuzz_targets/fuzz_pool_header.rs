//! Fuzz testing for pool header validation.
//!
//! Feeds arbitrary bytes to `PoolHeader::from_bytes`, which guards every
//! pool open. Malformed input must be rejected with an error, never a panic,
//! and anything accepted must describe the fixed region layout.

#![no_main]

use libfuzzer_sys::fuzz_target;

use pmkv::config::{HEAP_START, POOL_VERSION};
use pmkv::storage::headers::PoolHeader;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = PoolHeader::from_bytes(data) {
        assert_eq!(header.heap_start(), HEAP_START);
        assert_eq!(header.version(), POOL_VERSION);
    }
});
