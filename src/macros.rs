//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for fields of the persistent layout
//! structs. Scalars are stored as zerocopy little-endian wrappers and links
//! are stored as [`PmemOid`](crate::storage::PmemOid), so both kinds are
//! supported:
//!
//! ```ignore
//! impl RootMetadata {
//!     zerocopy_accessors! {
//!         resident_head: oid,
//!         resident_count: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn resident_head(&self) -> PmemOid { self.resident_head }
//! // pub fn set_resident_head(&mut self, val: PmemOid) { self.resident_head = val; }
//! // pub fn resident_count(&self) -> u64 { self.resident_count.get() }
//! // pub fn set_resident_count(&mut self, val: u64) { self.resident_count = U64::new(val); }
//! ```

/// Generates getter and setter methods for persistent layout fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    (@impl $field:ident, oid) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> $crate::storage::PmemOid {
                self.$field
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: $crate::storage::PmemOid) {
                self.$field = val;
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
