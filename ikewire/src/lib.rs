//! # ikewire
//!
//! Wire-format definitions, parser and generator for IKEv2 as specified
//! in RFC 7296, with message fragmentation support from RFC 7383.
//!
//! The crate is strictly a codec: it converts byte buffers into a typed
//! object graph and back. It performs no I/O and no cryptography; the
//! encrypted payload body is carried as opaque bytes for a higher layer
//! to seal or open.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod defs;
pub mod generator;
pub mod parser;

pub use zerocopy;

/// Constant value for the version field of the IKE header, as
/// `<major>.<minor>` in 4 bits each, where the major is 2 and the minor
/// is zero.
pub const IKE_VERSION_VALUE: u8 = 0b0010_0000;

/// Fixed size of the IKE header in octets
pub const IKE_HEADER_SIZE: usize = 28;

/// Fixed size of the non-ESP marker prepended to IKE datagrams on the
/// NAT traversal port (RFC 3948, section 2.2)
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

#[cfg(test)]
mod tests;
