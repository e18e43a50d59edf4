//! The transport layer: packet codec (spec.md §4.3) and post-pairing
//! session (spec.md §4.6). The byte-stuffed frame codec that sits beneath
//! both lives one level up, in `crate::framing`, since pairing also drives
//! it directly without a `Session`.

pub mod packet;
pub mod session;
