//! Wire format for Kith envelopes, signaling packets and contact invites.
//!
//! Messages are declared with `prost` derives rather than generated from a
//! `.proto` file, so the crate has no build step. Field tags are part of the
//! wire contract and must never be reused.

#![forbid(unsafe_code)]

pub mod v1;
pub mod validation;

#[cfg(test)]
mod proptests;
