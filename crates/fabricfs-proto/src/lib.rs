//! Generated CSI v1 protocol types and service stubs.
//!
//! The wire definitions live in `proto/csi.proto` and are compiled by
//! `tonic-build`; this crate only re-exports the generated module.

/// CSI v1 messages, the `Controller` service trait and client.
pub mod v1 {
    #![allow(clippy::large_enum_variant)]

    tonic::include_proto!("csi.v1");
}
