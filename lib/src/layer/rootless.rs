//! The `user.rootlesscontainers` ownership-emulation xattr.
//!
//! Unprivileged extraction cannot chown, so the intended owner is recorded
//! on the inode in a protobuf-encoded xattr shared by other rootless
//! container tools. This is a persistent on-disk contract; the wire format
//! must not change. Field 1 is the uid, field 2 the gid, and the value
//! `u32::MAX` means "leave unchanged" (plain proto3 cannot distinguish 0
//! from absent, and 0 is a meaningful owner).

use anyhow::{Context, Result};
use prost::Message;

/// Name of the emulation xattr.
pub const ROOTLESS_XATTR: &str = "user.rootlesscontainers";

/// Sentinel meaning "this id is not overridden".
pub const NOOP_ID: u32 = u32::MAX;

#[derive(Clone, PartialEq, Message)]
struct Resource {
    #[prost(uint32, tag = "1")]
    uid: u32,
    #[prost(uint32, tag = "2")]
    gid: u32,
}

/// Encode an ownership override.
pub fn encode(uid: Option<u32>, gid: Option<u32>) -> Vec<u8> {
    Resource {
        uid: uid.unwrap_or(NOOP_ID),
        gid: gid.unwrap_or(NOOP_ID),
    }
    .encode_to_vec()
}

/// Decode an ownership override payload.
pub fn decode(buf: &[u8]) -> Result<(Option<u32>, Option<u32>)> {
    let r = Resource::decode(buf).context("decoding rootlesscontainers payload")?;
    let unwrap = |id: u32| (id != NOOP_ID).then_some(id);
    Ok((unwrap(r.uid), unwrap(r.gid)))
}
