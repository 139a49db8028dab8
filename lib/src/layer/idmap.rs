//! uid/gid translation between container and host views.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A single contiguous id mapping range, `container:host:size` on the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids in the range.
    pub size: u32,
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::invalid(format!("invalid id mapping {s:?} (want container:host:size)"));
        let mut parts = s.split(':');
        let mut next = || -> Result<u32, Error> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())
        };
        let mapping = IdMapping {
            container_id: next()?,
            host_id: next()?,
            size: next()?,
        };
        if parts.next().is_some() || mapping.size == 0 {
            return Err(invalid());
        }
        Ok(mapping)
    }
}

fn translate(mappings: &[IdMapping], id: u32, from_container: bool) -> Option<u32> {
    if mappings.is_empty() {
        // No configured mapping means identity.
        return Some(id);
    }
    for m in mappings {
        let (base, other) = if from_container {
            (m.container_id, m.host_id)
        } else {
            (m.host_id, m.container_id)
        };
        if id >= base && id - base < m.size {
            return Some(other + (id - base));
        }
    }
    None
}

/// How tar-entry ownership translates to and from the host, plus whether
/// we are running without privileges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapOptions {
    /// uid ranges.
    pub uid_mappings: Vec<IdMapping>,
    /// gid ranges.
    pub gid_mappings: Vec<IdMapping>,
    /// Unprivileged mode: ownership and device nodes are emulated rather
    /// than applied.
    pub rootless: bool,
}

impl MapOptions {
    /// Map a container uid to the host.
    pub fn uid_to_host(&self, uid: u32) -> Result<u32> {
        translate(&self.uid_mappings, uid, true)
            .ok_or_else(|| Error::invalid(format!("unmapped uid {uid}")).into())
    }

    /// Map a container gid to the host.
    pub fn gid_to_host(&self, gid: u32) -> Result<u32> {
        translate(&self.gid_mappings, gid, true)
            .ok_or_else(|| Error::invalid(format!("unmapped gid {gid}")).into())
    }

    /// Map a host uid back to the container.
    pub fn uid_to_container(&self, uid: u32) -> Result<u32> {
        translate(&self.uid_mappings, uid, false)
            .ok_or_else(|| Error::invalid(format!("unmapped host uid {uid}")).into())
    }

    /// Map a host gid back to the container.
    pub fn gid_to_container(&self, gid: u32) -> Result<u32> {
        translate(&self.gid_mappings, gid, false)
            .ok_or_else(|| Error::invalid(format!("unmapped host gid {gid}")).into())
    }
}
