//! Cluster lock naming and the lock service interface.
//!
//! Lock resources are named by a fixed-width string: one type character,
//! six `0` pad characters, the block number as 16 hex digits, and the
//! generation as 8 hex digits.

use crate::fs::Filesystem;
use o2_error::{O2Error, Result};
use o2_ondisk::{Dinode, IncompatFeatures};
use serde::Serialize;
use std::fmt;
use tracing::trace;

const PAD: &str = "000000";

/// Length of an encoded lock name.
pub const LOCK_NAME_LEN: usize = 1 + PAD.len() + 16 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Meta,
    Data,
    Super,
    Rename,
    Rw,
}

impl LockType {
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Meta => 'M',
            Self::Data => 'D',
            Self::Super => 'S',
            Self::Rename => 'R',
            Self::Rw => 'W',
        }
    }

    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'M' => Some(Self::Meta),
            'D' => Some(Self::Data),
            'S' => Some(Self::Super),
            'R' => Some(Self::Rename),
            'W' => Some(Self::Rw),
            _ => None,
        }
    }
}

/// A named lock resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockResource {
    pub kind: LockType,
    pub blkno: u64,
    pub generation: u32,
}

impl LockResource {
    /// Build a resource, dropping fields the lock type does not use.
    #[must_use]
    pub fn new(kind: LockType, blkno: u64, generation: u32) -> Self {
        let (blkno, generation) = match kind {
            LockType::Super => (blkno, 0),
            LockType::Rename => (0, 0),
            LockType::Meta | LockType::Data | LockType::Rw => (blkno, generation),
        };
        Self {
            kind,
            blkno,
            generation,
        }
    }

    /// The volume-wide superblock lock.
    #[must_use]
    pub fn superblock(blkno: u64) -> Self {
        Self::new(LockType::Super, blkno, 0)
    }

    /// Metadata lock for one inode.
    #[must_use]
    pub fn meta(inode: &Dinode) -> Self {
        Self::new(LockType::Meta, inode.blkno, inode.generation)
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}{PAD}{:016x}{:08x}",
            self.kind.as_char(),
            self.blkno,
            self.generation
        )
    }

    pub fn decode(name: &str) -> Result<Self> {
        let invalid = |why: &str| O2Error::InvalidArgument(format!("lock name {name:?}: {why}"));
        if name.len() != LOCK_NAME_LEN || !name.is_ascii() {
            return Err(invalid("wrong length"));
        }
        let kind = name
            .chars()
            .next()
            .and_then(LockType::from_char)
            .ok_or_else(|| invalid("unknown lock type"))?;
        if &name[1..=PAD.len()] != PAD {
            return Err(invalid("bad padding"));
        }
        let blkno_at = 1 + PAD.len();
        let blkno = u64::from_str_radix(&name[blkno_at..blkno_at + 16], 16)
            .map_err(|_| invalid("bad block number"))?;
        let generation = u32::from_str_radix(&name[blkno_at + 16..], 16)
            .map_err(|_| invalid("bad generation"))?;
        Ok(Self {
            kind,
            blkno,
            generation,
        })
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ── Lock service ────────────────────────────────────────────────────────────

/// A distributed lock manager.
///
/// `acquire` may block; a lock that cannot be granted is reported as
/// `LockUnavailable` and passed through unchanged by the helpers below.
pub trait ClusterLock: Send + Sync {
    fn acquire(&self, resource: &LockResource, level: LockLevel) -> Result<()>;
    fn release(&self, resource: &LockResource, level: LockLevel) -> Result<()>;
}

/// Lock service for local-mount volumes, where no other node exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLock;

impl ClusterLock for LocalLock {
    fn acquire(&self, resource: &LockResource, level: LockLevel) -> Result<()> {
        trace!(lock = %resource, ?level, "local_lock_acquire");
        Ok(())
    }

    fn release(&self, resource: &LockResource, level: LockLevel) -> Result<()> {
        trace!(lock = %resource, ?level, "local_lock_release");
        Ok(())
    }
}

/// Run `body` under `resource`, releasing on every exit path. An error
/// from `body` takes precedence over a release failure.
pub fn with_lock<T, F>(
    locks: &dyn ClusterLock,
    resource: &LockResource,
    level: LockLevel,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    locks.acquire(resource, level)?;
    let result = body();
    let released = locks.release(resource, level);
    let value = result?;
    released?;
    Ok(value)
}

impl Filesystem {
    /// Whether this volume is mounted by one node only.
    #[must_use]
    pub fn is_local_mount(&self) -> bool {
        self.superblock()
            .feature_incompat
            .contains(IncompatFeatures::LOCAL_MOUNT)
    }

    /// Run `body` holding the superblock lock.
    pub fn with_super_lock<T, F>(&self, locks: &dyn ClusterLock, level: LockLevel, body: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let resource = LockResource::superblock(self.super_inode().blkno);
        with_lock(locks, &resource, level, || body(self))
    }

    /// Run `body` holding the metadata lock of the inode at `blkno`.
    pub fn with_meta_lock<T, F>(
        &self,
        locks: &dyn ClusterLock,
        blkno: u64,
        level: LockLevel,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let inode = self.read_inode(blkno)?;
        let resource = LockResource::meta(&inode);
        with_lock(locks, &resource, level, || body(self))
    }
}
