// Upspin cacheserver.
//! Directory entries and the blocks that make up their content.
//!
//! These mirror the wire format used by upstream DirServers; the cache
//! never originates a `DirEntry`'s signed content, it only stores and
//! replays entries it received from upstream or from the local client's
//! own successful mutations (spec 8, "No forgery").

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::path::PathName;

/// Per-block packdata validated by the block cache on every `Get`.
///
/// For integrity-checked packings this carries the SHA-256 of the block
/// ciphertext (spec 3). Other packings may carry no usable digest, in which
/// case the cache cannot verify content and simply trusts the upstream read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockPackdata {
    /// SHA-256 of the packed (ciphertext) block contents.
    Sha256([u8; 32]),
    /// No per-block digest is available (e.g. the `plain` packer).
    None,
}

/// `(location, offset, size, per-block packdata)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    pub location: crate::endpoint::Location,
    pub offset: u64,
    pub size: u64,
    pub packdata: BlockPackdata,
}

/// The kind of object a `DirEntry` describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attr {
    None,
    Directory,
    Link,
    Incomplete,
}

/// `(name, signed-name, writer, packing, time, sequence, attr, link-target,
/// blocks[], whole-entry packdata)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: PathName,
    /// The name under which this entry's signature was computed. Equal to
    /// `name` unless the entry was renamed after signing.
    pub signed_name: PathName,
    pub writer: crate::path::UserName,
    pub packing: u8,
    pub time: i64,
    pub sequence: u64,
    pub attr: Attr,
    pub link_target: Option<PathName>,
    pub blocks: Vec<DirBlock>,
    pub packdata: Vec<u8>,
}

impl DirEntry {
    /// Validate the structural invariants spec 3 places on a `DirEntry`.
    ///
    /// A directory has no blocks; a link has no blocks and a non-empty
    /// link target; blocks must tile a contiguous byte range starting at
    /// zero. Violation is a fatal invalid-entry error -- never silently
    /// repaired.
    pub fn validate(&self) -> Result<()> {
        match self.attr {
            Attr::Directory => {
                if !self.blocks.is_empty() {
                    return Err(Error::InvalidEntry {
                        name: self.name.clone(),
                        reason: "directory entry has blocks".to_string(),
                    });
                }
            }
            Attr::Link => {
                if !self.blocks.is_empty() {
                    return Err(Error::InvalidEntry {
                        name: self.name.clone(),
                        reason: "link entry has blocks".to_string(),
                    });
                }
                if self.link_target.is_none() {
                    return Err(Error::InvalidEntry {
                        name: self.name.clone(),
                        reason: "link entry has no target".to_string(),
                    });
                }
            }
            Attr::None | Attr::Incomplete => {}
        }
        let mut expect_offset = 0u64;
        for block in &self.blocks {
            if block.offset != expect_offset {
                return Err(Error::InvalidEntry {
                    name: self.name.clone(),
                    reason: format!(
                        "block offset {} does not follow prior blocks (expected {})",
                        block.offset, expect_offset
                    ),
                });
            }
            expect_offset += block.size;
        }
        Ok(())
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.attr, Attr::Directory)
    }

    pub fn is_link(&self) -> bool {
        matches!(self.attr, Attr::Link)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoint::{Endpoint, Location};
    use crate::path::UserName;

    fn name(s: &str) -> PathName {
        PathName::parse(s).unwrap()
    }

    fn block(offset: u64, size: u64) -> DirBlock {
        DirBlock {
            location: Location::new(Endpoint::remote("s:1"), "ref"),
            offset,
            size,
            packdata: BlockPackdata::None,
        }
    }

    fn base_entry(attr: Attr, blocks: Vec<DirBlock>) -> DirEntry {
        let n = name("alice@example.com/f");
        DirEntry {
            name: n.clone(),
            signed_name: n,
            writer: UserName::new("alice@example.com"),
            packing: 0,
            time: 0,
            sequence: 1,
            attr,
            link_target: None,
            blocks,
            packdata: vec![],
        }
    }

    #[test]
    fn directory_with_blocks_is_invalid() {
        let e = base_entry(Attr::Directory, vec![block(0, 4)]);
        assert!(e.validate().is_err());
    }

    #[test]
    fn blocks_must_tile_contiguously() {
        let e = base_entry(Attr::None, vec![block(0, 4), block(10, 4)]);
        assert!(e.validate().is_err());
        let e = base_entry(Attr::None, vec![block(0, 4), block(4, 4)]);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn first_block_must_start_at_zero() {
        let e = base_entry(Attr::None, vec![block(4, 4)]);
        assert!(e.validate().is_err());
    }

    #[test]
    fn link_without_target_is_invalid() {
        let mut e = base_entry(Attr::Link, vec![]);
        e.link_target = None;
        assert!(e.validate().is_err());
        e.link_target = Some(name("alice@example.com/target"));
        assert!(e.validate().is_ok());
    }
}
