#![forbid(unsafe_code)]
//! JBD2 journal block scanner.
//!
//! Classifies every block of a slot's journal file: block 0 is the journal
//! superblock; later blocks are journal metadata (magic-tagged), filesystem
//! metadata written into the log (recognized by block-type signature), or
//! unknown. Consecutive unknown blocks are reported as one inclusive run.
//!
//! [`JournalScanner`] is a pure state machine fed with block-aligned chunks;
//! [`scan_journal`] drives it over a journal inode's extent map.

use o2_block::BlockDevice;
use o2_error::{O2Error, Result};
use o2_extent::for_each_run;
use o2_ondisk::features::JournalIncompat;
use o2_ondisk::{
    BlockType, DescriptorTag, Dinode, InodePayload, JournalBlockType, JournalHeader,
    JournalSuperblock, detect_block, parse_descriptor_tags, parse_revoke_records,
};
use o2_types::{BlockNumber, Geometry};
use serde::Serialize;
use std::ops::ControlFlow;
use tracing::{debug, trace};

/// Bytes read from the journal file per device request.
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

/// One classified block or run. Block numbers are journal-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanEvent {
    Superblock {
        block: u64,
        superblock: JournalSuperblock,
    },
    Journal {
        block: u64,
        header: JournalHeader,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tags: Vec<DescriptorTag>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        revoked: Vec<u64>,
    },
    Metadata {
        block: u64,
        block_type: BlockType,
    },
    /// Blocks `first..=last` matched nothing.
    Unknown { first: u64, last: u64 },
}

/// Block counts by classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub blocks: u64,
    pub journal_blocks: u64,
    pub metadata_blocks: u64,
    pub unknown_blocks: u64,
}

/// Incremental journal stream classifier.
#[derive(Debug, Clone)]
pub struct JournalScanner {
    block_size: usize,
    next_block: u64,
    pending_unknown: Option<u64>,
    incompat: JournalIncompat,
    summary: ScanSummary,
}

impl JournalScanner {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            next_block: 0,
            pending_unknown: None,
            incompat: JournalIncompat(0),
            summary: ScanSummary::default(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> ScanSummary {
        self.summary
    }

    fn flush_unknown(&mut self, events: &mut Vec<ScanEvent>) {
        if let Some(first) = self.pending_unknown.take() {
            let last = self.next_block - 1;
            self.summary.unknown_blocks += last - first + 1;
            events.push(ScanEvent::Unknown { first, last });
        }
    }

    /// Classify the blocks in `chunk`, which must be a whole number of
    /// blocks and continue where the previous chunk stopped.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ScanEvent>> {
        if self.block_size == 0 || chunk.len() % self.block_size != 0 {
            return Err(O2Error::InvalidArgument(format!(
                "journal chunk of {} bytes is not a multiple of the {}-byte block size",
                chunk.len(),
                self.block_size
            )));
        }
        let mut events = Vec::new();
        for block in chunk.chunks_exact(self.block_size) {
            self.classify(block, &mut events)?;
            self.next_block += 1;
            self.summary.blocks += 1;
        }
        Ok(events)
    }

    fn classify(&mut self, block: &[u8], events: &mut Vec<ScanEvent>) -> Result<()> {
        let at = self.next_block;
        if at == 0 {
            let superblock = JournalSuperblock::parse(block)
                .map_err(|err| O2Error::Parse(format!("journal superblock: {err}")))?;
            self.incompat = superblock.feature_incompat;
            self.summary.journal_blocks += 1;
            events.push(ScanEvent::Superblock { block: 0, superblock });
            return Ok(());
        }

        let header = JournalHeader::parse(block).map_err(|err| O2Error::Parse(err.to_string()))?;
        if let Some(header) = header {
            self.flush_unknown(events);
            let (tags, revoked) = match header.blocktype {
                JournalBlockType::Descriptor => (
                    parse_descriptor_tags(block, self.incompat).unwrap_or_default(),
                    Vec::new(),
                ),
                JournalBlockType::Revoke => (
                    Vec::new(),
                    parse_revoke_records(block, self.incompat).unwrap_or_default(),
                ),
                _ => (Vec::new(), Vec::new()),
            };
            trace!(block = at, kind = %header.blocktype, seq = header.sequence, "journal_block");
            self.summary.journal_blocks += 1;
            events.push(ScanEvent::Journal {
                block: at,
                header,
                tags,
                revoked,
            });
            return Ok(());
        }

        match detect_block(block) {
            BlockType::Unknown => {
                self.pending_unknown.get_or_insert(at);
            }
            block_type => {
                self.flush_unknown(events);
                self.summary.metadata_blocks += 1;
                events.push(ScanEvent::Metadata { block: at, block_type });
            }
        }
        Ok(())
    }

    /// Report any unknown run still open at the end of the stream.
    pub fn finish(&mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        self.flush_unknown(&mut events);
        events
    }
}

/// Scan the journal file owned by `inode`, reading `chunk_bytes` at a time.
///
/// Holes and unwritten extents read as zero blocks, which classify as
/// unknown. The visitor may stop the scan early.
pub fn scan_journal<F>(
    dev: &dyn BlockDevice,
    geom: Geometry,
    inode: &Dinode,
    chunk_bytes: usize,
    mut visitor: F,
) -> Result<ScanSummary>
where
    F: FnMut(ScanEvent) -> Result<ControlFlow<()>>,
{
    let InodePayload::Extents(root) = &inode.id2 else {
        return Err(O2Error::InvalidArgument(format!(
            "journal inode {} has no extent map",
            inode.blkno
        )));
    };
    let bs = geom.block_len();
    let total = inode.size.div_ceil(u64::from(geom.block_size()));
    let chunk_blocks = u64::try_from((chunk_bytes / bs).max(1)).unwrap_or(1);
    let mut scanner = JournalScanner::new(bs);
    let mut cursor = 0_u64;
    let mut stopped = false;

    let mut deliver = |scanner: &mut JournalScanner, buf: &[u8]| -> Result<ControlFlow<()>> {
        for event in scanner.feed(buf)? {
            if visitor(event)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    };

    // Feed `count` blocks starting at the device block `physical`, or zero
    // blocks when `physical` is None.
    let mut pump = |scanner: &mut JournalScanner, physical: Option<u64>, count: u64| -> Result<ControlFlow<()>> {
        let mut done = 0;
        while done < count {
            let n = chunk_blocks.min(count - done);
            let len = usize::try_from(n).unwrap_or(usize::MAX) * bs;
            let mut buf = vec![0_u8; len];
            if let Some(start) = physical {
                dev.read_blocks(BlockNumber(start + done), &mut buf)?;
            }
            if deliver(scanner, &buf)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            done += n;
        }
        Ok(ControlFlow::Continue(()))
    };

    let flow = for_each_run(dev, geom, root, inode.blkno, |run| {
        if run.logical_block >= total {
            return Ok(ControlFlow::Break(()));
        }
        if run.logical_block > cursor
            && pump(&mut scanner, None, run.logical_block - cursor)?.is_break()
        {
            stopped = true;
            return Ok(ControlFlow::Break(()));
        }
        let blocks = run.blocks.min(total - run.logical_block);
        let physical = (!run.unwritten).then_some(run.physical_block);
        if pump(&mut scanner, physical, blocks)?.is_break() {
            stopped = true;
            return Ok(ControlFlow::Break(()));
        }
        cursor = run.logical_block + blocks;
        Ok(ControlFlow::Continue(()))
    })?;

    let stopped = (flow.is_break() && stopped)
        || (cursor < total && pump(&mut scanner, None, total - cursor)?.is_break());
    if !stopped {
        for event in scanner.finish() {
            if visitor(event)?.is_break() {
                break;
            }
        }
    }
    let summary = scanner.summary();
    debug!(
        inode = inode.blkno,
        blocks = summary.blocks,
        journal = summary.journal_blocks,
        metadata = summary.metadata_blocks,
        unknown = summary.unknown_blocks,
        "journal_scan"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use o2_block::{ByteBlockDevice, MemoryByteDevice};
    use o2_ondisk::extent::{ExtentList, ExtentRec};
    use o2_ondisk::features::{JournalCompat, JournalRoCompat};
    use o2_ondisk::inode::{INODE_SIGNATURE, signature8};
    use o2_ondisk::{InodeFlags, new_dinode};

    const BS: usize = 512;

    fn superblock_block() -> Vec<u8> {
        let mut block = vec![0_u8; BS];
        JournalSuperblock {
            header: JournalHeader {
                blocktype: JournalBlockType::SuperblockV2,
                sequence: 0,
            },
            blocksize: 512,
            maxlen: 64,
            first: 1,
            sequence: 9,
            start: 0,
            errno: 0,
            feature_compat: JournalCompat(0),
            feature_incompat: JournalIncompat::REVOKE,
            feature_ro_compat: JournalRoCompat(0),
            uuid: [7; 16],
            nr_users: 1,
        }
        .encode_into(&mut block)
        .expect("encode superblock");
        block
    }

    fn journal_block(kind: JournalBlockType, seq: u32) -> Vec<u8> {
        let mut block = vec![0_u8; BS];
        JournalHeader {
            blocktype: kind,
            sequence: seq,
        }
        .encode_into(&mut block)
        .expect("encode header");
        block
    }

    fn descriptor_block() -> Vec<u8> {
        let mut block = journal_block(JournalBlockType::Descriptor, 10);
        // One tag for block 77, same uuid, last.
        block[12..16].copy_from_slice(&77_u32.to_be_bytes());
        block[16..20].copy_from_slice(&(0x2_u32 | 0x8).to_be_bytes());
        block
    }

    fn inode_block() -> Vec<u8> {
        let mut block = vec![0_u8; BS];
        block[..8].copy_from_slice(&signature8(INODE_SIGNATURE));
        block
    }

    fn garbage(seed: u8) -> Vec<u8> {
        vec![seed; BS]
    }

    /// Superblock, descriptor, three unknown blocks, then an inode block.
    fn stream() -> Vec<u8> {
        [
            superblock_block(),
            descriptor_block(),
            garbage(0x11),
            garbage(0x22),
            garbage(0x33),
            inode_block(),
        ]
        .concat()
    }

    fn summarize(events: &[ScanEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                ScanEvent::Superblock { block, .. } => format!("super@{block}"),
                ScanEvent::Journal { block, header, .. } => format!("{}@{block}", header.blocktype),
                ScanEvent::Metadata { block, block_type } => format!("{block_type}@{block}"),
                ScanEvent::Unknown { first, last } => format!("unknown@{first}..={last}"),
            })
            .collect()
    }

    #[test]
    fn unknown_blocks_coalesce_into_one_run() {
        let mut scanner = JournalScanner::new(BS);
        let mut events = scanner.feed(&stream()).expect("feed");
        events.extend(scanner.finish());
        assert_eq!(
            summarize(&events),
            vec!["super@0", "descriptor@1", "unknown@2..=4", "inode@5"]
        );
        let ScanEvent::Journal { tags, .. } = &events[1] else {
            panic!("expected descriptor");
        };
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].blocknr, 77);
        assert_eq!(
            scanner.summary(),
            ScanSummary {
                blocks: 6,
                journal_blocks: 2,
                metadata_blocks: 1,
                unknown_blocks: 3,
            }
        );
    }

    #[test]
    fn chunking_does_not_change_events() {
        let data = [stream(), garbage(0x44), garbage(0x55)].concat();
        let mut whole = JournalScanner::new(BS);
        let mut expected = whole.feed(&data).expect("feed");
        expected.extend(whole.finish());
        assert_eq!(summarize(&expected).last().map(String::as_str), Some("unknown@6..=7"));

        for per in 1..=4 {
            let mut scanner = JournalScanner::new(BS);
            let mut got = Vec::new();
            for chunk in data.chunks(per * BS) {
                got.extend(scanner.feed(chunk).expect("feed"));
            }
            got.extend(scanner.finish());
            assert_eq!(got, expected, "chunk of {per} blocks");
        }
    }

    #[test]
    fn bad_superblock_is_an_error() {
        let mut scanner = JournalScanner::new(BS);
        assert!(matches!(scanner.feed(&garbage(0)), Err(O2Error::Parse(_))));
    }

    #[test]
    fn misaligned_chunk_is_rejected() {
        let mut scanner = JournalScanner::new(BS);
        assert!(matches!(
            scanner.feed(&[0_u8; 100]),
            Err(O2Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn revoke_records_are_decoded() {
        let mut revoke = journal_block(JournalBlockType::Revoke, 11);
        revoke[12..16].copy_from_slice(&24_u32.to_be_bytes());
        revoke[16..20].copy_from_slice(&300_u32.to_be_bytes());
        revoke[20..24].copy_from_slice(&301_u32.to_be_bytes());
        let data = [superblock_block(), revoke, journal_block(JournalBlockType::Commit, 11)].concat();
        let mut scanner = JournalScanner::new(BS);
        let events = scanner.feed(&data).expect("feed");
        let ScanEvent::Journal { revoked, .. } = &events[1] else {
            panic!("expected revoke");
        };
        assert_eq!(revoked, &vec![300, 301]);
        assert_eq!(summarize(&events)[2], "commit@2");
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = ScanEvent::Unknown { first: 2, last: 4 };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["kind"], "unknown");
        assert_eq!(json["first"], 2);
        assert_eq!(json["last"], 4);
    }

    fn journal_inode(blocks: u64, runs: &[(u32, u64, u16)]) -> Dinode {
        let mut inode = new_dinode(BS, 20, 0o100_644, 1);
        inode.flags = InodeFlags::VALID.with(InodeFlags::SYSTEM).with(InodeFlags::JOURNAL);
        inode.size = blocks * BS as u64;
        let mut list = ExtentList::empty(o2_ondisk::extent_recs_per_inode(BS));
        for &(cpos, blkno, clusters) in runs {
            list.recs.push(ExtentRec {
                cpos,
                clusters: u32::from(clusters),
                flags: 0,
                blkno,
            });
        }
        inode.id2 = InodePayload::Extents(list);
        inode
    }

    #[test]
    fn scan_follows_the_extent_map() {
        // 4K clusters over 512-byte blocks: 8 blocks per cluster.
        let geom = Geometry::new(9, 12, 256).expect("geometry");
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(BS * 256), 512).expect("device");
        let data = stream();
        for (i, block) in data.chunks(BS).enumerate() {
            dev.write_block(BlockNumber(64 + i as u64), block).expect("write");
        }
        // Cluster 0 at block 64, cluster 1 is a hole.
        let inode = journal_inode(16, &[(0, 64, 1)]);
        let mut events = Vec::new();
        let summary = scan_journal(&dev, geom, &inode, 2 * BS, |e| {
            events.push(e);
            Ok(ControlFlow::Continue(()))
        })
        .expect("scan");
        assert_eq!(
            summarize(&events),
            vec!["super@0", "descriptor@1", "unknown@2..=4", "inode@5", "unknown@6..=15"]
        );
        assert_eq!(summary.blocks, 16);
    }

    #[test]
    fn scan_stops_when_visitor_breaks() {
        let geom = Geometry::new(9, 12, 256).expect("geometry");
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(BS * 256), 512).expect("device");
        for (i, block) in stream().chunks(BS).enumerate() {
            dev.write_block(BlockNumber(64 + i as u64), block).expect("write");
        }
        let inode = journal_inode(8, &[(0, 64, 1)]);
        let mut seen = 0;
        scan_journal(&dev, geom, &inode, BS, |_| {
            seen += 1;
            Ok(ControlFlow::Break(()))
        })
        .expect("scan");
        assert_eq!(seen, 1);
    }

    #[test]
    fn non_extent_inode_is_rejected() {
        let geom = Geometry::new(9, 12, 256).expect("geometry");
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(BS * 256), 512).expect("device");
        let mut inode = journal_inode(8, &[]);
        inode.id2 = InodePayload::FastSymlink(Vec::new());
        assert!(matches!(
            scan_journal(&dev, geom, &inode, BS, |_| Ok(ControlFlow::Continue(()))),
            Err(O2Error::InvalidArgument(_))
        ));
    }
}
