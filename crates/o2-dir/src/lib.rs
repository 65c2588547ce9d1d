#![forbid(unsafe_code)]
//! Directory block operations.
//!
//! Everything here works on one directory region at a time: a whole
//! directory block, or the inline-data area of an inode. The caller supplies
//! the byte range the entries tile and, for blocks that end in a trailer, the
//! trailer offset. Reading and writing blocks, walking a directory's extent
//! map, and growing directories live in `o2-core`.

use o2_error::{O2Error, Result};
use o2_ondisk::dirent::{DIR_ENTRY_HEADER_LEN, DIR_TRAILER_LEN, dir_trailer_offset};
use o2_ondisk::{DirEntry, DirTrailer, FileType, dir_rec_len};
use o2_types::MAX_FILENAME_LEN;
use std::ops::Range;
use tracing::trace;

// ── Visitor protocol ────────────────────────────────────────────────────────

/// What a directory visitor wants after seeing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAction {
    Continue,
    /// The entry was modified; the region must be written back.
    Changed,
    /// Stop iterating. `changed` requests write-back as well.
    Abort { changed: bool },
}

/// Which records a walk reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterFlags {
    /// Report unused records (inode 0).
    pub include_empty: bool,
    /// Skip `.` and `..`.
    pub exclude_dots: bool,
    /// Report the trailer's placeholder record.
    pub include_trailer: bool,
}

impl IterFlags {
    #[must_use]
    pub fn with_empty(mut self) -> Self {
        self.include_empty = true;
        self
    }

    #[must_use]
    pub fn without_dots(mut self) -> Self {
        self.exclude_dots = true;
        self
    }
}

/// Result of walking one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionVisit {
    pub changed: bool,
    pub aborted: bool,
}

/// A directory region inside a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Block number reported in corruption errors.
    pub blkno: u64,
    /// Bytes the entries tile, trailer included.
    pub range: Range<usize>,
    /// Offset of the trailer placeholder record, if the block has one.
    pub trailer_at: Option<usize>,
}

impl Region {
    /// A full directory block of `block_size` bytes.
    #[must_use]
    pub fn block(blkno: u64, block_size: usize, has_trailer: bool) -> Self {
        Self {
            blkno,
            range: 0..block_size,
            trailer_at: has_trailer.then(|| dir_trailer_offset(block_size)),
        }
    }

    /// The inline-data area of an inode.
    #[must_use]
    pub fn inline(blkno: u64, range: Range<usize>) -> Self {
        Self {
            blkno,
            range,
            trailer_at: None,
        }
    }

    /// Where live entries must stop: the trailer, or the end of the region.
    #[must_use]
    pub fn entries_end(&self) -> usize {
        self.trailer_at.unwrap_or(self.range.end)
    }

    fn corrupt(&self, offset: usize, detail: impl std::fmt::Display) -> O2Error {
        O2Error::Corruption {
            block: self.blkno,
            detail: format!("directory entry at offset {offset}: {detail}"),
        }
    }

    fn read(&self, buf: &[u8], offset: usize) -> Result<DirEntry> {
        DirEntry::parse(buf, offset, self.range.end).map_err(|err| self.corrupt(offset, err))
    }

    fn write(&self, buf: &mut [u8], offset: usize, entry: &DirEntry) -> Result<()> {
        entry
            .encode_into(buf, offset)
            .map_err(|err| self.corrupt(offset, err))
    }
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(O2Error::InvalidArgument("empty directory entry name".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(O2Error::NameTooLong);
    }
    Ok(())
}

fn rec_len_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

// ── Iteration ───────────────────────────────────────────────────────────────

/// Walk every record of a region, calling `visitor` on those `flags` select.
///
/// The visitor sees the decoded entry and its offset; when it returns
/// `Changed` (or an aborting `Changed`) the entry is re-encoded in place and
/// the walk continues from its possibly updated record length.
pub fn iterate_region<F>(
    buf: &mut [u8],
    region: &Region,
    flags: IterFlags,
    mut visitor: F,
) -> Result<RegionVisit>
where
    F: FnMut(&mut DirEntry, usize) -> Result<DirAction>,
{
    let mut visit = RegionVisit::default();
    let mut offset = region.range.start;
    while offset < region.range.end {
        let mut entry = region.read(buf, offset)?;
        let is_trailer = region.trailer_at == Some(offset);
        let selected = if is_trailer {
            flags.include_trailer
        } else if !entry.is_used() {
            flags.include_empty
        } else {
            !(flags.exclude_dots && entry.is_dot_or_dotdot())
        };
        if selected {
            let action = visitor(&mut entry, offset)?;
            let (changed, abort) = match action {
                DirAction::Continue => (false, false),
                DirAction::Changed => (true, false),
                DirAction::Abort { changed } => (changed, true),
            };
            if changed {
                region.write(buf, offset, &entry)?;
                visit.changed = true;
            }
            if abort {
                visit.aborted = true;
                break;
            }
        }
        offset += usize::from(entry.rec_len);
    }
    trace!(block = region.blkno, changed = visit.changed, aborted = visit.aborted, "dir_region_walk");
    Ok(visit)
}

/// Decode every record of a region, checking the records tile it exactly.
pub fn entries(buf: &[u8], region: &Region) -> Result<Vec<(usize, DirEntry)>> {
    let mut out = Vec::new();
    let mut offset = region.range.start;
    while offset < region.range.end {
        let entry = region.read(buf, offset)?;
        let next = offset + usize::from(entry.rec_len);
        out.push((offset, entry));
        offset = next;
    }
    if offset != region.range.end {
        return Err(region.corrupt(offset, "records overrun the region"));
    }
    Ok(out)
}

/// First live entry named `name`.
pub fn lookup_in_region(buf: &mut [u8], region: &Region, name: &[u8]) -> Result<Option<DirEntry>> {
    let mut found = None;
    iterate_region(buf, region, IterFlags::default(), |entry, _| {
        if entry.name == name {
            found = Some(entry.clone());
            return Ok(DirAction::Abort { changed: false });
        }
        Ok(DirAction::Continue)
    })?;
    Ok(found)
}

// ── Insertion and removal ───────────────────────────────────────────────────

/// Outcome of trying to place a name in one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Offset of the new entry when it was placed.
    pub placed: Option<usize>,
    /// The region was modified (placed, or free records merged).
    pub changed: bool,
}

/// Place `name -> inode` in the first record with room.
///
/// For each record in order: an unused record directly after it is merged
/// into it; a live record with enough slack is shortened to its minimum and
/// the slack becomes a new unused record; an unused record large enough
/// takes the name.
pub fn insert_entry(
    buf: &mut [u8],
    region: &Region,
    inode: u64,
    name: &[u8],
    file_type: FileType,
) -> Result<InsertOutcome> {
    check_name(name)?;
    if inode == 0 {
        return Err(O2Error::InvalidArgument("cannot link inode 0".into()));
    }
    let need = dir_rec_len(name.len());
    let end = region.entries_end();
    let mut out = InsertOutcome::default();
    let mut offset = region.range.start;

    while offset < end {
        let mut entry = region.read(buf, offset)?;
        let mut rec_len = usize::from(entry.rec_len);

        // Absorb a following unused record.
        let next_at = offset + rec_len;
        if next_at + DIR_ENTRY_HEADER_LEN <= end {
            let next = region.read(buf, next_at)?;
            if !next.is_used() && next_at + usize::from(next.rec_len) <= end {
                rec_len += usize::from(next.rec_len);
                entry.rec_len = rec_len_u16(rec_len);
                region.write(buf, offset, &entry)?;
                out.changed = true;
            }
        }

        if entry.is_used() {
            let min = entry.min_rec_len();
            if rec_len >= min + need {
                entry.rec_len = rec_len_u16(min);
                region.write(buf, offset, &entry)?;
                let slack = DirEntry {
                    inode: 0,
                    rec_len: rec_len_u16(rec_len - min),
                    file_type: FileType::Unknown,
                    name: Vec::new(),
                };
                region.write(buf, offset + min, &slack)?;
                out.changed = true;
                offset += min;
                continue;
            }
        } else if rec_len >= need {
            let placed = DirEntry {
                inode,
                rec_len: entry.rec_len,
                file_type,
                name: name.to_vec(),
            };
            region.write(buf, offset, &placed)?;
            trace!(block = region.blkno, offset, inode, "dir_entry_inserted");
            out.placed = Some(offset);
            out.changed = true;
            return Ok(out);
        }
        offset += rec_len;
    }
    Ok(out)
}

/// Remove the first live entry named `name` (and pointing at `inode`, when
/// given). Its space goes to the previous record, or the entry is cleared
/// when it is first in the region. Returns the removed entry's inode.
pub fn remove_entry(
    buf: &mut [u8],
    region: &Region,
    name: &[u8],
    inode: Option<u64>,
) -> Result<Option<u64>> {
    check_name(name)?;
    let end = region.entries_end();
    let mut prev: Option<(usize, DirEntry)> = None;
    let mut offset = region.range.start;
    while offset < end {
        let mut entry = region.read(buf, offset)?;
        let rec_len = usize::from(entry.rec_len);
        let matches = entry.is_used()
            && entry.name == name
            && inode.is_none_or(|ino| ino == entry.inode);
        if matches {
            let removed = entry.inode;
            match prev {
                Some((prev_at, mut prev_entry)) => {
                    prev_entry.rec_len = rec_len_u16(usize::from(prev_entry.rec_len) + rec_len);
                    region.write(buf, prev_at, &prev_entry)?;
                }
                None => {
                    entry.inode = 0;
                    region.write(buf, offset, &entry)?;
                }
            }
            trace!(block = region.blkno, offset, inode = removed, "dir_entry_removed");
            return Ok(Some(removed));
        }
        prev = Some((offset, entry));
        offset += rec_len;
    }
    Ok(None)
}

// ── Block initialization ────────────────────────────────────────────────────

/// Write the trailer placeholder at the end of a directory block.
pub fn init_trailer(block: &mut [u8], blkno: u64, parent: u64) -> Result<()> {
    let trailer = DirTrailer {
        compat_inode: 0,
        compat_rec_len: rec_len_u16(DIR_TRAILER_LEN),
        compat_name_len: 0,
        free_rec_len: 0,
        free_next: 0,
        blkno,
        parent_dinode: parent,
    };
    let at = dir_trailer_offset(block.len());
    block[at..].fill(0);
    trailer.encode_into(block).map_err(|err| O2Error::Corruption {
        block: blkno,
        detail: err.to_string(),
    })
}

/// Fill a region with `.` and `..`, the second record spanning the rest.
pub fn init_dot_entries(buf: &mut [u8], region: &Region, self_ino: u64, parent_ino: u64) -> Result<()> {
    let end = region.entries_end();
    let start = region.range.start;
    let dot_len = dir_rec_len(1);
    if end < start + dot_len + dir_rec_len(2) {
        return Err(O2Error::InvalidArgument(format!(
            "directory region of {} bytes cannot hold . and ..",
            end.saturating_sub(start)
        )));
    }
    buf[start..end].fill(0);
    let dot = DirEntry {
        inode: self_ino,
        rec_len: rec_len_u16(dot_len),
        file_type: FileType::Directory,
        name: b".".to_vec(),
    };
    let dotdot = DirEntry {
        inode: parent_ino,
        rec_len: rec_len_u16(end - start - dot_len),
        file_type: FileType::Directory,
        name: b"..".to_vec(),
    };
    region.write(buf, start, &dot)?;
    region.write(buf, start + dot_len, &dotdot)
}

/// Fill a region with one unused record spanning it.
pub fn init_empty_entries(buf: &mut [u8], region: &Region) -> Result<()> {
    let end = region.entries_end();
    let start = region.range.start;
    buf[start..end].fill(0);
    let empty = DirEntry {
        inode: 0,
        rec_len: rec_len_u16(end - start),
        file_type: FileType::Unknown,
        name: Vec::new(),
    };
    region.write(buf, start, &empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use o2_ondisk::has_dir_trailer;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const BS: usize = 512;

    fn dir_block(trailer: bool) -> (Vec<u8>, Region) {
        let mut buf = vec![0_u8; BS];
        let region = Region::block(40, BS, trailer);
        if trailer {
            init_trailer(&mut buf, 40, 30).expect("trailer");
        }
        init_dot_entries(&mut buf, &region, 30, 20).expect("dots");
        (buf, region)
    }

    fn names(buf: &mut [u8], region: &Region) -> Vec<String> {
        let mut out = Vec::new();
        iterate_region(buf, region, IterFlags::default(), |e, _| {
            out.push(e.name_str());
            Ok(DirAction::Continue)
        })
        .expect("iterate");
        out
    }

    fn assert_tiles(buf: &[u8], region: &Region) {
        let total: usize = entries(buf, region)
            .expect("entries")
            .iter()
            .map(|(_, e)| usize::from(e.rec_len))
            .sum();
        assert_eq!(total, region.range.len());
    }

    #[test]
    fn dots_tile_the_block() {
        let (mut buf, region) = dir_block(false);
        assert_eq!(names(&mut buf, &region), vec![".", ".."]);
        assert_tiles(&buf, &region);
        let all = entries(&buf, &region).expect("entries");
        assert_eq!(all[1].1.rec_len, 496);
    }

    #[test]
    fn trailer_is_skipped_unless_requested() {
        let (mut buf, region) = dir_block(true);
        assert!(has_dir_trailer(&buf));
        assert_eq!(names(&mut buf, &region), vec![".", ".."]);
        let mut seen = 0;
        let flags = IterFlags {
            include_trailer: true,
            ..IterFlags::default()
        };
        iterate_region(&mut buf, &region, flags, |_, _| {
            seen += 1;
            Ok(DirAction::Continue)
        })
        .expect("iterate");
        assert_eq!(seen, 3);
        assert_tiles(&buf, &region);
    }

    #[test]
    fn insert_splits_slack_and_tiles() {
        for trailer in [false, true] {
            let (mut buf, region) = dir_block(trailer);
            for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
                let out = insert_entry(&mut buf, &region, 100 + i as u64, name.as_bytes(), FileType::Regular)
                    .expect("insert");
                assert!(out.placed.is_some());
                assert!(out.changed);
                assert_tiles(&buf, &region);
            }
            assert_eq!(names(&mut buf, &region), vec![".", "..", "alpha", "beta", "gamma"]);
            assert_eq!(has_dir_trailer(&buf), trailer);
            let hit = lookup_in_region(&mut buf, &region, b"beta").expect("lookup");
            assert_eq!(hit.map(|e| e.inode), Some(101));
            assert!(lookup_in_region(&mut buf, &region, b"bet").expect("lookup").is_none());
        }
    }

    proptest! {
        #[test]
        fn records_tile_through_insert_and_remove(
            trailer in any::<bool>(),
            ops in proptest::collection::vec((any::<bool>(), 0_usize..24, 0_usize..40), 1..120),
        ) {
            let (mut buf, region) = dir_block(trailer);
            let mut model: BTreeMap<String, u64> = BTreeMap::new();
            for (insert, id, pad) in ops {
                if insert || model.is_empty() {
                    let name = format!("e{id}-{}", "n".repeat(pad));
                    if model.contains_key(&name) {
                        continue;
                    }
                    let inode = 100 + id as u64;
                    let out = insert_entry(&mut buf, &region, inode, name.as_bytes(), FileType::Regular)
                        .expect("insert");
                    if out.placed.is_some() {
                        model.insert(name, inode);
                    }
                } else {
                    let name = model.keys().nth(id % model.len()).cloned().expect("live name");
                    let removed = remove_entry(&mut buf, &region, name.as_bytes(), None).expect("remove");
                    prop_assert_eq!(removed, model.remove(&name));
                }
                assert_tiles(&buf, &region);
                prop_assert_eq!(has_dir_trailer(&buf), trailer);
            }

            let mut listed: Vec<String> = names(&mut buf, &region)
                .into_iter()
                .filter(|name| name != "." && name != "..")
                .collect();
            listed.sort();
            prop_assert_eq!(listed, model.keys().cloned().collect::<Vec<_>>());
            for (name, inode) in &model {
                let hit = lookup_in_region(&mut buf, &region, name.as_bytes()).expect("lookup");
                prop_assert_eq!(hit.map(|e| e.inode), Some(*inode));
            }
        }
    }

    #[test]
    fn full_region_reports_no_placement() {
        let (mut buf, region) = dir_block(false);
        let name = [b'x'; 200];
        insert_entry(&mut buf, &region, 7, &name, FileType::Regular).expect("first");
        insert_entry(&mut buf, &region, 8, &name[..199], FileType::Regular).expect("second");
        let snapshot = buf.clone();
        let out = insert_entry(&mut buf, &region, 9, &name, FileType::Regular).expect("third");
        assert_eq!(out, InsertOutcome::default());
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn removal_coalesces_into_previous() {
        let (mut buf, region) = dir_block(false);
        insert_entry(&mut buf, &region, 100, b"one", FileType::Regular).expect("one");
        insert_entry(&mut buf, &region, 101, b"two", FileType::Regular).expect("two");
        assert_eq!(remove_entry(&mut buf, &region, b"one", None).expect("rm"), Some(100));
        assert_eq!(names(&mut buf, &region), vec![".", "..", "two"]);
        assert_tiles(&buf, &region);
        assert_eq!(remove_entry(&mut buf, &region, b"two", Some(55)).expect("rm"), None);
        assert_eq!(remove_entry(&mut buf, &region, b"missing", None).expect("rm"), None);
    }

    #[test]
    fn removal_of_first_entry_clears_inode() {
        let mut buf = vec![0_u8; BS];
        let region = Region::block(41, BS, false);
        init_empty_entries(&mut buf, &region).expect("empty");
        insert_entry(&mut buf, &region, 100, b"first", FileType::Regular).expect("first");
        insert_entry(&mut buf, &region, 101, b"second", FileType::Regular).expect("second");
        assert_eq!(remove_entry(&mut buf, &region, b"first", None).expect("rm"), Some(100));
        let all = entries(&buf, &region).expect("entries");
        assert_eq!(all[0].1.inode, 0);
        assert_eq!(names(&mut buf, &region), vec!["second"]);

        // The freed head record is reused by the next insert.
        let out = insert_entry(&mut buf, &region, 102, b"third", FileType::Regular).expect("third");
        assert_eq!(out.placed, Some(0));
    }

    #[test]
    fn insert_merges_adjacent_free_records() {
        let mut buf = vec![0_u8; BS];
        let region = Region::block(42, BS, false);
        // Two adjacent unused records of 24 bytes each, then a live one.
        let free = |len| DirEntry { inode: 0, rec_len: len, file_type: FileType::Unknown, name: Vec::new() };
        free(24).encode_into(&mut buf, 0).expect("free a");
        free(24).encode_into(&mut buf, 24).expect("free b");
        DirEntry { inode: 9, rec_len: 464, file_type: FileType::Regular, name: b"tail".to_vec() }
            .encode_into(&mut buf, 48)
            .expect("tail");
        let name = [b'n'; 30];
        let out = insert_entry(&mut buf, &region, 10, &name, FileType::Regular).expect("insert");
        assert_eq!(out.placed, Some(0));
        let all = entries(&buf, &region).expect("entries");
        assert_eq!(all[0].1.rec_len, 48);
        assert_tiles(&buf, &region);
    }

    #[test]
    fn visitor_changes_are_written_back() {
        let (mut buf, region) = dir_block(false);
        insert_entry(&mut buf, &region, 100, b"file", FileType::Regular).expect("insert");
        let visit = iterate_region(&mut buf, &region, IterFlags::default().without_dots(), |e, _| {
            e.inode = 555;
            Ok(DirAction::Abort { changed: true })
        })
        .expect("iterate");
        assert!(visit.changed && visit.aborted);
        let hit = lookup_in_region(&mut buf, &region, b"file").expect("lookup");
        assert_eq!(hit.map(|e| e.inode), Some(555));
    }

    #[test]
    fn abort_stops_the_walk() {
        let (mut buf, region) = dir_block(false);
        let mut seen = 0;
        let visit = iterate_region(&mut buf, &region, IterFlags::default(), |_, _| {
            seen += 1;
            Ok(DirAction::Abort { changed: false })
        })
        .expect("iterate");
        assert_eq!(seen, 1);
        assert!(visit.aborted && !visit.changed);
    }

    #[test]
    fn malformed_records_are_corruption() {
        let (mut buf, region) = dir_block(false);
        // `..` record length no longer a multiple of 4.
        buf[16 + 8] = 0xF1;
        let err = iterate_region(&mut buf, &region, IterFlags::default(), |_, _| Ok(DirAction::Continue))
            .expect_err("corrupt");
        assert!(matches!(err, O2Error::Corruption { block: 40, .. }));
    }

    #[test]
    fn empty_records_reported_on_request() {
        let mut buf = vec![0_u8; BS];
        let region = Region::block(43, BS, false);
        init_empty_entries(&mut buf, &region).expect("empty");
        assert!(names(&mut buf, &region).is_empty());
        let mut lens = Vec::new();
        iterate_region(&mut buf, &region, IterFlags::default().with_empty(), |e, _| {
            lens.push(e.rec_len);
            Ok(DirAction::Continue)
        })
        .expect("iterate");
        assert_eq!(lens, vec![512]);
    }

    #[test]
    fn inline_region_offsets() {
        let mut buf = vec![0_u8; BS];
        let region = Region::inline(44, 0xC8..0xC8 + 120);
        init_dot_entries(&mut buf, &region, 44, 20).expect("dots");
        insert_entry(&mut buf, &region, 50, b"x", FileType::Regular).expect("insert");
        assert_eq!(names(&mut buf, &region), vec![".", "..", "x"]);
        assert_tiles(&buf, &region);
        assert!(buf[..0xC8].iter().all(|&b| b == 0));
    }

    #[test]
    fn name_validation() {
        let (mut buf, region) = dir_block(false);
        assert!(matches!(
            insert_entry(&mut buf, &region, 5, b"", FileType::Regular),
            Err(O2Error::InvalidArgument(_))
        ));
        assert!(matches!(
            insert_entry(&mut buf, &region, 5, &[b'a'; 256], FileType::Regular),
            Err(O2Error::NameTooLong)
        ));
        assert!(matches!(
            insert_entry(&mut buf, &region, 0, b"a", FileType::Regular),
            Err(O2Error::InvalidArgument(_))
        ));
    }
}
