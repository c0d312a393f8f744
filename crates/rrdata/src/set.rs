// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The rerecord set: an ordered set of half-open identifier intervals,
//! kept disjoint and maximally coalesced, with a compact run-length wire
//! format and an append-only backing log.

use crate::id::{RerecordId, ID_BYTES};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use voicedeck_core::Result;

/// Longest run one wire record can carry; longer runs are split.
pub const MAX_RUN: u32 = 16_843_009;

/// Exact number of identifiers in `[b, e)`, stepping by saturated
/// differences so arbitrarily wide intervals still total correctly.
fn symbols_in_interval(b: RerecordId, e: RerecordId) -> u64 {
    let mut count = 0u64;
    let mut x = b;
    while x != e {
        let step = e.saturating_diff(x);
        x = x.wrapping_add(step);
        count += u64::from(step);
    }
    count
}

/// Append one run to the wire stream.
///
/// The opcode packs the length-prefix size (top two bits) with the number
/// of leading bytes shared with the predicted identifier (low five bits);
/// shared bytes are omitted.
fn flush_symbol(strm: &mut Vec<u8>, base: RerecordId, predicted: RerecordId, count: u32) {
    let (mut opcode, bias): (u8, u32) = if count == 1 {
        (0x00, 1)
    } else if count < 258 {
        (0x20, 2)
    } else if count < 65_794 {
        (0x40, 258)
    } else {
        (0x60, 65_794)
    };
    let mut shared = 0usize;
    while shared < ID_BYTES - 1 && base.as_bytes()[shared] == predicted.as_bytes()[shared] {
        shared += 1;
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        opcode += shared as u8;
    }
    strm.push(opcode);
    strm.extend_from_slice(&base.as_bytes()[shared..]);
    let v = count - bias;
    #[allow(clippy::cast_possible_truncation)]
    let len_bytes = [(v >> 16) as u8, (v >> 8) as u8, v as u8];
    let prefix = (opcode >> 5) as usize;
    strm.extend_from_slice(&len_bytes[3 - prefix..]);
}

/// Ordered set of rerecord identifiers with incremental seed, wire
/// serialisation and a project-scoped append-only log.
#[derive(Debug, Default)]
pub struct RerecordSet {
    /// Disjoint, coalesced half-open intervals, keyed by start.
    data: BTreeMap<RerecordId, RerecordId>,
    /// Stored symbol count; the reported count is one less (the seed
    /// record does not count as a rerecord).
    stored: u64,
    internal: RerecordId,
    project: Option<PathBuf>,
    lazy: bool,
    log: Option<File>,
}

impl RerecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-process secret the incremental contributions derive
    /// from.
    pub fn set_internal(&mut self, seed: RerecordId) {
        self.internal = seed;
    }

    /// Append the current seed value and advance it.
    ///
    /// # Errors
    ///
    /// Propagates log I/O failures from [`Self::add`].
    pub fn add_internal(&mut self) -> Result<()> {
        let id = self.internal;
        self.internal = id.succ();
        self.add(id)?;
        Ok(())
    }

    /// Add one identifier. Duplicates are ignored and in particular never
    /// re-appended to the log.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the log append fails; the in-memory set is
    /// updated regardless.
    pub fn add(&mut self, id: RerecordId) -> Result<bool> {
        let before = self.stored;
        Self::insert_into(&mut self.data, &mut self.stored, id, id.succ());
        let fresh = self.stored != before;
        if fresh {
            if let Some(log) = self.log.as_mut() {
                log.write_all(id.as_bytes())?;
                log.flush()?;
            }
        }
        Ok(fresh)
    }

    /// Number of distinct identifiers, minus one for the seed record.
    pub fn count(&self) -> u64 {
        self.stored.saturating_sub(1)
    }

    /// True if `id` is in the set.
    pub fn contains(&self, id: RerecordId) -> bool {
        self.in_range(id, id.succ())
    }

    /// True if the whole interval `[b, e)` is covered.
    pub fn in_range(&self, b: RerecordId, e: RerecordId) -> bool {
        if b == e {
            return true;
        }
        self.data
            .range(..=b)
            .next_back()
            .is_some_and(|(&start, &end)| start <= b && end >= e)
    }

    /// Current intervals, for inspection.
    pub fn intervals(&self) -> Vec<(RerecordId, RerecordId)> {
        self.data.iter().map(|(&b, &e)| (b, e)).collect()
    }

    /// Serialise the set into `strm`, returning the symbol count minus one
    /// (the value recorded as a movie's rerecord count).
    pub fn write(&self, strm: &mut Vec<u8>) -> u64 {
        strm.clear();
        let mut scount = 0u64;
        let mut predicted = RerecordId::default();
        for (&begin, &end) in &self.data {
            let mut encode_base = begin;
            while encode_base != end {
                let syms = end.saturating_diff(encode_base).min(MAX_RUN);
                flush_symbol(strm, encode_base, predicted, syms);
                scount += u64::from(syms);
                encode_base = encode_base.wrapping_add(syms);
                predicted = encode_base;
            }
        }
        scount.saturating_sub(1)
    }

    /// Deserialise a wire stream, returning its symbol count minus one.
    ///
    /// Unless `dummy` is set, decoded runs are merged into the set and
    /// previously unseen identifiers are appended to the log. A truncated
    /// stream stops cleanly at the last complete record.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a log append fails.
    pub fn read(&mut self, strm: &[u8], dummy: bool) -> Result<u64> {
        let mut scount = 0u64;
        let mut decoding = RerecordId::default();
        let mut ptr = 0usize;
        while ptr < strm.len() {
            let opcode = strm[ptr];
            let valid = (opcode & 0x1F) as usize;
            let prefix = ((opcode & 0x60) >> 5) as usize;
            if ptr + 1 + (ID_BYTES - valid) + prefix > strm.len() {
                break;
            }
            ptr += 1;
            let mut bytes = *decoding.as_bytes();
            bytes[valid..].copy_from_slice(&strm[ptr..ptr + ID_BYTES - valid]);
            decoding = RerecordId::from_bytes(bytes);
            ptr += ID_BYTES - valid;
            let repeat: u32 = match prefix {
                1 => 2 + u32::from(strm[ptr]),
                2 => 258 + u32::from(strm[ptr]) * 256 + u32::from(strm[ptr + 1]),
                3 => {
                    65_794
                        + u32::from(strm[ptr]) * 65_536
                        + u32::from(strm[ptr + 1]) * 256
                        + u32::from(strm[ptr + 2])
                },
                _ => 1,
            };
            ptr += prefix;
            if !dummy {
                self.merge_run(decoding, repeat)?;
            }
            decoding = decoding.wrapping_add(repeat);
            scount += u64::from(repeat);
        }
        Ok(scount.saturating_sub(1))
    }

    /// Merge one decoded run, logging identifiers not seen before.
    fn merge_run(&mut self, base: RerecordId, repeat: u32) -> Result<()> {
        let end = base.wrapping_add(repeat);
        if !self.in_range(base, end) && self.log.is_some() {
            let mut any = false;
            for i in 0..repeat {
                let id = base.wrapping_add(i);
                if !self.contains(id) {
                    if let Some(log) = self.log.as_mut() {
                        log.write_all(id.as_bytes())?;
                        any = true;
                    }
                }
            }
            if any {
                if let Some(log) = self.log.as_mut() {
                    log.flush()?;
                }
            }
        }
        Self::insert_into(&mut self.data, &mut self.stored, base, end);
        Ok(())
    }

    /// Rebind the set to a project's backing file.
    ///
    /// In lazy mode the in-memory state is reset and nothing is written
    /// until the next non-lazy rebind, which replays the lazily collected
    /// identifiers into the file. A non-lazy rebind loads the file,
    /// reopens it for appending, and keeps previously loaded state when the
    /// project is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be opened for
    /// appending or the lazy replay fails. Read errors on a missing file
    /// are not errors: the project starts empty.
    pub fn read_base(&mut self, projectfile: &Path, lazy: bool) -> Result<()> {
        if self.project.as_deref() == Some(projectfile) && (!self.lazy || lazy) {
            return Ok(());
        }
        if lazy {
            self.data.clear();
            self.stored = 0;
            self.project = Some(projectfile.to_path_buf());
            self.lazy = true;
            self.log = None;
            return Ok(());
        }
        let same_project = self.project.as_deref() == Some(projectfile);
        let mut new_data = BTreeMap::new();
        let mut new_stored = 0u64;
        if same_project {
            new_data = self.data.clone();
            new_stored = self.stored;
        }
        self.log = None;
        if let Ok(mut handle) = File::open(projectfile) {
            let mut bytes = [0u8; ID_BYTES];
            while handle.read_exact(&mut bytes).is_ok() {
                let id = RerecordId::from_bytes(bytes);
                Self::insert_into(&mut new_data, &mut new_stored, id, id.succ());
            }
        }
        let mut log = OpenOptions::new().create(true).append(true).open(projectfile)?;
        if same_project && self.lazy {
            // Finish the lazily created project: replay everything
            // collected in memory into the new backing file.
            for (&begin, &end) in &self.data {
                let mut id = begin;
                while id != end {
                    log.write_all(id.as_bytes())?;
                    id = id.succ();
                }
            }
            log.flush()?;
        }
        self.log = Some(log);
        self.data = new_data;
        self.stored = new_stored;
        self.project = Some(projectfile.to_path_buf());
        self.lazy = false;
        Ok(())
    }

    /// Flush and unbind the backing file.
    pub fn close(&mut self) {
        self.project = None;
        self.lazy = false;
        self.log = None;
    }

    fn insert_into(
        data: &mut BTreeMap<RerecordId, RerecordId>,
        stored: &mut u64,
        b: RerecordId,
        e: RerecordId,
    ) {
        if b == e {
            return;
        }
        let mut begin = b;
        let mut end = e;
        let mut removed = 0u64;
        if let Some((&prev_start, &prev_end)) = data.range(..=b).next_back() {
            if b >= prev_start && e <= prev_end {
                // Entirely inside an existing interval.
                return;
            }
            if b <= prev_end {
                // Overlaps or touches the preceding interval; absorb it.
                removed += symbols_in_interval(prev_start, prev_end);
                begin = prev_start;
                if prev_end > end {
                    end = prev_end;
                }
                data.remove(&prev_start);
            }
        }
        // Absorb every following interval the new one reaches (end == start
        // counts: adjacent intervals must coalesce).
        let followers: Vec<RerecordId> = data
            .range((Excluded(begin), Unbounded))
            .take_while(|(&start, _)| start <= end)
            .map(|(&start, _)| start)
            .collect();
        for start in followers {
            if let Some(follower_end) = data.remove(&start) {
                removed += symbols_in_interval(start, follower_end);
                if follower_end > end {
                    end = follower_end;
                }
            }
        }
        let added = symbols_in_interval(begin, end);
        data.insert(begin, end);
        *stored = *stored + added - removed;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn id(tail: u32) -> RerecordId {
        RerecordId::default().wrapping_add(tail)
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut set = RerecordSet::new();
        assert!(set.add(id(5)).unwrap());
        assert!(!set.add(id(5)).unwrap());
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_disjoint_adds_make_two_intervals() {
        let mut set = RerecordSet::new();
        set.add(id(5)).unwrap();
        set.add(id(9)).unwrap();
        assert_eq!(set.intervals(), vec![(id(5), id(6)), (id(9), id(10))]);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_adjacent_intervals_coalesce() {
        let mut set = RerecordSet::new();
        set.add(id(5)).unwrap();
        set.add(id(7)).unwrap();
        set.add(id(6)).unwrap();
        assert_eq!(set.intervals(), vec![(id(5), id(8))]);
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_no_adjacent_intervals_after_any_sequence() {
        let mut set = RerecordSet::new();
        for tail in [10u32, 2, 8, 4, 6, 3, 9, 5, 7, 11, 1] {
            set.add(id(tail)).unwrap();
        }
        let intervals = set.intervals();
        assert_eq!(intervals, vec![(id(1), id(12))]);
        for window in intervals.windows(2) {
            assert!(window[0].1 < window[1].0, "intervals must not touch");
        }
        assert_eq!(set.count(), 10);
    }

    #[test]
    fn test_run_insert_subsumes_followers() {
        let mut set = RerecordSet::new();
        set.add(id(100)).unwrap();
        set.add(id(105)).unwrap();
        // Run [98, 110) swallows both points.
        RerecordSet::insert_into(&mut set.data, &mut set.stored, id(98), id(110));
        assert_eq!(set.intervals(), vec![(id(98), id(110))]);
        assert_eq!(set.count(), 11);
    }

    #[test]
    fn test_add_internal_advances_seed() {
        let mut set = RerecordSet::new();
        set.set_internal(id(40));
        set.add_internal().unwrap();
        set.add_internal().unwrap();
        assert_eq!(set.intervals(), vec![(id(40), id(42))]);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut set = RerecordSet::new();
        for tail in [1u32, 2, 3, 900, 70_000] {
            set.add(id(tail)).unwrap();
        }
        let mut wire = Vec::new();
        let wrote = set.write(&mut wire);
        assert_eq!(wrote, set.count());

        let mut other = RerecordSet::new();
        let read = other.read(&wire, false).unwrap();
        assert_eq!(read, wrote);
        assert_eq!(other.intervals(), set.intervals());
        assert_eq!(other.count(), set.count());
    }

    #[test]
    fn test_wire_long_run_layout() {
        // {[1, 2^20+1)}: one record, 31 predicted bytes omitted, 3 length
        // bytes.
        let mut set = RerecordSet::new();
        RerecordSet::insert_into(&mut set.data, &mut set.stored, id(1), id(1).wrapping_add(1 << 20));
        let mut wire = Vec::new();
        let wrote = set.write(&mut wire);
        assert_eq!(wrote, (1 << 20) - 1);
        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0], 0x7F);

        let mut other = RerecordSet::new();
        other.read(&wire, false).unwrap();
        assert_eq!(other.intervals(), set.intervals());
    }

    #[test]
    fn test_wire_dummy_read_counts_without_mutation() {
        let mut set = RerecordSet::new();
        for tail in 1..=10u32 {
            set.add(id(tail)).unwrap();
        }
        let mut wire = Vec::new();
        set.write(&mut wire);

        let mut other = RerecordSet::new();
        let counted = other.read(&wire, true).unwrap();
        assert_eq!(counted, 9);
        assert!(other.intervals().is_empty());
    }

    #[test]
    fn test_wire_truncation_stops_at_last_complete_record() {
        let mut set = RerecordSet::new();
        set.add(id(5)).unwrap();
        set.add(id(900)).unwrap();
        let mut wire = Vec::new();
        set.write(&mut wire);

        let mut other = RerecordSet::new();
        other.read(&wire[..wire.len() - 1], false).unwrap();
        assert_eq!(other.intervals(), vec![(id(5), id(6))]);
    }

    #[test]
    fn test_backing_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.rr");

        let mut set = RerecordSet::new();
        set.read_base(&path, false).unwrap();
        set.add(id(3)).unwrap();
        set.add(id(3)).unwrap();
        set.add(id(17)).unwrap();
        set.close();

        // Duplicates were suppressed: two records of 32 bytes each.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 2 * ID_BYTES);

        let mut reloaded = RerecordSet::new();
        reloaded.read_base(&path, false).unwrap();
        assert_eq!(reloaded.intervals(), vec![(id(3), id(4)), (id(17), id(18))]);
    }

    #[test]
    fn test_lazy_rebind_replays_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.rr");

        let mut set = RerecordSet::new();
        set.read_base(&path, true).unwrap();
        set.add(id(1)).unwrap();
        set.add(id(2)).unwrap();
        assert!(!path.exists());

        set.read_base(&path, false).unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 2 * ID_BYTES);
        assert_eq!(set.intervals(), vec![(id(1), id(3))]);
    }

    #[test]
    fn test_read_appends_unseen_ids_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.rr");

        let mut source = RerecordSet::new();
        source.add(id(7)).unwrap();
        source.add(id(8)).unwrap();
        let mut wire = Vec::new();
        source.write(&mut wire);

        let mut set = RerecordSet::new();
        set.read_base(&path, false).unwrap();
        set.add(id(7)).unwrap();
        set.read(&wire, false).unwrap();
        set.close();

        // id(7) logged once by add, id(8) once by read.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 2 * ID_BYTES);
    }

    #[test]
    fn test_count_matches_distinct_adds() {
        let mut set = RerecordSet::new();
        let ids: Vec<RerecordId> = (0..50u32).map(|i| id(i * 3)).collect();
        for &i in &ids {
            set.add(i).unwrap();
            set.add(i).unwrap();
        }
        assert_eq!(set.count(), ids.len() as u64 - 1);
    }

    #[test]
    fn test_hex_parse_matches_display() {
        let parsed = RerecordId::from_str(
            "0000000000000000000000000000000000000000000000000000000000000005",
        )
        .unwrap();
        assert_eq!(parsed, id(5));
    }
}
