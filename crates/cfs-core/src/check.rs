//! Consistency check between the namespace and the allocation map.
//!
//! Rebuilds block ownership from every file's block list and compares it
//! with the bitmap. Runs at mount (any finding fails the mount) and on
//! demand through `Container::check`.

use cfs_alloc::{BlockStore, bitmap_get, bitmap_len, bitmap_set};
use cfs_tree::{Content, Namespace};
use serde::{Deserialize, Serialize};

/// Findings recorded verbatim; counters keep going past this.
const MAX_FINDINGS: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub entries: u64,
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub data_blocks: u64,
    /// Blocks marked used in the bitmap.
    pub used_blocks: u64,
    /// Blocks referenced by file block lists.
    pub referenced_blocks: u64,
    /// Marked used but owned by no file.
    pub leaked: u64,
    /// Owned by a file but marked free.
    pub unmarked: u64,
    /// Owned by more than one file, or twice by one.
    pub aliased: u64,
    /// Outside the data area.
    pub out_of_range: u64,
    /// Files whose block count disagrees with their size.
    pub size_mismatch: u64,
    pub findings: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problem_count() == 0
    }

    #[must_use]
    pub fn problem_count(&self) -> u64 {
        self.leaked + self.unmarked + self.aliased + self.out_of_range + self.size_mismatch
    }

    fn note(&mut self, finding: String) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        }
    }
}

/// Cross-check `ns` against `store`.
#[must_use]
pub fn check(store: &BlockStore, ns: &Namespace) -> CheckReport {
    let first = store.first_block().0;
    let count = store.total_blocks();
    let bs = store.block_size();
    let mut owned = vec![0_u8; usize::try_from(bitmap_len(count)).unwrap_or(0)];
    let mut report = CheckReport {
        data_blocks: count,
        used_blocks: store.used_blocks(),
        ..CheckReport::default()
    };

    for entry in ns.iter() {
        report.entries += 1;
        let (size, extents) = match entry.content() {
            Content::Directory { .. } => {
                report.directories += 1;
                continue;
            }
            Content::Symlink { .. } => {
                report.symlinks += 1;
                continue;
            }
            Content::File { size, extents } => {
                report.files += 1;
                (*size, extents)
            }
        };

        let label = || {
            ns.path_of(entry.id())
                .unwrap_or_else(|_| format!("entry {}", entry.id()))
        };
        let mut blocks = 0_u64;
        for range in extents {
            if range.is_empty() {
                report.size_mismatch += 1;
                report.note(format!("{}: empty extent at {}", label(), range.start));
                continue;
            }
            blocks = blocks.saturating_add(range.count);
            let inside = range.start.0 >= first
                && range.end().is_some_and(|end| end.0 - first <= count);
            if !inside {
                // Counted whole, never walked.
                report.out_of_range = report.out_of_range.saturating_add(range.count);
                report.note(format!("{}: extent {range} outside data area", label()));
                continue;
            }
            for block in range.blocks() {
                let idx = block.0 - first;
                if bitmap_get(&owned, idx) {
                    report.aliased += 1;
                    report.note(format!("{}: block {block} already owned", label()));
                    continue;
                }
                bitmap_set(&mut owned, idx);
                report.referenced_blocks += 1;
                if !store.is_allocated(block) {
                    report.unmarked += 1;
                    report.note(format!("{}: block {block} marked free", label()));
                }
            }
        }
        if blocks != bs.blocks_for(size) {
            report.size_mismatch += 1;
            report.note(format!("{}: {blocks} blocks for size {size}", label()));
        }
    }

    let bitmap = store.bitmap();
    for idx in 0..count {
        if bitmap_get(bitmap, idx) && !bitmap_get(&owned, idx) {
            report.leaked += 1;
            report.note(format!("block {} marked used but unowned", first + idx));
        }
    }
    report
}
