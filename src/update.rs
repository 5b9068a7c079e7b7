//! Reconciling the host database with chain reorganizations.
//!
//! A reorg arrives as a list of blocks to rewind followed by a list of blocks
//! to apply. Announcements behave like a stack: rewound blocks come most
//! recent first, so undoing each block's announcements exactly cancels the
//! apply that added them.

use log::{info, warn};

use crate::entry::{BlockHeight, HostEntry};
use crate::error::{ReorgDirection, UpdateError};
use crate::{HostDb, Inner};

/// Extracts host announcements from a block.
///
/// Implementations must be free of side effects: [`HostDb::update`] calls
/// them while holding the database's write lock, so they must not call back
/// into the same database either.
pub trait AnnouncementScanner {
    type Block;
    type Error;

    /// Announcements found in `block`, in transaction order. Fails if an
    /// announcement transaction cannot be decoded.
    fn scan(&self, height: BlockHeight, block: &Self::Block) -> Result<Vec<HostEntry>, Self::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
struct ReorgSummary {
    rewound: usize,
    applied: usize,
    removed: usize,
    added: usize,
}

impl HostDb {
    /// Rewinds `rewound` and then applies `applied`.
    ///
    /// `rewound` must be ordered most recently applied first; `applied` in
    /// chain order. Every announced host found in a rewound block loses that
    /// announcement (and leaves the database once none remain); every host
    /// announced in an applied block is added, or has its announcement count
    /// raised if already known.
    ///
    /// The write lock is held for the whole call, so readers see either the
    /// state before the reorg or after it. If the scanner fails, the failing
    /// block is left untouched and the error is returned; blocks handled
    /// before it stay rewound or applied.
    pub fn update<S: AnnouncementScanner>(
        &self,
        scanner: &S,
        at_height: BlockHeight,
        rewound: &[S::Block],
        applied: &[S::Block],
    ) -> Result<(), UpdateError<S::Error>> {
        let mut inner = self.inner.write();
        let mut summary = ReorgSummary::default();

        let result = reconcile(
            &mut inner,
            scanner,
            at_height,
            rewound,
            applied,
            &mut summary,
        );
        drop(inner);

        info!(
            "reorg at height {}: rewound {}/{} blocks, applied {}/{} blocks, {} hosts removed, {} hosts added",
            at_height,
            summary.rewound,
            rewound.len(),
            summary.applied,
            applied.len(),
            summary.removed,
            summary.added,
        );
        result
    }
}

fn reconcile<S: AnnouncementScanner>(
    inner: &mut Inner,
    scanner: &S,
    at_height: BlockHeight,
    rewound: &[S::Block],
    applied: &[S::Block],
    summary: &mut ReorgSummary,
) -> Result<(), UpdateError<S::Error>> {
    for (idx, block) in rewound.iter().enumerate() {
        let entries = scan(scanner, at_height, block, idx, ReorgDirection::Rewind)?;
        for entry in &entries {
            if inner.retract(entry) {
                summary.removed += 1;
            }
        }
        summary.rewound += 1;
    }

    for (idx, block) in applied.iter().enumerate() {
        let entries = scan(scanner, at_height, block, idx, ReorgDirection::Apply)?;
        for entry in entries {
            if inner.announce(entry) {
                summary.added += 1;
            }
        }
        summary.applied += 1;
    }

    Ok(())
}

fn scan<S: AnnouncementScanner>(
    scanner: &S,
    height: BlockHeight,
    block: &S::Block,
    idx: usize,
    direction: ReorgDirection,
) -> Result<Vec<HostEntry>, UpdateError<S::Error>> {
    scanner.scan(height, block).map_err(|source| {
        warn!(
            "failed to scan {:?} block {} at height {}, aborting reorg",
            direction, idx, height
        );
        UpdateError::Scan {
            height,
            block: idx,
            direction,
            source,
        }
    })
}
