use std::hash::{Hash, Hasher};

use ahash::AHashSet as HashSet;

use common::record::RecError;

pub const MAX_REC_ERROR_QTY: usize = 64;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RecErrorKind {
    UnmatchedScopeEnd,
    UnknownDealloc,
    DuplicateAlloc,
    DuplicateLockNotify,
    UnmatchedLockWaitEnd,
    UnmatchedLockRelease,
    UnmatchedCtxSwitch,
    UnmatchedSoftIrqEnd,
    UnknownStringHash
}

impl RecErrorKind {
    pub fn as_u8( self ) -> u8 {
        match self {
            RecErrorKind::UnmatchedScopeEnd => 0,
            RecErrorKind::UnknownDealloc => 1,
            RecErrorKind::DuplicateAlloc => 2,
            RecErrorKind::DuplicateLockNotify => 3,
            RecErrorKind::UnmatchedLockWaitEnd => 4,
            RecErrorKind::UnmatchedLockRelease => 5,
            RecErrorKind::UnmatchedCtxSwitch => 6,
            RecErrorKind::UnmatchedSoftIrqEnd => 7,
            RecErrorKind::UnknownStringHash => 8
        }
    }
}

/// Bounded, deduplicated collection of recoverable ingestion errors. Once
/// the bound is reached new distinct errors only bump the drop counter, so
/// a caller can still surface "N errors were dropped".
pub struct ErrorLog {
    errors: Vec< RecError >,
    lookup: HashSet< u64 >,
    dropped_qty: u32,
    max_qty: usize
}

impl ErrorLog {
    pub fn new( max_qty: usize ) -> Self {
        ErrorLog {
            errors: Vec::new(),
            lookup: HashSet::new(),
            dropped_qty: 0,
            max_qty
        }
    }

    /// Records one error. Returns true when the error was actually stored
    /// (i.e. it was neither a duplicate nor dropped for capacity).
    pub fn log( &mut self, kind: RecErrorKind, thread_id: u32, time_ns: i64, message: String ) -> bool {
        let key = {
            let mut hasher = ahash::AHasher::default();
            kind.hash( &mut hasher );
            message.hash( &mut hasher );
            hasher.finish()
        };

        if !self.lookup.insert( key ) {
            return false;
        }

        if self.errors.len() >= self.max_qty {
            self.dropped_qty += 1;
            return false;
        }

        warn!( "recording error on thread {}: {}", thread_id, message );
        self.errors.push( RecError {
            kind: kind.as_u8(),
            thread_id,
            time_ns,
            message
        });
        true
    }

    pub fn errors( &self ) -> &[RecError] {
        &self.errors
    }

    pub fn len( &self ) -> usize {
        self.errors.len()
    }

    pub fn dropped_qty( &self ) -> u32 {
        self.dropped_qty
    }
}
