use speedy::{Readable, Writable};

/// One decoded instrumentation event, as produced by the wire-level decoder.
///
/// Timestamps are raw clock ticks; the recorder converts them to nanoseconds
/// with the tick factor supplied when the record was opened. Name hashes
/// refer to strings previously registered through the recorder's string
/// table.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct Event {
    pub thread_id: u32,
    pub timestamp_ticks: u64,
    pub payload: Payload
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum Payload {
    ScopeBegin {
        name_hash: u64
    },
    ScopeEnd {
        name_hash: u64
    },
    MemAlloc {
        pointer: u64,
        size: u32
    },
    MemDealloc {
        pointer: u64
    },
    MemPlot {
        name_hash: u64,
        value: f64
    },
    CtxSwitchStart {
        core_id: u32
    },
    CtxSwitchStop,
    SoftIrqBegin {
        name_hash: u64
    },
    SoftIrqEnd,
    CoreUsage {
        core_id: u32,
        is_used: bool
    },
    Marker {
        category_hash: u64,
        message_hash: u64
    },
    LockWaitBegin {
        lock_hash: u64
    },
    LockWaitEnd {
        lock_hash: u64
    },
    LockUse {
        lock_hash: u64,
        is_acquired: bool
    },
    LockNotify {
        lock_hash: u64
    },
    ThreadName {
        name_hash: u64
    }
}

impl Event {
    pub fn new( thread_id: u32, timestamp_ticks: u64, payload: Payload ) -> Self {
        Event { thread_id, timestamp_ticks, payload }
    }
}
