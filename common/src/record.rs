use speedy::{Readable, Writable};

use crate::timestamp::TickConverter;

pub const RECORD_MAGIC: &[u8; 8] = b"TRRECORD";
pub const RECORD_FORMAT_VERSION: u32 = 1;

pub const PROTOCOL_VERSION_MIN: u32 = 1;
pub const PROTOCOL_VERSION_MAX: u32 = 2;

pub const INVALID_IDX: u32 = 0xFFFFFFFF;

/// Where a flushed chunk lives inside the record file, plus the time range
/// it covers. Immutable once written.
#[derive(Copy, Clone, PartialEq, Debug, Readable, Writable)]
pub struct ChunkLoc {
    pub offset: u64,
    pub size: u32,
    pub raw_size: u32,
    pub start_ns: i64,
    pub end_ns: i64
}

impl ChunkLoc {
    #[inline]
    pub fn is_compressed( &self ) -> bool {
        self.size != self.raw_size
    }
}

/// One closed scope. `duration_ns` is the time actually spent inside the
/// scope, excluding any paused interval, so it can be smaller than
/// `end_ns - begin_ns`.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ScopeEvt {
    pub name_idx: u32,
    pub begin_ns: i64,
    pub end_ns: i64,
    pub duration_ns: i64,
    pub alloc_qty: u32,
    pub alloc_size: u64,
    pub dealloc_qty: u32,
    pub dealloc_size: u64
}

pub const GENERIC_EVT_MARKER: u8 = 1;
pub const GENERIC_EVT_ALLOC: u8 = 2;
pub const GENERIC_EVT_DEALLOC: u8 = 3;

/// A non-scope event attached to a nesting level: an in-scope marker or a
/// memory detail record. For memory details `value` is the byte count,
/// possibly covering several merged adjacent allocations.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct GenericEvt {
    pub time_ns: i64,
    pub name_idx: u32,
    pub flags: u8,
    pub value: f64
}

/// One allocation or deallocation. For deallocations `midx` points back at
/// the matching allocation and `size` is the recovered allocation size.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct MemEvt {
    pub time_ns: i64,
    pub pointer: u64,
    pub size: u32,
    pub midx: u32,
    pub scope_elem_idx: u32
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct CtxSwitchEvt {
    pub start_ns: i64,
    pub end_ns: i64,
    pub core_id: u32
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct SoftIrqEvt {
    pub begin_ns: i64,
    pub end_ns: i64,
    pub name_idx: u32
}

pub const LOCK_EVT_WAIT_BEGIN: u8 = 0;
pub const LOCK_EVT_WAIT_END: u8 = 1;
pub const LOCK_EVT_ACQUIRED: u8 = 2;
pub const LOCK_EVT_RELEASED: u8 = 3;
pub const LOCK_EVT_NOTIFIED: u8 = 4;

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct LockEvt {
    pub time_ns: i64,
    pub thread_id: u32,
    pub name_idx: u32,
    pub kind: u8
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct CoreUsageEvt {
    pub time_ns: i64,
    pub core_id: u32,
    pub is_used: bool
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct MarkerEvt {
    pub time_ns: i64,
    pub thread_id: u32,
    pub category_idx: u32,
    pub message_idx: u32
}

/// One sample of an element's value stream. `lidx` links back to the
/// originating record inside the owning thread/level stream.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ElemValue {
    pub time_ns: i64,
    pub value: f64,
    pub lidx: u32
}

/// Density-merged pyramid entry for scope streams: `coverage_ns` is the
/// summed duration of the merged scopes, `lidx` the longest one.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ScopeSpeck {
    pub start_ns: i64,
    pub end_ns: i64,
    pub coverage_ns: i64,
    pub lidx: u32
}

/// Min/max-merged pyramid entry for value streams.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ValueSpeck {
    pub time_ns: i64,
    pub min: f64,
    pub max: f64
}

/// One live allocation inside a memory snapshot chunk.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct MemSnapshotEntry {
    pub midx: u32,
    pub pointer: u64,
    pub size: u32,
    pub time_ns: i64
}

/// Index entry for one memory snapshot: the state of all live allocations
/// of a thread just after its `alloc_midx`-th allocation event.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct MemSnapshot {
    pub time_ns: i64,
    pub alloc_midx: u32,
    pub loc: ChunkLoc
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct StringEntry {
    pub hash: u64,
    pub value: String
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct RecordHeader {
    pub format_version: u32,
    pub app_name: String,
    pub build_name: String,
    pub protocol: u32,
    pub conv: TickConverter,
    pub are_strings_external: bool,
    pub cache_mb: u32
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ElemEntry {
    pub hash_path: u64,
    pub hash_key: u64,
    pub prev_elem_idx: u32,
    pub thread_id: u32,
    pub nesting_level: u32,
    pub name_idx: u32,
    pub hl_name_idx: u32,
    pub flags: u32,
    pub abs_y_min: f64,
    pub abs_y_max: f64,
    pub last_time_ns: i64,
    pub value_locs: Vec< ChunkLoc >,
    pub speck_levels: Vec< Vec< ValueSpeck > >
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct NestingLevelEntry {
    pub scope_locs: Vec< ChunkLoc >,
    pub non_scope_locs: Vec< ChunkLoc >,
    pub scope_speck_levels: Vec< Vec< ScopeSpeck > >
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub thread_hash: u64,
    pub thread_unique_hash: u64,
    pub name_idx: i32,
    pub elem_event_qty: u32,
    pub mem_event_qty: u32,
    pub ctx_switch_event_qty: u32,
    pub lock_event_qty: u32,
    pub marker_event_qty: u32,
    pub dropped_event_qty: u32,
    pub duration_ns: i64,
    pub sum_alloc_qty: u64,
    pub sum_alloc_size: u64,
    pub sum_dealloc_qty: u64,
    pub sum_dealloc_size: u64,
    pub mem_alloc_locs: Vec< ChunkLoc >,
    pub mem_dealloc_locs: Vec< ChunkLoc >,
    pub mem_plot_locs: Vec< ChunkLoc >,
    pub mem_snapshots: Vec< MemSnapshot >,
    pub ctx_switch_locs: Vec< ChunkLoc >,
    pub soft_irq_locs: Vec< ChunkLoc >,
    pub lock_wait_locs: Vec< ChunkLoc >,
    pub levels: Vec< NestingLevelEntry >
}

/// Final state of one lock: if it was still held when the record closed,
/// the holder and the acquisition time are preserved so a reader can show
/// the dangling usage interval.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct LockEntry {
    pub name_idx: u32,
    pub is_in_use: bool,
    pub using_start_thread_id: u32,
    pub using_start_time_ns: i64,
    pub waiting_thread_ids: Vec< u32 >
}

#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct RecError {
    pub kind: u8,
    pub thread_id: u32,
    pub time_ns: i64,
    pub message: String
}

/// The record's top-level index, serialized at finalize time and addressed
/// by the trailing offset word, so a reader can resolve any element,
/// thread, lock or time-range query without a full scan.
#[derive(Clone, PartialEq, Debug, Readable, Writable)]
pub struct RecordIndex {
    pub strings: Vec< StringEntry >,
    pub elems: Vec< ElemEntry >,
    pub threads: Vec< ThreadEntry >,
    pub locks: Vec< LockEntry >,
    pub lock_use_locs: Vec< ChunkLoc >,
    pub lock_ntf_locs: Vec< ChunkLoc >,
    pub core_usage_locs: Vec< ChunkLoc >,
    pub marker_locs: Vec< ChunkLoc >,
    pub marker_category_name_idxs: Vec< u32 >,
    pub core_qty: u32,
    pub used_core_count: u32,
    pub core_is_used: Vec< u8 >,
    pub duration_ns: i64,
    pub elem_event_qty: u32,
    pub mem_event_qty: u32,
    pub lock_event_qty: u32,
    pub marker_event_qty: u32,
    pub ctx_switch_event_qty: u32,
    pub elem_chunk_qty: u32,
    pub errors: Vec< RecError >,
    pub dropped_error_qty: u32
}

/// What changed since the previous delta, for incremental live
/// transmission. Filled in place by the recorder.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Delta {
    pub first_new_string_idx: u32,
    pub new_strings: Vec< StringEntry >,
    pub updated_string_ids: Vec< u32 >,
    pub changed_elem_ids: Vec< u32 >,
    pub changed_lock_ids: Vec< u32 >,
    pub name_updated_thread_ids: Vec< u32 >,
    pub core_usage_changed: bool,
    pub used_core_count: u32,
    pub duration_ns: i64
}

impl Delta {
    pub fn clear( &mut self ) {
        self.first_new_string_idx = 0;
        self.new_strings.clear();
        self.updated_string_ids.clear();
        self.changed_elem_ids.clear();
        self.changed_lock_ids.clear();
        self.name_updated_thread_ids.clear();
        self.core_usage_changed = false;
        self.used_core_count = 0;
        self.duration_ns = 0;
    }

    pub fn is_empty( &self ) -> bool {
        self.new_strings.is_empty()
            && self.updated_string_ids.is_empty()
            && self.changed_elem_ids.is_empty()
            && self.changed_lock_ids.is_empty()
            && self.name_updated_thread_ids.is_empty()
            && !self.core_usage_changed
    }
}
