use std::cmp;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ahash::AHashMap as HashMap;
use smallvec::SmallVec;

use common::event::{Event, Payload};
use common::record::{
    CoreUsageEvt,
    CtxSwitchEvt,
    Delta,
    ElemEntry,
    ElemValue,
    GenericEvt,
    LockEntry,
    LockEvt,
    MarkerEvt,
    MemEvt,
    MemSnapshot,
    MemSnapshotEntry,
    NestingLevelEntry,
    RecError,
    RecordHeader,
    RecordIndex,
    ScopeEvt,
    SoftIrqEvt,
    ThreadEntry,
    GENERIC_EVT_ALLOC,
    GENERIC_EVT_DEALLOC,
    GENERIC_EVT_MARKER,
    INVALID_IDX,
    LOCK_EVT_ACQUIRED,
    LOCK_EVT_NOTIFIED,
    LOCK_EVT_RELEASED,
    LOCK_EVT_WAIT_BEGIN,
    LOCK_EVT_WAIT_END,
    PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
    RECORD_FORMAT_VERSION
};
use common::speedy::Writable;
use common::TickConverter;

use crate::chunk::ChunkStream;
use crate::errlog::{ErrorLog, RecErrorKind, MAX_REC_ERROR_QTY};
use crate::pyramid::{ScopePyramid, ValuePyramid};
use crate::strings::StringTable;
use crate::writer::RecordWriter;

pub const MAX_CORE_QTY: usize = 256;

const HASH_SEED: u64 = 0xCBF29CE484222325;
const PLOT_SALT: u64 = 0x9E3779B97F4A7C15;

#[inline]
fn hash_step( prev: u64, value: u64 ) -> u64 {
    (prev ^ value).wrapping_mul( 0x100000001B3 )
}

bitflags! {
    pub struct ElemFlags: u32 {
        /// The element is a call-tree scope; its pyramid merges toward
        /// density. Unset means a value stream merging toward min/max.
        const SCOPE = 1;
        /// Part of the main hierarchical structure, suitable for searching.
        const PART_OF_HSTRUCT = 2;
        /// The hash path has a final thread-specific step.
        const THREAD_HASHED = 4;
    }
}

/// Aggregation tunables. The defaults target a desktop-class recording
/// budget; all of them are explicit so a host can trade memory for query
/// latency.
#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub chunk_capacity: usize,
    pub speck_factor: usize,
    pub snapshot_event_interval: u32,
    pub compression: bool,
    pub max_error_qty: usize
}

impl Default for RecordingConfig {
    fn default() -> Self {
        RecordingConfig {
            chunk_capacity: 256,
            speck_factor: 8,
            snapshot_event_interval: 1024,
            compression: true,
            max_error_qty: MAX_REC_ERROR_QTY
        }
    }
}

/// Notification seam toward an attached live viewer. Forwarded calls happen
/// synchronously during ingestion, independent of persistence.
pub trait EventSink {
    fn notify_marker( &mut self, _thread_id: u32, _time_ns: i64, _category: &str, _message: &str ) {}
    fn notify_lock_notified( &mut self, _thread_id: u32, _time_ns: i64, _lock_name: &str ) {}
    fn notify_error( &mut self, _thread_id: u32, _time_ns: i64, _message: &str ) {}
}

pub struct NullSink;

impl EventSink for NullSink {}

#[derive(Debug)]
pub enum BeginError {
    AlreadyRecording,
    RecordingDisabled,
    UnsupportedProtocol {
        got: u32
    },
    StoragePathNotWritable {
        path: PathBuf,
        error: io::Error
    },
    NameCollision {
        path: PathBuf
    },
    Io( io::Error )
}

impl fmt::Display for BeginError {
    fn fmt( &self, formatter: &mut fmt::Formatter ) -> fmt::Result {
        match self {
            BeginError::AlreadyRecording => {
                write!( formatter, "a record is already in progress" )
            },
            BeginError::RecordingDisabled => {
                write!( formatter, "recording is disabled" )
            },
            BeginError::UnsupportedProtocol { got } => {
                write!( formatter, "unsupported protocol version {} (supported: {}..={})", got, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX )
            },
            BeginError::StoragePathNotWritable { path, error } => {
                write!( formatter, "storage path {:?} is not writable: {}", path, error )
            },
            BeginError::NameCollision { path } => {
                write!( formatter, "a record named {:?} already exists", path )
            },
            BeginError::Io( error ) => {
                write!( formatter, "i/o error while opening the record: {}", error )
            }
        }
    }
}

impl std::error::Error for BeginError {}

// One pause/resume lane. `active_since_ns` is set only while the lane is
// both open and being stored; `active_ns` accumulates the stored portions,
// so a close while paused yields nothing and a close after a resume yields
// only the non-paused time.
#[derive(Clone, Default)]
struct PauseState {
    begin_ns: i64,
    active_since_ns: Option< i64 >,
    active_ns: i64,
    is_open: bool,
    name_idx: u32
}

impl PauseState {
    fn open( &mut self, time_ns: i64, storing: bool ) {
        self.begin_ns = time_ns;
        self.active_ns = 0;
        self.active_since_ns = if storing { Some( time_ns ) } else { None };
        self.is_open = true;
    }

    fn close( &mut self, time_ns: i64 ) -> Option< (i64, i64) > {
        if !self.is_open {
            return None;
        }

        self.is_open = false;
        match self.active_since_ns.take() {
            Some( since ) => {
                self.active_ns += time_ns - since;
                Some( (self.begin_ns, self.active_ns) )
            },
            None => None
        }
    }

    fn pause( &mut self, time_ns: i64 ) {
        if let Some( since ) = self.active_since_ns.take() {
            self.active_ns += time_ns - since;
        }
    }

    fn resume( &mut self, time_ns: i64 ) {
        if self.is_open && self.active_since_ns.is_none() {
            self.active_since_ns = Some( time_ns );
        }
    }
}

// One currently live allocation, keyed by pointer in the global lookup.
struct VMemAlloc {
    thread_id: u32,
    size: u32,
    slot_idx: u32,
    scope_elem_idx: u32
}

struct ElemBuild {
    hash_path: u64,
    hash_key: u64,
    prev_elem_idx: u32,
    thread_id: u32,
    nesting_level: u32,
    name_idx: u32,
    hl_name_idx: u32,
    flags: ElemFlags,
    abs_y_min: f64,
    abs_y_max: f64,
    last_time_ns: i64,
    has_delta_changes: bool,
    values: ChunkStream< ElemValue >,
    pyramid: ValuePyramid
}

struct LockBuild {
    name_idx: u32,
    is_in_use: bool,
    using_start_thread_id: u32,
    using_start_time_ns: i64,
    waiting_thread_ids: SmallVec< [u32; 4] >,
    last_notify_thread_id: Option< u32 >,
    has_delta_changes: bool
}

struct LockWaitLane {
    name_idx: u32,
    begin_stored: bool
}

struct NestingLevelBuild {
    scope: ChunkStream< ScopeEvt >,
    non_scope: ChunkStream< GenericEvt >,
    scope_pyramid: ScopePyramid,
    // Working info for the currently open scope at this depth.
    hash_path: u64,
    elem_idx: u32,
    name_idx: u32,
    parent_name_idx: u32,
    pause: PauseState,
    begin_sum_alloc_qty: u64,
    begin_sum_alloc_size: u64,
    begin_sum_dealloc_qty: u64,
    begin_sum_dealloc_size: u64,
    // Adjacent memory detail records merge in place while they are still
    // buffered; these remember what the tail record covers.
    last_alloc_ptr: u64,
    last_dealloc_ptr: u64,
    last_alloc_size: u32
}

impl NestingLevelBuild {
    fn new( config: &RecordingConfig ) -> Self {
        NestingLevelBuild {
            scope: ChunkStream::new( config.chunk_capacity ),
            non_scope: ChunkStream::new( config.chunk_capacity ),
            scope_pyramid: ScopePyramid::new( config.speck_factor, config.chunk_capacity ),
            hash_path: 0,
            elem_idx: INVALID_IDX,
            name_idx: INVALID_IDX,
            parent_name_idx: INVALID_IDX,
            pause: PauseState::default(),
            begin_sum_alloc_qty: 0,
            begin_sum_alloc_size: 0,
            begin_sum_dealloc_qty: 0,
            begin_sum_dealloc_size: 0,
            last_alloc_ptr: 0,
            last_dealloc_ptr: 0,
            last_alloc_size: 0
        }
    }
}

struct ThreadBuild {
    thread_hash: u64,
    thread_unique_hash: u64,
    name_idx: i32,
    name_delta_pending: bool,
    cur_level: usize,
    elem_event_qty: u32,
    mem_event_qty: u32,
    ctx_switch_event_qty: u32,
    lock_event_qty: u32,
    marker_event_qty: u32,
    dropped_event_qty: u32,
    duration_ns: i64,
    // Memory accounting.
    sum_alloc_qty: u64,
    sum_alloc_size: u64,
    sum_dealloc_qty: u64,
    sum_dealloc_size: u64,
    last_is_alloc: bool,
    mem_event_qty_before_snapshot: u32,
    mem_ss_slots: Vec< MemSnapshotEntry >,
    mem_ss_empty_idx: Vec< u32 >,
    mem_snapshots: Vec< MemSnapshot >,
    mem_alloc: ChunkStream< MemEvt >,
    mem_dealloc: ChunkStream< MemEvt >,
    mem_plot: ChunkStream< GenericEvt >,
    // Context switches & soft IRQs.
    ctx_switch: ChunkStream< CtxSwitchEvt >,
    ctx_switch_open: Option< (i64, u32) >,
    soft_irq: ChunkStream< SoftIrqEvt >,
    soft_irq_pause: PauseState,
    // Lock waits (a stack, as waits can nest).
    lock_wait: ChunkStream< LockEvt >,
    lock_wait_lanes: Vec< LockWaitLane >,
    levels: Vec< NestingLevelBuild >
}

impl ThreadBuild {
    fn new( thread_id: u32, config: &RecordingConfig ) -> Self {
        let thread_hash = hash_step( HASH_SEED, u64::from( thread_id ) + 1 );
        ThreadBuild {
            thread_hash,
            thread_unique_hash: thread_hash,
            name_idx: -1,
            name_delta_pending: false,
            cur_level: 0,
            elem_event_qty: 0,
            mem_event_qty: 0,
            ctx_switch_event_qty: 0,
            lock_event_qty: 0,
            marker_event_qty: 0,
            dropped_event_qty: 0,
            duration_ns: 0,
            sum_alloc_qty: 0,
            sum_alloc_size: 0,
            sum_dealloc_qty: 0,
            sum_dealloc_size: 0,
            last_is_alloc: false,
            mem_event_qty_before_snapshot: config.snapshot_event_interval,
            mem_ss_slots: Vec::new(),
            mem_ss_empty_idx: Vec::new(),
            mem_snapshots: Vec::new(),
            mem_alloc: ChunkStream::new( config.chunk_capacity ),
            mem_dealloc: ChunkStream::new( config.chunk_capacity ),
            mem_plot: ChunkStream::new( config.chunk_capacity ),
            ctx_switch: ChunkStream::new( config.chunk_capacity ),
            ctx_switch_open: None,
            soft_irq: ChunkStream::new( config.chunk_capacity ),
            soft_irq_pause: PauseState::default(),
            lock_wait: ChunkStream::new( config.chunk_capacity ),
            lock_wait_lanes: Vec::new(),
            levels: Vec::new()
        }
    }
}

struct GlobalBuild {
    lock_use: ChunkStream< LockEvt >,
    lock_ntf: ChunkStream< LockEvt >,
    core_usage: ChunkStream< CoreUsageEvt >,
    marker: ChunkStream< MarkerEvt >
}

impl GlobalBuild {
    fn new( config: &RecordingConfig ) -> Self {
        GlobalBuild {
            lock_use: ChunkStream::new( config.chunk_capacity ),
            lock_ntf: ChunkStream::new( config.chunk_capacity ),
            core_usage: ChunkStream::new( config.chunk_capacity ),
            marker: ChunkStream::new( config.chunk_capacity )
        }
    }
}

fn mark_elem_changed( elem: &mut ElemBuild, elem_idx: u32, updated_elem_ids: &mut Vec< u32 > ) {
    if !elem.has_delta_changes {
        elem.has_delta_changes = true;
        updated_elem_ids.push( elem_idx );
    }
}

fn write_elem_chunk( elem: &mut ElemBuild, writer: &mut RecordWriter, is_last: bool, elem_chunk_qty: &mut u32 ) -> io::Result< () > {
    if elem.values.buffered().is_empty() {
        return Ok(());
    }

    elem.pyramid.on_chunk_flushed( elem.values.buffered() );
    elem.values.flush( writer, is_last )?;
    *elem_chunk_qty += 1;
    Ok(())
}

fn push_elem_value( elem: &mut ElemBuild, writer: &mut RecordWriter, time_ns: i64, value: f64, lidx: u32, storing: bool, elem_chunk_qty: &mut u32 ) -> io::Result< () > {
    elem.abs_y_min = elem.abs_y_min.min( value );
    elem.abs_y_max = elem.abs_y_max.max( value );
    elem.last_time_ns = time_ns;
    if !storing {
        return Ok(());
    }

    elem.values.push( ElemValue { time_ns, value, lidx } );
    if elem.values.is_full() {
        write_elem_chunk( elem, writer, false, elem_chunk_qty )?;
    }

    Ok(())
}

fn write_scope_chunk( lc: &mut NestingLevelBuild, writer: &mut RecordWriter, is_last: bool, elem_chunk_qty: &mut u32 ) -> io::Result< () > {
    if lc.scope.buffered().is_empty() {
        return Ok(());
    }

    let base_lidx = lc.scope.first_lidx();
    lc.scope_pyramid.on_chunk_flushed( lc.scope.buffered(), base_lidx );
    lc.scope.flush( writer, is_last )?;
    *elem_chunk_qty += 1;
    Ok(())
}

fn save_thread_memory_snapshot( tc: &mut ThreadBuild, writer: &mut RecordWriter, time_ns: i64, alloc_midx: u32 ) -> io::Result< () > {
    let live: Vec< MemSnapshotEntry > = tc.mem_ss_slots
        .iter()
        .filter( |slot| slot.midx != INVALID_IDX )
        .cloned()
        .collect();

    let bytes = live
        .write_to_vec()
        .map_err( |error| io::Error::new( io::ErrorKind::Other, error.to_string() ) )?;
    let mut loc = writer.write_chunk( &bytes )?;
    loc.start_ns = time_ns;
    loc.end_ns = time_ns;
    tc.mem_snapshots.push( MemSnapshot { time_ns, alloc_midx, loc } );
    Ok(())
}

fn ensure_thread< 'a >( threads: &'a mut HashMap< u32, ThreadBuild >, config: &RecordingConfig, thread_id: u32, time_ns: i64 ) -> &'a mut ThreadBuild {
    let tc = threads
        .entry( thread_id )
        .or_insert_with( || ThreadBuild::new( thread_id, config ) );
    tc.duration_ns = cmp::max( tc.duration_ns, time_ns );
    tc
}

fn register_elem(
    elems: &mut Vec< ElemBuild >,
    elem_path_to_idx: &mut HashMap< u64, u32 >,
    elem_name_chain_head: &mut HashMap< u64, u32 >,
    updated_elem_ids: &mut Vec< u32 >,
    config: &RecordingConfig,
    hash_path: u64,
    name_hash: u64,
    name_idx: u32,
    thread_id: u32,
    nesting_level: u32,
    flags: ElemFlags
) -> u32 {
    if let Some( &idx ) = elem_path_to_idx.get( &hash_path ) {
        return idx;
    }

    let idx = elems.len() as u32;
    // The previous head of this name's chain becomes our predecessor, so a
    // name-hash lookup can walk every element sharing the name.
    let prev_elem_idx = elem_name_chain_head.insert( name_hash, idx ).unwrap_or( INVALID_IDX );
    let mut elem = ElemBuild {
        hash_path,
        hash_key: name_hash,
        prev_elem_idx,
        thread_id,
        nesting_level,
        name_idx,
        hl_name_idx: name_idx,
        flags,
        abs_y_min: 1e300,
        abs_y_max: -1e300,
        last_time_ns: 0,
        has_delta_changes: false,
        values: ChunkStream::new( config.chunk_capacity ),
        pyramid: ValuePyramid::new( config.speck_factor, config.chunk_capacity )
    };
    mark_elem_changed( &mut elem, idx, updated_elem_ids );
    elems.push( elem );
    elem_path_to_idx.insert( hash_path, idx );
    idx
}

struct RecordState {
    writer: RecordWriter,
    record_path: PathBuf,
    conv: TickConverter,
    is_live: bool,
    are_strings_external: bool,
    config: RecordingConfig,
    strings: StringTable,
    elems: Vec< ElemBuild >,
    elem_path_to_idx: HashMap< u64, u32 >,
    elem_name_chain_head: HashMap< u64, u32 >,
    locks: Vec< LockBuild >,
    lock_name_to_idx: HashMap< u64, u32 >,
    threads: HashMap< u32, ThreadBuild >,
    global: GlobalBuild,
    mem_alloc_lkup: HashMap< u64, VMemAlloc >,
    marker_category_name_idxs: Vec< u32 >,
    duration_ns: i64,
    core_qty: u32,
    used_core_count: u32,
    core_is_used: [bool; MAX_CORE_QTY],
    elem_event_qty: u32,
    mem_event_qty: u32,
    lock_event_qty: u32,
    marker_event_qty: u32,
    ctx_switch_event_qty: u32,
    elem_chunk_qty: u32,
    request_pause: bool,
    request_resume: bool,
    no_storing: bool,
    failed: bool,
    errors: ErrorLog,
    // Delta bookkeeping.
    last_size_strings: u32,
    updated_elem_ids: Vec< u32 >,
    updated_lock_ids: Vec< u32 >,
    name_updated_thread_ids: Vec< u32 >,
    core_usage_changed: bool
}

impl RecordState {
    #[inline]
    fn storing( &self ) -> bool {
        !self.no_storing && !self.failed
    }

    fn log_error( &mut self, sink: &mut dyn EventSink, kind: RecErrorKind, thread_id: u32, time_ns: i64, message: String ) {
        if self.errors.log( kind, thread_id, time_ns, message.clone() ) {
            sink.notify_error( thread_id, time_ns, &message );
        }
    }

    // Pause/resume requests are latched by do_pause_storing() and applied
    // here, at the next event boundary, so every lane sees a consistent
    // switch-over time.
    fn apply_pause_requests( &mut self, time_ns: i64 ) -> io::Result< () > {
        if self.request_pause && !self.no_storing {
            self.no_storing = true;
            for (_, tc) in self.threads.iter_mut() {
                for level in 0..tc.cur_level {
                    tc.levels[ level ].pause.pause( time_ns );
                }
                tc.soft_irq_pause.pause( time_ns );
            }

            // Close still-open lock waits so the stored stream stays
            // matched across the gap.
            let storing_end: Vec< u32 > = self.threads
                .iter()
                .filter( |(_, tc)| tc.lock_wait_lanes.iter().any( |lane| lane.begin_stored ) )
                .map( |(&tid, _)| tid )
                .collect();
            for tid in storing_end {
                let tc = self.threads.get_mut( &tid ).unwrap();
                for lane_idx in 0..tc.lock_wait_lanes.len() {
                    if tc.lock_wait_lanes[ lane_idx ].begin_stored {
                        tc.lock_wait_lanes[ lane_idx ].begin_stored = false;
                        let name_idx = tc.lock_wait_lanes[ lane_idx ].name_idx;
                        tc.lock_wait.push( LockEvt { time_ns, thread_id: tid, name_idx, kind: LOCK_EVT_WAIT_END } );
                        if tc.lock_wait.is_full() {
                            tc.lock_wait.flush( &mut self.writer, false )?;
                        }
                    }
                }
            }
        }

        if self.request_resume && self.no_storing {
            self.no_storing = false;
            let tids: Vec< u32 > = self.threads.keys().cloned().collect();
            for tid in tids {
                let tc = self.threads.get_mut( &tid ).unwrap();
                for level in 0..tc.cur_level {
                    tc.levels[ level ].pause.resume( time_ns );
                }
                tc.soft_irq_pause.resume( time_ns );

                if !self.failed {
                    for lane_idx in 0..tc.lock_wait_lanes.len() {
                        if !tc.lock_wait_lanes[ lane_idx ].begin_stored {
                            tc.lock_wait_lanes[ lane_idx ].begin_stored = true;
                            let name_idx = tc.lock_wait_lanes[ lane_idx ].name_idx;
                            tc.lock_wait.push( LockEvt { time_ns, thread_id: tid, name_idx, kind: LOCK_EVT_WAIT_BEGIN } );
                            if tc.lock_wait.is_full() {
                                tc.lock_wait.flush( &mut self.writer, false )?;
                            }
                        }
                    }
                }
            }
        }

        self.request_pause = false;
        self.request_resume = false;
        Ok(())
    }

    // When strings are not declared external, every referenced hash must
    // have been registered beforehand; an unknown one still resolves to a
    // placeholder, but is reported as a recoverable anomaly.
    fn check_string_hashes( &mut self, thread_id: u32, time_ns: i64, payload: &Payload, sink: &mut dyn EventSink ) {
        if self.are_strings_external {
            return;
        }

        let hashes: [Option< u64 >; 2] = match *payload {
            Payload::ScopeBegin { name_hash }
                | Payload::MemPlot { name_hash, .. }
                | Payload::SoftIrqBegin { name_hash }
                | Payload::ThreadName { name_hash } => [Some( name_hash ), None],
            Payload::Marker { category_hash, message_hash } => [Some( category_hash ), Some( message_hash )],
            Payload::LockWaitBegin { lock_hash }
                | Payload::LockWaitEnd { lock_hash }
                | Payload::LockUse { lock_hash, .. }
                | Payload::LockNotify { lock_hash } => [Some( lock_hash ), None],
            _ => [None, None]
        };

        for hash in hashes.iter().copied().flatten() {
            if self.strings.idx_of( hash ).is_none() {
                self.log_error(
                    sink,
                    RecErrorKind::UnknownStringHash,
                    thread_id,
                    time_ns,
                    format!( "reference to an unregistered string hash 0x{:016X}", hash )
                );
            }
        }
    }

    fn process_event( &mut self, event: &Event, time_ns: i64, sink: &mut dyn EventSink, do_forward_events: bool ) -> io::Result< () > {
        let thread_id = event.thread_id;
        if !self.storing() {
            ensure_thread( &mut self.threads, &self.config, thread_id, time_ns ).dropped_event_qty += 1;
        }

        self.check_string_hashes( thread_id, time_ns, &event.payload, sink );
        match event.payload {
            Payload::ScopeBegin { name_hash } => {
                self.process_scope_begin( thread_id, time_ns, name_hash )
            },
            Payload::ScopeEnd { .. } => {
                self.process_scope_end( thread_id, time_ns, sink )
            },
            Payload::MemAlloc { pointer, size } => {
                self.process_mem_alloc( thread_id, time_ns, pointer, size, sink )
            },
            Payload::MemDealloc { pointer } => {
                self.process_mem_dealloc( thread_id, time_ns, pointer, sink )
            },
            Payload::MemPlot { name_hash, value } => {
                self.process_mem_plot( thread_id, time_ns, name_hash, value )
            },
            Payload::CtxSwitchStart { core_id } => {
                self.process_ctx_switch_start( thread_id, time_ns, core_id )
            },
            Payload::CtxSwitchStop => {
                self.process_ctx_switch_stop( thread_id, time_ns, sink )
            },
            Payload::SoftIrqBegin { name_hash } => {
                self.process_soft_irq_begin( thread_id, time_ns, name_hash )
            },
            Payload::SoftIrqEnd => {
                self.process_soft_irq_end( thread_id, time_ns, sink )
            },
            Payload::CoreUsage { core_id, is_used } => {
                if self.process_core_usage_event( time_ns, core_id, is_used )? {
                    self.core_usage_changed = true;
                }
                Ok(())
            },
            Payload::Marker { category_hash, message_hash } => {
                self.process_marker_event( thread_id, time_ns, category_hash, message_hash, sink, do_forward_events )
            },
            Payload::LockWaitBegin { lock_hash } => {
                self.process_lock_wait_begin( thread_id, time_ns, lock_hash )
            },
            Payload::LockWaitEnd { lock_hash } => {
                self.process_lock_wait_end( thread_id, time_ns, lock_hash, false, sink )
            },
            Payload::LockUse { lock_hash, is_acquired } => {
                let insert_wait_end = self.process_lock_use_event( thread_id, time_ns, lock_hash, is_acquired, sink )?;
                if insert_wait_end {
                    // The acquiring thread stopped waiting without an
                    // explicit wait-end on the wire; synthesize one.
                    self.process_lock_wait_end( thread_id, time_ns, lock_hash, true, sink )?;
                }
                Ok(())
            },
            Payload::LockNotify { lock_hash } => {
                self.process_lock_notify_event( thread_id, time_ns, lock_hash, sink, do_forward_events )
            },
            Payload::ThreadName { name_hash } => {
                self.process_thread_name( thread_id, time_ns, name_hash )
            }
        }
    }

    fn process_scope_begin( &mut self, thread_id: u32, time_ns: i64, name_hash: u64 ) -> io::Result< () > {
        let name_idx = self.strings.idx_for_hash( name_hash );
        let storing = self.storing();

        let (hash_path, level, parent_name_idx) = {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            let level = tc.cur_level;
            if tc.levels.len() <= level {
                tc.levels.push( NestingLevelBuild::new( &self.config ) );
            }

            let (parent_hash, parent_name_idx) = if level == 0 {
                (hash_step( HASH_SEED, tc.thread_unique_hash ), INVALID_IDX)
            } else {
                (tc.levels[ level - 1 ].hash_path, tc.levels[ level - 1 ].name_idx)
            };

            (hash_step( parent_hash, name_hash ), level, parent_name_idx)
        };

        let elem_idx = register_elem(
            &mut self.elems,
            &mut self.elem_path_to_idx,
            &mut self.elem_name_chain_head,
            &mut self.updated_elem_ids,
            &self.config,
            hash_path,
            name_hash,
            name_idx,
            thread_id,
            level as u32,
            ElemFlags::SCOPE | ElemFlags::PART_OF_HSTRUCT | ElemFlags::THREAD_HASHED
        );

        let tc = self.threads.get_mut( &thread_id ).unwrap();
        let sums = (tc.sum_alloc_qty, tc.sum_alloc_size, tc.sum_dealloc_qty, tc.sum_dealloc_size);
        let lc = &mut tc.levels[ level ];
        lc.hash_path = hash_path;
        lc.elem_idx = elem_idx;
        lc.name_idx = name_idx;
        lc.parent_name_idx = parent_name_idx;
        lc.begin_sum_alloc_qty = sums.0;
        lc.begin_sum_alloc_size = sums.1;
        lc.begin_sum_dealloc_qty = sums.2;
        lc.begin_sum_dealloc_size = sums.3;
        lc.last_alloc_ptr = 0;
        lc.last_dealloc_ptr = 0;
        lc.last_alloc_size = 0;
        lc.pause.open( time_ns, storing );
        tc.cur_level += 1;
        tc.elem_event_qty += 1;
        self.elem_event_qty += 1;
        Ok(())
    }

    fn process_scope_end( &mut self, thread_id: u32, time_ns: i64, sink: &mut dyn EventSink ) -> io::Result< () > {
        {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            if tc.cur_level == 0 {
                self.log_error(
                    sink,
                    RecErrorKind::UnmatchedScopeEnd,
                    thread_id,
                    time_ns,
                    format!( "scope end without a matching begin on thread {}", thread_id )
                );
                return Ok(());
            }

            tc.elem_event_qty += 1;
        }

        self.elem_event_qty += 1;
        self.close_top_scope( thread_id, time_ns )
    }

    // Closes the deepest open scope of the thread; shared by the normal
    // scope-end path and the force-close at record teardown.
    fn close_top_scope( &mut self, thread_id: u32, time_ns: i64 ) -> io::Result< () > {
        let tc = self.threads.get_mut( &thread_id ).unwrap();
        tc.cur_level -= 1;
        let level = tc.cur_level;
        let sums = (tc.sum_alloc_qty, tc.sum_alloc_size, tc.sum_dealloc_qty, tc.sum_dealloc_size);
        let lc = &mut tc.levels[ level ];

        let closed = lc.pause.close( time_ns );
        let (begin_ns, active_ns) = match closed {
            Some( pair ) => pair,
            None => return Ok(()) // paused for the whole remainder; nothing stored
        };

        if self.failed {
            return Ok(());
        }

        let scope = ScopeEvt {
            name_idx: lc.name_idx,
            begin_ns,
            end_ns: time_ns,
            duration_ns: active_ns,
            alloc_qty: sums.0.saturating_sub( lc.begin_sum_alloc_qty ) as u32,
            alloc_size: sums.1.saturating_sub( lc.begin_sum_alloc_size ),
            dealloc_qty: sums.2.saturating_sub( lc.begin_sum_dealloc_qty ) as u32,
            dealloc_size: sums.3.saturating_sub( lc.begin_sum_dealloc_size )
        };

        lc.scope.push( scope );
        let lidx = lc.scope.total_len() - 1;
        if lc.scope.is_full() {
            write_scope_chunk( lc, &mut self.writer, false, &mut self.elem_chunk_qty )?;
        }

        let elem_idx = lc.elem_idx;
        let elem = &mut self.elems[ elem_idx as usize ];
        mark_elem_changed( elem, elem_idx, &mut self.updated_elem_ids );
        push_elem_value( elem, &mut self.writer, time_ns, active_ns as f64, lidx, true, &mut self.elem_chunk_qty )
    }

    fn process_mem_alloc( &mut self, thread_id: u32, time_ns: i64, pointer: u64, size: u32, sink: &mut dyn EventSink ) -> io::Result< () > {
        if self.mem_alloc_lkup.contains_key( &pointer ) {
            self.log_error(
                sink,
                RecErrorKind::DuplicateAlloc,
                thread_id,
                time_ns,
                format!( "duplicate allocation of 0x{:016X}", pointer )
            );
            return Ok(());
        }

        let storing = self.storing();
        let interval = self.config.snapshot_event_interval;
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.mem_event_qty += 1;
        self.mem_event_qty += 1;

        let midx = tc.mem_alloc.total_len();
        let scope_elem_idx = if tc.cur_level > 0 {
            tc.levels[ tc.cur_level - 1 ].elem_idx
        } else {
            INVALID_IDX
        };

        let entry = MemSnapshotEntry { midx, pointer, size, time_ns };
        let slot_idx = match tc.mem_ss_empty_idx.pop() {
            Some( slot_idx ) => {
                tc.mem_ss_slots[ slot_idx as usize ] = entry;
                slot_idx
            },
            None => {
                tc.mem_ss_slots.push( entry );
                (tc.mem_ss_slots.len() - 1) as u32
            }
        };

        tc.sum_alloc_qty += 1;
        tc.sum_alloc_size += u64::from( size );

        if storing {
            tc.mem_alloc.push( MemEvt { time_ns, pointer, size, midx, scope_elem_idx } );
            if tc.mem_alloc.is_full() {
                tc.mem_alloc.flush( &mut self.writer, false )?;
            }
        }

        // In-scope memory detail. A run of allocations collapses into the
        // tail record while it is still buffered.
        if storing && tc.cur_level > 0 {
            let last_is_alloc = tc.last_is_alloc;
            let lc = &mut tc.levels[ tc.cur_level - 1 ];
            let merged = last_is_alloc && lc.last_alloc_ptr != 0 && match lc.non_scope.last_buffered_mut() {
                Some( last ) if last.flags == GENERIC_EVT_ALLOC => {
                    last.value += f64::from( size );
                    true
                },
                _ => false
            };
            if !merged {
                lc.non_scope.push( GenericEvt { time_ns, name_idx: lc.name_idx, flags: GENERIC_EVT_ALLOC, value: f64::from( size ) } );
                if lc.non_scope.is_full() {
                    lc.non_scope.flush( &mut self.writer, false )?;
                }
            }

            lc.last_alloc_ptr = pointer;
            lc.last_alloc_size = size;
        }
        tc.last_is_alloc = true;

        tc.mem_event_qty_before_snapshot = tc.mem_event_qty_before_snapshot.saturating_sub( 1 );
        if tc.mem_event_qty_before_snapshot == 0 && storing {
            let alloc_midx = tc.mem_alloc.total_len();
            save_thread_memory_snapshot( tc, &mut self.writer, time_ns, alloc_midx )?;
            tc.mem_event_qty_before_snapshot = interval;
        }

        self.mem_alloc_lkup.insert( pointer, VMemAlloc { thread_id, size, slot_idx, scope_elem_idx } );
        Ok(())
    }

    fn process_mem_dealloc( &mut self, thread_id: u32, time_ns: i64, pointer: u64, sink: &mut dyn EventSink ) -> io::Result< () > {
        let valloc = match self.mem_alloc_lkup.remove( &pointer ) {
            Some( valloc ) => valloc,
            None => {
                ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
                self.log_error(
                    sink,
                    RecErrorKind::UnknownDealloc,
                    thread_id,
                    time_ns,
                    format!( "deallocation of unknown address 0x{:016X}", pointer )
                );
                return Ok(());
            }
        };

        // Free the snapshot slot on the allocating thread; the size is
        // recovered from the allocation as the wire format omits it here.
        let midx;
        {
            let owner = self.threads.get_mut( &valloc.thread_id ).unwrap();
            let slot = &mut owner.mem_ss_slots[ valloc.slot_idx as usize ];
            midx = slot.midx;
            slot.midx = INVALID_IDX;
            owner.mem_ss_empty_idx.push( valloc.slot_idx );
        }

        let storing = self.storing();
        let interval = self.config.snapshot_event_interval;
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.mem_event_qty += 1;
        self.mem_event_qty += 1;
        tc.sum_dealloc_qty += 1;
        tc.sum_dealloc_size += u64::from( valloc.size );

        if storing {
            tc.mem_dealloc.push( MemEvt {
                time_ns,
                pointer,
                size: valloc.size,
                midx,
                scope_elem_idx: valloc.scope_elem_idx
            });
            if tc.mem_dealloc.is_full() {
                tc.mem_dealloc.flush( &mut self.writer, false )?;
            }
        }

        if storing && tc.cur_level > 0 {
            let last_is_alloc = tc.last_is_alloc;
            let lc = &mut tc.levels[ tc.cur_level - 1 ];
            let mut handled = false;

            // A transient allocation freed straight after its creation folds
            // back into its own detail record instead of leaving a pair.
            if last_is_alloc && lc.last_alloc_ptr == pointer {
                if let Some( last ) = lc.non_scope.last_buffered_mut() {
                    if last.flags == GENERIC_EVT_ALLOC {
                        last.value -= f64::from( lc.last_alloc_size );
                        if last.value <= 0.0 {
                            lc.non_scope.pop_buffered();
                        }
                        handled = true;
                    }
                }
                lc.last_alloc_ptr = 0;
            }

            if !handled {
                let merged = !last_is_alloc && lc.last_dealloc_ptr != 0 && match lc.non_scope.last_buffered_mut() {
                    Some( last ) if last.flags == GENERIC_EVT_DEALLOC => {
                        last.value += f64::from( valloc.size );
                        true
                    },
                    _ => false
                };
                if !merged {
                    lc.non_scope.push( GenericEvt { time_ns, name_idx: lc.name_idx, flags: GENERIC_EVT_DEALLOC, value: f64::from( valloc.size ) } );
                    if lc.non_scope.is_full() {
                        lc.non_scope.flush( &mut self.writer, false )?;
                    }
                }
            }

            lc.last_dealloc_ptr = pointer;
        }
        tc.last_is_alloc = false;

        tc.mem_event_qty_before_snapshot = tc.mem_event_qty_before_snapshot.saturating_sub( 1 );
        if tc.mem_event_qty_before_snapshot == 0 && storing {
            let alloc_midx = tc.mem_alloc.total_len();
            save_thread_memory_snapshot( tc, &mut self.writer, time_ns, alloc_midx )?;
            tc.mem_event_qty_before_snapshot = interval;
        }

        Ok(())
    }

    fn process_mem_plot( &mut self, thread_id: u32, time_ns: i64, name_hash: u64, value: f64 ) -> io::Result< () > {
        let name_idx = self.strings.idx_for_hash( name_hash );
        let storing = self.storing();
        let (hash_path, lidx) = {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            tc.mem_event_qty += 1;
            let hash_path = hash_step(
                hash_step( hash_step( HASH_SEED, tc.thread_unique_hash ), PLOT_SALT ),
                name_hash
            );
            let lidx = tc.mem_plot.total_len();
            if storing {
                tc.mem_plot.push( GenericEvt { time_ns, name_idx, flags: 0, value } );
            }
            (hash_path, lidx)
        };
        self.mem_event_qty += 1;

        if storing {
            let tc = self.threads.get_mut( &thread_id ).unwrap();
            if tc.mem_plot.is_full() {
                tc.mem_plot.flush( &mut self.writer, false )?;
            }
        }

        let elem_idx = register_elem(
            &mut self.elems,
            &mut self.elem_path_to_idx,
            &mut self.elem_name_chain_head,
            &mut self.updated_elem_ids,
            &self.config,
            hash_path,
            name_hash,
            name_idx,
            thread_id,
            0,
            ElemFlags::THREAD_HASHED
        );

        let elem = &mut self.elems[ elem_idx as usize ];
        mark_elem_changed( elem, elem_idx, &mut self.updated_elem_ids );
        push_elem_value( elem, &mut self.writer, time_ns, value, lidx, storing && !self.failed, &mut self.elem_chunk_qty )
    }

    fn process_ctx_switch_start( &mut self, thread_id: u32, time_ns: i64, core_id: u32 ) -> io::Result< () > {
        self.core_qty = cmp::max( self.core_qty, core_id + 1 );
        self.ctx_switch_event_qty += 1;
        let storing = self.storing();
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.ctx_switch_event_qty += 1;

        // A start while another interval is open closes the previous one
        // here, best effort.
        if let Some( (start_ns, prev_core) ) = tc.ctx_switch_open.replace( (time_ns, core_id) ) {
            if storing {
                tc.ctx_switch.push( CtxSwitchEvt { start_ns, end_ns: time_ns, core_id: prev_core } );
                if tc.ctx_switch.is_full() {
                    tc.ctx_switch.flush( &mut self.writer, false )?;
                }
            }
        }

        Ok(())
    }

    fn process_ctx_switch_stop( &mut self, thread_id: u32, time_ns: i64, sink: &mut dyn EventSink ) -> io::Result< () > {
        self.ctx_switch_event_qty += 1;
        let storing = self.storing();
        let open = {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            tc.ctx_switch_event_qty += 1;
            tc.ctx_switch_open.take()
        };

        match open {
            Some( (start_ns, core_id) ) => {
                if storing {
                    let tc = self.threads.get_mut( &thread_id ).unwrap();
                    tc.ctx_switch.push( CtxSwitchEvt { start_ns, end_ns: time_ns, core_id } );
                    if tc.ctx_switch.is_full() {
                        tc.ctx_switch.flush( &mut self.writer, false )?;
                    }
                }
            },
            None => {
                self.log_error(
                    sink,
                    RecErrorKind::UnmatchedCtxSwitch,
                    thread_id,
                    time_ns,
                    format!( "context switch stop without a start on thread {}", thread_id )
                );
            }
        }

        Ok(())
    }

    fn process_soft_irq_begin( &mut self, thread_id: u32, time_ns: i64, name_hash: u64 ) -> io::Result< () > {
        let name_idx = self.strings.idx_for_hash( name_hash );
        let storing = self.storing();
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.soft_irq_pause.open( time_ns, storing );
        tc.soft_irq_pause.name_idx = name_idx;
        Ok(())
    }

    fn process_soft_irq_end( &mut self, thread_id: u32, time_ns: i64, sink: &mut dyn EventSink ) -> io::Result< () > {
        let was_open = {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            tc.soft_irq_pause.is_open
        };

        if !was_open {
            self.log_error(
                sink,
                RecErrorKind::UnmatchedSoftIrqEnd,
                thread_id,
                time_ns,
                format!( "soft IRQ end without a begin on thread {}", thread_id )
            );
            return Ok(());
        }

        let tc = self.threads.get_mut( &thread_id ).unwrap();
        if let Some( (_, active_ns) ) = tc.soft_irq_pause.close( time_ns ) {
            if !self.failed {
                let name_idx = tc.soft_irq_pause.name_idx;
                tc.soft_irq.push( SoftIrqEvt { begin_ns: time_ns - active_ns, end_ns: time_ns, name_idx } );
                if tc.soft_irq.is_full() {
                    tc.soft_irq.flush( &mut self.writer, false )?;
                }
            }
        }

        Ok(())
    }

    fn process_core_usage_event( &mut self, time_ns: i64, core_id: u32, is_used: bool ) -> io::Result< bool > {
        let core = core_id as usize;
        if core >= MAX_CORE_QTY {
            return Ok( false );
        }

        self.core_qty = cmp::max( self.core_qty, core_id + 1 );
        let changed = self.core_is_used[ core ] != is_used;
        if changed {
            self.core_is_used[ core ] = is_used;
            if is_used {
                self.used_core_count += 1;
            } else {
                self.used_core_count -= 1;
            }
        }

        if self.storing() {
            self.global.core_usage.push( CoreUsageEvt { time_ns, core_id, is_used } );
            if self.global.core_usage.is_full() {
                self.global.core_usage.flush( &mut self.writer, false )?;
            }
        }

        Ok( changed )
    }

    fn process_marker_event(
        &mut self,
        thread_id: u32,
        time_ns: i64,
        category_hash: u64,
        message_hash: u64,
        sink: &mut dyn EventSink,
        do_forward_events: bool
    ) -> io::Result< () > {
        let category_idx = self.strings.idx_for_hash( category_hash );
        let message_idx = self.strings.idx_for_hash( message_hash );
        if !self.marker_category_name_idxs.contains( &category_idx ) {
            self.marker_category_name_idxs.push( category_idx );
        }

        self.marker_event_qty += 1;
        let storing = self.storing();
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.marker_event_qty += 1;

        if storing {
            // Markers land both on the global stream and, when a scope is
            // open, in the level's generic stream for in-context display.
            if tc.cur_level > 0 {
                let lc = &mut tc.levels[ tc.cur_level - 1 ];
                lc.non_scope.push( GenericEvt { time_ns, name_idx: message_idx, flags: GENERIC_EVT_MARKER, value: 0.0 } );
                if lc.non_scope.is_full() {
                    lc.non_scope.flush( &mut self.writer, false )?;
                }
            }

            self.global.marker.push( MarkerEvt { time_ns, thread_id, category_idx, message_idx } );
            if self.global.marker.is_full() {
                self.global.marker.flush( &mut self.writer, false )?;
            }
        }

        if do_forward_events {
            let category = self.strings.get( category_idx ).to_owned();
            let message = self.strings.get( message_idx );
            sink.notify_marker( thread_id, time_ns, &category, message );
        }

        Ok(())
    }

    fn lock_idx_for( &mut self, lock_hash: u64 ) -> u32 {
        let name_idx = self.strings.idx_for_hash( lock_hash );
        if let Some( &idx ) = self.lock_name_to_idx.get( &lock_hash ) {
            return idx;
        }

        let idx = self.locks.len() as u32;
        self.locks.push( LockBuild {
            name_idx,
            is_in_use: false,
            using_start_thread_id: INVALID_IDX,
            using_start_time_ns: 0,
            waiting_thread_ids: SmallVec::new(),
            last_notify_thread_id: None,
            has_delta_changes: false
        });
        self.lock_name_to_idx.insert( lock_hash, idx );
        // A brand new lock is always part of the next delta.
        self.mark_lock_changed( idx );
        idx
    }

    fn mark_lock_changed( &mut self, lock_idx: u32 ) {
        let lock = &mut self.locks[ lock_idx as usize ];
        if !lock.has_delta_changes {
            lock.has_delta_changes = true;
            self.updated_lock_ids.push( lock_idx );
        }
    }

    fn process_lock_wait_begin( &mut self, thread_id: u32, time_ns: i64, lock_hash: u64 ) -> io::Result< () > {
        let lock_idx = self.lock_idx_for( lock_hash );
        let name_idx;
        let waiters_changed;
        {
            let lock = &mut self.locks[ lock_idx as usize ];
            name_idx = lock.name_idx;
            let is_holder = lock.is_in_use && lock.using_start_thread_id == thread_id;
            waiters_changed = !is_holder && !lock.waiting_thread_ids.contains( &thread_id );
            if waiters_changed {
                lock.waiting_thread_ids.push( thread_id );
            }
        }

        if waiters_changed {
            self.mark_lock_changed( lock_idx );
        }

        self.lock_event_qty += 1;
        let storing = self.storing();
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        tc.lock_event_qty += 1;
        tc.lock_wait_lanes.push( LockWaitLane { name_idx, begin_stored: storing } );
        if storing {
            tc.lock_wait.push( LockEvt { time_ns, thread_id, name_idx, kind: LOCK_EVT_WAIT_BEGIN } );
            if tc.lock_wait.is_full() {
                tc.lock_wait.flush( &mut self.writer, false )?;
            }
        }

        Ok(())
    }

    fn process_lock_wait_end( &mut self, thread_id: u32, time_ns: i64, lock_hash: u64, synthetic: bool, sink: &mut dyn EventSink ) -> io::Result< () > {
        let lock_idx = self.lock_idx_for( lock_hash );
        let waiters_changed = {
            let lock = &mut self.locks[ lock_idx as usize ];
            match lock.waiting_thread_ids.iter().position( |&waiter| waiter == thread_id ) {
                Some( position ) => {
                    lock.waiting_thread_ids.remove( position );
                    true
                },
                None => false
            }
        };

        if waiters_changed {
            self.mark_lock_changed( lock_idx );
        }

        if !synthetic {
            self.lock_event_qty += 1;
        }

        let storing = self.storing();
        let lane = {
            let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
            if !synthetic {
                tc.lock_event_qty += 1;
            }
            tc.lock_wait_lanes.pop()
        };

        match lane {
            Some( lane ) => {
                if lane.begin_stored && storing {
                    let tc = self.threads.get_mut( &thread_id ).unwrap();
                    tc.lock_wait.push( LockEvt { time_ns, thread_id, name_idx: lane.name_idx, kind: LOCK_EVT_WAIT_END } );
                    if tc.lock_wait.is_full() {
                        tc.lock_wait.flush( &mut self.writer, false )?;
                    }
                }
            },
            None => {
                if !synthetic {
                    self.log_error(
                        sink,
                        RecErrorKind::UnmatchedLockWaitEnd,
                        thread_id,
                        time_ns,
                        format!( "lock wait end without a begin on thread {}", thread_id )
                    );
                }
            }
        }

        Ok(())
    }

    fn process_lock_use_event(
        &mut self,
        thread_id: u32,
        time_ns: i64,
        lock_hash: u64,
        is_acquired: bool,
        sink: &mut dyn EventSink
    ) -> io::Result< bool > {
        let lock_idx = self.lock_idx_for( lock_hash );

        let mut changed = false;
        let mut insert_wait_end = false;
        let mut unmatched_release = false;
        let name_idx;
        {
            let lock = &mut self.locks[ lock_idx as usize ];
            name_idx = lock.name_idx;
            lock.last_notify_thread_id = None;

            if is_acquired {
                // The holder never stays in the waiter list.
                if let Some( position ) = lock.waiting_thread_ids.iter().position( |&waiter| waiter == thread_id ) {
                    lock.waiting_thread_ids.remove( position );
                    insert_wait_end = true;
                }

                changed = !lock.is_in_use || lock.using_start_thread_id != thread_id;
                lock.is_in_use = true;
                lock.using_start_thread_id = thread_id;
                lock.using_start_time_ns = time_ns;
            } else if lock.is_in_use && lock.using_start_thread_id == thread_id {
                lock.is_in_use = false;
                lock.using_start_thread_id = INVALID_IDX;
                lock.using_start_time_ns = 0;
                changed = true;
            } else {
                unmatched_release = true;
            }
        }

        // Ownership changes are what a live viewer cares about; a release
        // by a non-holder leaves the registry untouched.
        if changed {
            self.mark_lock_changed( lock_idx );
        }

        if unmatched_release {
            self.log_error(
                sink,
                RecErrorKind::UnmatchedLockRelease,
                thread_id,
                time_ns,
                format!( "lock release by thread {} which does not hold the lock", thread_id )
            );
        }

        self.lock_event_qty += 1;
        ensure_thread( &mut self.threads, &self.config, thread_id, time_ns ).lock_event_qty += 1;

        if self.storing() {
            let kind = if is_acquired { LOCK_EVT_ACQUIRED } else { LOCK_EVT_RELEASED };
            self.global.lock_use.push( LockEvt { time_ns, thread_id, name_idx, kind } );
            if self.global.lock_use.is_full() {
                self.global.lock_use.flush( &mut self.writer, false )?;
            }
        }

        Ok( insert_wait_end )
    }

    fn process_lock_notify_event(
        &mut self,
        thread_id: u32,
        time_ns: i64,
        lock_hash: u64,
        sink: &mut dyn EventSink,
        do_forward_events: bool
    ) -> io::Result< () > {
        let lock_idx = self.lock_idx_for( lock_hash );
        let duplicate = {
            let lock = &mut self.locks[ lock_idx as usize ];
            if lock.last_notify_thread_id == Some( thread_id ) {
                true
            } else {
                lock.last_notify_thread_id = Some( thread_id );
                false
            }
        };

        if duplicate {
            self.log_error(
                sink,
                RecErrorKind::DuplicateLockNotify,
                thread_id,
                time_ns,
                format!( "duplicate lock notify from thread {}", thread_id )
            );
            return Ok(());
        }

        self.mark_lock_changed( lock_idx );
        self.lock_event_qty += 1;
        ensure_thread( &mut self.threads, &self.config, thread_id, time_ns ).lock_event_qty += 1;

        let name_idx = self.locks[ lock_idx as usize ].name_idx;
        if self.storing() {
            self.global.lock_ntf.push( LockEvt { time_ns, thread_id, name_idx, kind: LOCK_EVT_NOTIFIED } );
            if self.global.lock_ntf.is_full() {
                self.global.lock_ntf.flush( &mut self.writer, false )?;
            }
        }

        if do_forward_events {
            let lock_name = self.strings.get( name_idx ).to_owned();
            sink.notify_lock_notified( thread_id, time_ns, &lock_name );
        }

        Ok(())
    }

    fn process_thread_name( &mut self, thread_id: u32, time_ns: i64, name_hash: u64 ) -> io::Result< () > {
        let name_idx = self.strings.idx_for_hash( name_hash );
        let tc = ensure_thread( &mut self.threads, &self.config, thread_id, time_ns );
        if tc.name_idx == name_idx as i32 {
            return Ok(());
        }

        tc.name_idx = name_idx as i32;
        tc.thread_unique_hash = name_hash;
        if !tc.name_delta_pending {
            tc.name_delta_pending = true;
            self.name_updated_thread_ids.push( thread_id );
        }

        Ok(())
    }

    fn create_delta_record( &mut self, delta: &mut Delta ) {
        delta.clear();
        delta.first_new_string_idx = self.last_size_strings;
        for entry in &self.strings.entries()[ self.last_size_strings as usize.. ] {
            delta.new_strings.push( entry.clone() );
        }
        self.strings.take_updated( self.last_size_strings, &mut delta.updated_string_ids );
        self.last_size_strings = self.strings.len() as u32;

        for elem_idx in self.updated_elem_ids.drain( .. ) {
            self.elems[ elem_idx as usize ].has_delta_changes = false;
            delta.changed_elem_ids.push( elem_idx );
        }

        for lock_idx in self.updated_lock_ids.drain( .. ) {
            self.locks[ lock_idx as usize ].has_delta_changes = false;
            delta.changed_lock_ids.push( lock_idx );
        }

        for thread_id in self.name_updated_thread_ids.drain( .. ) {
            if let Some( tc ) = self.threads.get_mut( &thread_id ) {
                tc.name_delta_pending = false;
            }
            delta.name_updated_thread_ids.push( thread_id );
        }

        delta.core_usage_changed = self.core_usage_changed;
        self.core_usage_changed = false;
        delta.used_core_count = self.used_core_count;
        delta.duration_ns = self.duration_ns;
    }

    fn finalize( &mut self ) -> io::Result< () > {
        let end_ns = self.duration_ns;
        let mut thread_ids: Vec< u32 > = self.threads.keys().cloned().collect();
        thread_ids.sort_unstable();

        // Force-close whatever is still open so the flushed streams stay
        // consistent.
        for &thread_id in &thread_ids {
            while self.threads[ &thread_id ].cur_level > 0 {
                self.close_top_scope( thread_id, end_ns )?;
            }

            let open = self.threads.get_mut( &thread_id ).unwrap().ctx_switch_open.take();
            if let Some( (start_ns, core_id) ) = open {
                if self.storing() {
                    let tc = self.threads.get_mut( &thread_id ).unwrap();
                    tc.ctx_switch.push( CtxSwitchEvt { start_ns, end_ns, core_id } );
                }
            }

            let tc = self.threads.get_mut( &thread_id ).unwrap();
            if tc.soft_irq_pause.is_open {
                let name_idx = tc.soft_irq_pause.name_idx;
                if let Some( (_, active_ns) ) = tc.soft_irq_pause.close( end_ns ) {
                    if !self.failed {
                        tc.soft_irq.push( SoftIrqEvt { begin_ns: end_ns - active_ns, end_ns, name_idx } );
                    }
                }
            }

            while let Some( lane ) = {
                let tc = self.threads.get_mut( &thread_id ).unwrap();
                tc.lock_wait_lanes.pop()
            } {
                if lane.begin_stored && self.storing() {
                    let tc = self.threads.get_mut( &thread_id ).unwrap();
                    tc.lock_wait.push( LockEvt { time_ns: end_ns, thread_id, name_idx: lane.name_idx, kind: LOCK_EVT_WAIT_END } );
                    if tc.lock_wait.is_full() {
                        tc.lock_wait.flush( &mut self.writer, false )?;
                    }
                }
            }
        }

        if self.failed {
            return Err( io::Error::new( io::ErrorKind::Other, "the record failed on an earlier disk write" ) );
        }

        // Final flush of every stream, keeping the buffers for the index.
        let mut thread_entries = Vec::with_capacity( thread_ids.len() );
        for &thread_id in &thread_ids {
            let tc = self.threads.get_mut( &thread_id ).unwrap();
            let has_live_allocs = tc.mem_ss_slots.iter().any( |slot| slot.midx != INVALID_IDX );
            if has_live_allocs {
                let alloc_midx = tc.mem_alloc.total_len();
                save_thread_memory_snapshot( tc, &mut self.writer, end_ns, alloc_midx )?;
            }

            tc.mem_alloc.flush( &mut self.writer, true )?;
            tc.mem_dealloc.flush( &mut self.writer, true )?;
            tc.mem_plot.flush( &mut self.writer, true )?;
            tc.ctx_switch.flush( &mut self.writer, true )?;
            tc.soft_irq.flush( &mut self.writer, true )?;
            tc.lock_wait.flush( &mut self.writer, true )?;

            let mut level_entries = Vec::with_capacity( tc.levels.len() );
            for lc in tc.levels.iter_mut() {
                write_scope_chunk( lc, &mut self.writer, true, &mut self.elem_chunk_qty )?;
                lc.non_scope.flush( &mut self.writer, true )?;
                lc.scope_pyramid.flush_tail();
                level_entries.push( NestingLevelEntry {
                    scope_locs: lc.scope.locs().to_vec(),
                    non_scope_locs: lc.non_scope.locs().to_vec(),
                    scope_speck_levels: lc.scope_pyramid.clone_levels()
                });
            }

            thread_entries.push( ThreadEntry {
                thread_id,
                thread_hash: tc.thread_hash,
                thread_unique_hash: tc.thread_unique_hash,
                name_idx: tc.name_idx,
                elem_event_qty: tc.elem_event_qty,
                mem_event_qty: tc.mem_event_qty,
                ctx_switch_event_qty: tc.ctx_switch_event_qty,
                lock_event_qty: tc.lock_event_qty,
                marker_event_qty: tc.marker_event_qty,
                dropped_event_qty: tc.dropped_event_qty,
                duration_ns: tc.duration_ns,
                sum_alloc_qty: tc.sum_alloc_qty,
                sum_alloc_size: tc.sum_alloc_size,
                sum_dealloc_qty: tc.sum_dealloc_qty,
                sum_dealloc_size: tc.sum_dealloc_size,
                mem_alloc_locs: tc.mem_alloc.locs().to_vec(),
                mem_dealloc_locs: tc.mem_dealloc.locs().to_vec(),
                mem_plot_locs: tc.mem_plot.locs().to_vec(),
                mem_snapshots: tc.mem_snapshots.clone(),
                ctx_switch_locs: tc.ctx_switch.locs().to_vec(),
                soft_irq_locs: tc.soft_irq.locs().to_vec(),
                lock_wait_locs: tc.lock_wait.locs().to_vec(),
                levels: level_entries
            });
        }

        let mut elem_entries = Vec::with_capacity( self.elems.len() );
        for elem_idx in 0..self.elems.len() {
            let elem = &mut self.elems[ elem_idx ];
            write_elem_chunk( elem, &mut self.writer, true, &mut self.elem_chunk_qty )?;
            elem.pyramid.flush_tail();
            elem_entries.push( ElemEntry {
                hash_path: elem.hash_path,
                hash_key: elem.hash_key,
                prev_elem_idx: elem.prev_elem_idx,
                thread_id: elem.thread_id,
                nesting_level: elem.nesting_level,
                name_idx: elem.name_idx,
                hl_name_idx: elem.hl_name_idx,
                flags: elem.flags.bits(),
                abs_y_min: elem.abs_y_min,
                abs_y_max: elem.abs_y_max,
                last_time_ns: elem.last_time_ns,
                value_locs: elem.values.locs().to_vec(),
                speck_levels: elem.pyramid.clone_levels()
            });
        }

        self.global.lock_use.flush( &mut self.writer, true )?;
        self.global.lock_ntf.flush( &mut self.writer, true )?;
        self.global.core_usage.flush( &mut self.writer, true )?;
        self.global.marker.flush( &mut self.writer, true )?;

        let index = RecordIndex {
            strings: self.strings.entries().to_vec(),
            elems: elem_entries,
            threads: thread_entries,
            locks: self.locks
                .iter()
                .map( |lock| LockEntry {
                    name_idx: lock.name_idx,
                    is_in_use: lock.is_in_use,
                    using_start_thread_id: lock.using_start_thread_id,
                    using_start_time_ns: lock.using_start_time_ns,
                    waiting_thread_ids: lock.waiting_thread_ids.to_vec()
                })
                .collect(),
            lock_use_locs: self.global.lock_use.locs().to_vec(),
            lock_ntf_locs: self.global.lock_ntf.locs().to_vec(),
            core_usage_locs: self.global.core_usage.locs().to_vec(),
            marker_locs: self.global.marker.locs().to_vec(),
            marker_category_name_idxs: self.marker_category_name_idxs.clone(),
            core_qty: self.core_qty,
            used_core_count: self.used_core_count,
            core_is_used: self.core_is_used.iter().map( |&used| used as u8 ).collect(),
            duration_ns: self.duration_ns,
            elem_event_qty: self.elem_event_qty,
            mem_event_qty: self.mem_event_qty,
            lock_event_qty: self.lock_event_qty,
            marker_event_qty: self.marker_event_qty,
            ctx_switch_event_qty: self.ctx_switch_event_qty,
            elem_chunk_qty: self.elem_chunk_qty,
            errors: self.errors.errors().to_vec(),
            dropped_error_qty: self.errors.dropped_qty()
        };

        let bytes = index
            .write_to_vec()
            .map_err( |error| io::Error::new( io::ErrorKind::Other, error.to_string() ) )?;
        self.writer.finalize( &bytes )
    }
}

/// The recording engine: consumes decoded events, maintains per-thread
/// nesting state, assigns stable identities to scopes/plots/locks, and
/// turns everything into a persisted, queryable record file.
///
/// Not internally synchronized: `store_new_events` and the other mutating
/// calls must be externally serialized to one logical writer.
pub struct Recording {
    sink: Box< dyn EventSink >,
    storage_path: PathBuf,
    do_forward_events: bool,
    is_recording_enabled: bool,
    forced_record_filename: Option< String >,
    config: RecordingConfig,
    rec: Option< RecordState >
}

impl Recording {
    pub fn new( sink: Box< dyn EventSink >, storage_path: PathBuf, do_forward_events: bool ) -> Self {
        Recording::with_config( sink, storage_path, do_forward_events, RecordingConfig::default() )
    }

    pub fn with_config( sink: Box< dyn EventSink >, storage_path: PathBuf, do_forward_events: bool, config: RecordingConfig ) -> Self {
        Recording {
            sink,
            storage_path,
            do_forward_events,
            is_recording_enabled: true,
            forced_record_filename: None,
            config,
            rec: None
        }
    }

    pub fn set_recording_config( &mut self, is_enabled: bool, forced_filename: Option< &str > ) {
        self.is_recording_enabled = is_enabled;
        self.forced_record_filename = forced_filename.map( |name| name.to_owned() );
    }

    pub fn is_recording( &self ) -> bool {
        self.rec.is_some()
    }

    pub fn get_records_data_path( &self ) -> &Path {
        &self.storage_path
    }

    pub fn get_record_path( &self ) -> Option< &Path > {
        self.rec.as_ref().map( |rec| rec.record_path.as_path() )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin_record(
        &mut self,
        app_name: &str,
        build_name: &str,
        protocol: u32,
        time_ns_origin: i64,
        tick_to_ns: f64,
        are_strings_external: bool,
        cache_mb: u32,
        do_create_live_record: bool
    ) -> Result< (), BeginError > {
        if self.rec.is_some() {
            return Err( BeginError::AlreadyRecording );
        }

        if !self.is_recording_enabled {
            return Err( BeginError::RecordingDisabled );
        }

        if protocol < PROTOCOL_VERSION_MIN || protocol > PROTOCOL_VERSION_MAX {
            return Err( BeginError::UnsupportedProtocol { got: protocol } );
        }

        let dir = self.storage_path.join( app_name );
        fs::create_dir_all( &dir ).map_err( |error| BeginError::StoragePathNotWritable {
            path: dir.clone(),
            error
        })?;

        let filename = match self.forced_record_filename {
            Some( ref name ) => name.clone(),
            None => {
                let date = chrono::Local::now().format( "%Y%m%d_%H%M%S" );
                if build_name.is_empty() {
                    format!( "{}_{}.trec", app_name, date )
                } else {
                    format!( "{}_{}_{}.trec", app_name, build_name, date )
                }
            }
        };

        let path = dir.join( &filename );
        if path.exists() {
            return Err( BeginError::NameCollision { path } );
        }

        let mut writer = RecordWriter::create( &path, self.config.compression )
            .map_err( |error| BeginError::StoragePathNotWritable { path: path.clone(), error } )?;

        let conv = TickConverter::new( time_ns_origin, tick_to_ns );
        let header = RecordHeader {
            format_version: RECORD_FORMAT_VERSION,
            app_name: app_name.to_owned(),
            build_name: build_name.to_owned(),
            protocol,
            conv,
            are_strings_external,
            cache_mb
        };
        let header_bytes = header
            .write_to_vec()
            .map_err( |error| BeginError::Io( io::Error::new( io::ErrorKind::Other, error.to_string() ) ) )?;
        writer.write_raw( &header_bytes ).map_err( BeginError::Io )?;

        info!( "started recording {:?} (protocol {})", path, protocol );
        self.rec = Some( RecordState {
            writer,
            record_path: path,
            conv,
            is_live: do_create_live_record,
            are_strings_external,
            config: self.config.clone(),
            strings: StringTable::new(),
            elems: Vec::new(),
            elem_path_to_idx: HashMap::new(),
            elem_name_chain_head: HashMap::new(),
            locks: Vec::new(),
            lock_name_to_idx: HashMap::new(),
            threads: HashMap::new(),
            global: GlobalBuild::new( &self.config ),
            mem_alloc_lkup: HashMap::new(),
            marker_category_name_idxs: Vec::new(),
            duration_ns: 0,
            core_qty: 0,
            used_core_count: 0,
            core_is_used: [false; MAX_CORE_QTY],
            elem_event_qty: 0,
            mem_event_qty: 0,
            lock_event_qty: 0,
            marker_event_qty: 0,
            ctx_switch_event_qty: 0,
            elem_chunk_qty: 0,
            request_pause: false,
            request_resume: false,
            no_storing: false,
            failed: false,
            errors: ErrorLog::new( self.config.max_error_qty ),
            last_size_strings: 0,
            updated_elem_ids: Vec::new(),
            updated_lock_ids: Vec::new(),
            name_updated_thread_ids: Vec::new(),
            core_usage_changed: false
        });
        Ok(())
    }

    /// Flushes every open chunk, writes the index and closes the record
    /// file. Idempotent when no recording is in progress.
    pub fn end_record( &mut self ) -> io::Result< () > {
        let mut rec = match self.rec.take() {
            Some( rec ) => rec,
            None => return Ok(())
        };

        let result = rec.finalize();
        match result {
            Ok(()) => {
                info!(
                    "finished recording {:?}: {} elements, {} threads, {} errors",
                    rec.record_path,
                    rec.elems.len(),
                    rec.threads.len(),
                    rec.errors.len()
                );
                Ok(())
            },
            Err( error ) => {
                warn!( "failed to finalize record {:?}: {}", rec.record_path, error );
                Err( error )
            }
        }
    }

    /// Registers a string under its content hash; idempotent per hash.
    pub fn store_new_string( &mut self, value: &str, hash: u64 ) -> Option< u32 > {
        let rec = self.rec.as_mut()?;
        Some( rec.strings.store( hash, value ) )
    }

    /// Consumes a batch of decoded events, strictly in arrival order. A
    /// disk write failure freezes the record: already flushed data stays
    /// valid, nothing more is stored.
    pub fn store_new_events( &mut self, events: &[Event] ) {
        let rec = match self.rec.as_mut() {
            Some( rec ) => rec,
            None => return
        };

        let sink = &mut *self.sink;
        let do_forward_events = self.do_forward_events;
        for event in events {
            let time_ns = rec.conv.ticks_to_ns( event.timestamp_ticks );
            let mut result = rec.apply_pause_requests( time_ns );
            if result.is_ok() {
                if time_ns > rec.duration_ns {
                    rec.duration_ns = time_ns;
                }
                result = rec.process_event( event, time_ns, &mut *sink, do_forward_events );
            }

            if let Err( error ) = result {
                rec.failed = true;
                warn!( "disk write failure, freezing the record: {}", error );
            }
        }
    }

    /// Suspends or resumes chunk storage. Idempotent; takes effect at the
    /// next event boundary. Never drops already-flushed chunks.
    pub fn do_pause_storing( &mut self, state: bool ) {
        if let Some( rec ) = self.rec.as_mut() {
            if state {
                rec.request_pause = true;
                rec.request_resume = false;
            } else {
                rec.request_resume = true;
                rec.request_pause = false;
            }
        }
    }

    /// Fills `delta` with everything that changed since the previous call.
    /// Calling it with no traffic in between yields an empty delta.
    pub fn create_delta_record( &mut self, delta: &mut Delta ) {
        match self.rec.as_mut() {
            Some( rec ) => rec.create_delta_record( delta ),
            None => delta.clear()
        }
    }

    pub fn get_thread_name_hash( &self, thread_id: u32 ) -> Option< u64 > {
        let rec = self.rec.as_ref()?;
        rec.threads.get( &thread_id ).map( |tc| tc.thread_unique_hash )
    }

    pub fn get_thread_name_idx( &self, thread_id: u32 ) -> Option< i32 > {
        let rec = self.rec.as_ref()?;
        rec.threads.get( &thread_id ).map( |tc| tc.name_idx )
    }

    pub fn get_elem_infos( &self, elem_idx: u32 ) -> Option< (u64, u32, u32) > {
        let rec = self.rec.as_ref()?;
        let elem = rec.elems.get( elem_idx as usize )?;
        Some( (rec.strings.hash_of( elem.name_idx ), elem.prev_elem_idx, elem.thread_id) )
    }

    /// Safe to call concurrently with ingestion only because entries are
    /// never mutated or relocated once appended.
    pub fn get_string( &self, idx: u32 ) -> Option< &str > {
        let rec = self.rec.as_ref()?;
        if (idx as usize) < rec.strings.len() {
            Some( rec.strings.get( idx ) )
        } else {
            None
        }
    }

    pub fn errors( &self ) -> &[RecError] {
        self.rec.as_ref().map( |rec| rec.errors.errors() ).unwrap_or( &[] )
    }

    pub fn dropped_error_qty( &self ) -> u32 {
        self.rec.as_ref().map( |rec| rec.errors.dropped_qty() ).unwrap_or( 0 )
    }

    pub fn is_live( &self ) -> bool {
        self.rec.as_ref().map( |rec| rec.is_live ).unwrap_or( false )
    }
}
