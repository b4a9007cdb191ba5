use std::convert::TryInto;
use std::fs;
use std::path::Path;

use recorder_core::record::{
    ElemValue,
    GenericEvt,
    LockEvt,
    MarkerEvt,
    MemEvt,
    MemSnapshotEntry,
    RecordIndex,
    ScopeEvt,
    ChunkLoc,
    CtxSwitchEvt,
    SoftIrqEvt,
    GENERIC_EVT_ALLOC,
    GENERIC_EVT_DEALLOC,
    INVALID_IDX,
    LOCK_EVT_ACQUIRED,
    LOCK_EVT_RELEASED,
    LOCK_EVT_WAIT_BEGIN,
    LOCK_EVT_WAIT_END,
    RECORD_MAGIC
};
use recorder_core::record::Delta;
use recorder_core::speedy::{LittleEndian, Readable};
use recorder_core::{
    BeginError,
    ElemFlags,
    Event,
    NullSink,
    Payload,
    RecErrorKind,
    Recording,
    RecordingConfig
};

const HASH_A: u64 = 0x1111;
const HASH_B: u64 = 0x2222;
const HASH_PLOT: u64 = 0x3333;
const HASH_LOCK: u64 = 0x4444;
const HASH_IRQ: u64 = 0x5555;

fn new_recording( dir: &Path ) -> Recording {
    let config = RecordingConfig {
        compression: false,
        ..RecordingConfig::default()
    };
    new_recording_with_config( dir, config )
}

fn new_recording_with_config( dir: &Path, config: RecordingConfig ) -> Recording {
    let mut recording = Recording::with_config( Box::new( NullSink ), dir.to_owned(), false, config );
    recording
        .begin_record( "app", "", 1, 0, 1.0, false, 0, false )
        .unwrap();
    recording.store_new_string( "A", HASH_A );
    recording.store_new_string( "B", HASH_B );
    recording.store_new_string( "heap", HASH_PLOT );
    recording.store_new_string( "mutex", HASH_LOCK );
    recording.store_new_string( "net_rx", HASH_IRQ );
    recording
}

fn evt( thread_id: u32, ticks: u64, payload: Payload ) -> Event {
    Event::new( thread_id, ticks, payload )
}

fn finish( mut recording: Recording ) -> (Vec< u8 >, RecordIndex) {
    let path = recording.get_record_path().unwrap().to_owned();
    recording.end_record().unwrap();

    let bytes = fs::read( &path ).unwrap();
    assert!( bytes.starts_with( RECORD_MAGIC ) );
    let trailer: [u8; 8] = bytes[ bytes.len() - 8.. ].try_into().unwrap();
    let index_offset = u64::from_le_bytes( trailer ) as usize;
    let index = RecordIndex::read_from_buffer( &bytes[ index_offset..bytes.len() - 8 ] ).unwrap();
    (bytes, index)
}

fn read_chunk< 'a, T >( bytes: &'a [u8], loc: ChunkLoc ) -> Vec< T >
    where T: Readable< 'a, LittleEndian >
{
    assert!( !loc.is_compressed() );
    let raw = &bytes[ loc.offset as usize..(loc.offset + loc.size as u64) as usize ];
    Vec::< T >::read_from_buffer( raw ).unwrap()
}

fn string_idx( index: &RecordIndex, value: &str ) -> u32 {
    index.strings
        .iter()
        .position( |entry| entry.value == value )
        .unwrap() as u32
}

#[test]
fn nested_scopes_get_separate_elements_and_durations() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 30, Payload::ScopeBegin { name_hash: HASH_B } ),
        evt( 1, 70, Payload::ScopeEnd { name_hash: HASH_B } ),
        evt( 1, 90, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    assert_eq!( index.threads.len(), 1 );
    assert_eq!( index.duration_ns, 90 );

    let thread = &index.threads[ 0 ];
    assert_eq!( thread.thread_id, 1 );
    assert_eq!( thread.elem_event_qty, 4 );
    assert_eq!( thread.levels.len(), 2 );

    let level0: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 0 ].scope_locs[ 0 ] );
    assert_eq!( level0.len(), 1 );
    assert_eq!( level0[ 0 ].name_idx, string_idx( &index, "A" ) );
    assert_eq!( level0[ 0 ].begin_ns, 0 );
    assert_eq!( level0[ 0 ].end_ns, 90 );
    assert_eq!( level0[ 0 ].duration_ns, 90 );

    let level1: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 1 ].scope_locs[ 0 ] );
    assert_eq!( level1.len(), 1 );
    assert_eq!( level1[ 0 ].name_idx, string_idx( &index, "B" ) );
    assert_eq!( level1[ 0 ].begin_ns, 30 );
    assert_eq!( level1[ 0 ].duration_ns, 40 );

    // Same thread, different call path: two distinct scope elements.
    let scope_elems: Vec< _ > = index.elems
        .iter()
        .filter( |elem| elem.flags & ElemFlags::SCOPE.bits() != 0 )
        .collect();
    assert_eq!( scope_elems.len(), 2 );
    assert_ne!( scope_elems[ 0 ].hash_path, scope_elems[ 1 ].hash_path );
    let elem_b = scope_elems.iter().find( |elem| elem.nesting_level == 1 ).unwrap();
    assert_eq!( elem_b.name_idx, string_idx( &index, "B" ) );
    assert!( index.errors.is_empty() );
}

#[test]
fn repeated_scopes_share_one_element_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 10, Payload::ScopeEnd { name_hash: HASH_A } ),
        evt( 1, 20, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 50, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    let scope_elems: Vec< _ > = index.elems
        .iter()
        .filter( |elem| elem.flags & ElemFlags::SCOPE.bits() != 0 )
        .collect();
    assert_eq!( scope_elems.len(), 1 );

    let scopes: Vec< ScopeEvt > = read_chunk( &bytes, index.threads[ 0 ].levels[ 0 ].scope_locs[ 0 ] );
    assert_eq!( scopes.len(), 2 );
    assert_eq!( scopes[ 0 ].duration_ns, 10 );
    assert_eq!( scopes[ 1 ].duration_ns, 30 );

    // The element's value stream carries the durations in order.
    let values: Vec< ElemValue > = read_chunk( &bytes, scope_elems[ 0 ].value_locs[ 0 ] );
    assert_eq!( values.len(), 2 );
    assert_eq!( values[ 0 ].value, 10.0 );
    assert_eq!( values[ 1 ].value, 30.0 );
    assert_eq!( values[ 1 ].lidx, 1 );
    assert_eq!( scope_elems[ 0 ].abs_y_min, 10.0 );
    assert_eq!( scope_elems[ 0 ].abs_y_max, 30.0 );
}

#[test]
fn memory_totals_follow_alloc_and_dealloc() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 10, Payload::MemAlloc { pointer: 0x1000, size: 24 } ),
        evt( 1, 20, Payload::MemAlloc { pointer: 0x2000, size: 40 } ),
        evt( 1, 30, Payload::MemDealloc { pointer: 0x1000 } ),
        evt( 1, 40, Payload::MemDealloc { pointer: 0x2000 } ),
        evt( 1, 50, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    let thread = &index.threads[ 0 ];
    assert_eq!( thread.sum_alloc_qty, 2 );
    assert_eq!( thread.sum_alloc_size, 64 );
    assert_eq!( thread.sum_dealloc_qty, 2 );
    assert_eq!( thread.sum_dealloc_size, 64 );

    // The enclosing scope carries the per-scope memory deltas.
    let scopes: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 0 ].scope_locs[ 0 ] );
    assert_eq!( scopes[ 0 ].alloc_qty, 2 );
    assert_eq!( scopes[ 0 ].alloc_size, 64 );
    assert_eq!( scopes[ 0 ].dealloc_qty, 2 );
    assert_eq!( scopes[ 0 ].dealloc_size, 64 );

    // Deallocations recover the allocation size and back-reference.
    let deallocs: Vec< MemEvt > = read_chunk( &bytes, thread.mem_dealloc_locs[ 0 ] );
    assert_eq!( deallocs.len(), 2 );
    assert_eq!( deallocs[ 0 ].size, 24 );
    assert_eq!( deallocs[ 0 ].midx, 0 );
    assert_eq!( deallocs[ 1 ].size, 40 );
    assert_eq!( deallocs[ 1 ].midx, 1 );
    assert_ne!( deallocs[ 0 ].scope_elem_idx, INVALID_IDX );
    assert!( index.errors.is_empty() );
}

#[test]
fn unknown_dealloc_and_duplicate_alloc_are_logged_without_corrupting_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::MemAlloc { pointer: 0x1000, size: 16 } ),
        evt( 1, 10, Payload::MemDealloc { pointer: 0x999 } ),
        evt( 1, 20, Payload::MemAlloc { pointer: 0x1000, size: 16 } ),
    ]);

    let (_bytes, index) = finish( recording );
    assert_eq!( index.errors.len(), 2 );
    assert_eq!( index.errors[ 0 ].kind, RecErrorKind::UnknownDealloc.as_u8() );
    assert_eq!( index.errors[ 1 ].kind, RecErrorKind::DuplicateAlloc.as_u8() );
    assert_eq!( index.dropped_error_qty, 0 );

    // Neither bad event changed the totals.
    let thread = &index.threads[ 0 ];
    assert_eq!( thread.sum_alloc_qty, 1 );
    assert_eq!( thread.sum_alloc_size, 16 );
    assert_eq!( thread.sum_dealloc_qty, 0 );
}

#[test]
fn pause_excludes_inactive_time_from_scope_duration() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[ evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ) ] );
    recording.do_pause_storing( true );
    recording.store_new_events( &[ evt( 1, 10, Payload::Marker { category_hash: HASH_B, message_hash: HASH_A } ) ] );
    recording.do_pause_storing( false );
    recording.store_new_events( &[
        evt( 1, 20, Payload::Marker { category_hash: HASH_B, message_hash: HASH_A } ),
        evt( 1, 30, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    let thread = &index.threads[ 0 ];
    let scopes: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 0 ].scope_locs[ 0 ] );
    assert_eq!( scopes.len(), 1 );
    assert_eq!( scopes[ 0 ].begin_ns, 0 );
    assert_eq!( scopes[ 0 ].end_ns, 30 );
    assert_eq!( scopes[ 0 ].duration_ns, 20 );

    // The marker emitted while paused was not stored, the later one was,
    // and the suppressed one is accounted as dropped.
    assert_eq!( index.marker_locs.len(), 1 );
    let markers: Vec< MarkerEvt > = read_chunk( &bytes, index.marker_locs[ 0 ] );
    assert_eq!( markers.len(), 1 );
    assert_eq!( markers[ 0 ].time_ns, 20 );
    assert_eq!( thread.dropped_event_qty, 1 );
    assert!( index.errors.is_empty() );
}

#[test]
fn unmatched_scope_end_is_an_error_not_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[ evt( 1, 5, Payload::ScopeEnd { name_hash: HASH_A } ) ] );

    let (_bytes, index) = finish( recording );
    assert_eq!( index.errors.len(), 1 );
    assert_eq!( index.errors[ 0 ].kind, RecErrorKind::UnmatchedScopeEnd.as_u8() );
    assert_eq!( index.errors[ 0 ].thread_id, 1 );
    assert_eq!( index.threads[ 0 ].elem_event_qty, 1 );
}

#[test]
fn delta_reports_each_change_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );
    let mut delta = Delta::default();

    // Everything registered so far is new.
    recording.create_delta_record( &mut delta );
    assert_eq!( delta.first_new_string_idx, 0 );
    assert_eq!( delta.new_strings.len(), 5 );
    assert!( delta.changed_elem_ids.is_empty() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 10, Payload::ScopeEnd { name_hash: HASH_A } ),
        evt( 1, 15, Payload::ThreadName { name_hash: HASH_B } ),
    ]);
    recording.create_delta_record( &mut delta );
    assert!( delta.new_strings.is_empty() );
    assert_eq!( delta.changed_elem_ids.len(), 1 );
    assert_eq!( delta.name_updated_thread_ids, vec![ 1 ] );
    assert_eq!( delta.duration_ns, 15 );

    // No traffic in between: the next delta is empty.
    recording.create_delta_record( &mut delta );
    assert!( delta.is_empty() );

    // New activity on the same element is reported again, once.
    recording.store_new_events( &[
        evt( 1, 20, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 40, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);
    recording.create_delta_record( &mut delta );
    assert_eq!( delta.changed_elem_ids.len(), 1 );
    assert!( delta.name_updated_thread_ids.is_empty() );

    assert_eq!( recording.get_thread_name_hash( 1 ), Some( HASH_B ) );
    recording.end_record().unwrap();
}

#[test]
fn memory_snapshots_are_written_at_the_configured_interval() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecordingConfig {
        compression: false,
        snapshot_event_interval: 4,
        ..RecordingConfig::default()
    };
    let mut recording = new_recording_with_config( dir.path(), config );

    let events: Vec< _ > = (0..6_u64)
        .map( |idx| evt( 1, idx * 10, Payload::MemAlloc { pointer: 0x1000 + idx * 0x10, size: 8 } ) )
        .collect();
    recording.store_new_events( &events );

    let (bytes, index) = finish( recording );
    let thread = &index.threads[ 0 ];

    // One snapshot after the 4th memory event, one final snapshot of the
    // allocations still live at the end.
    assert_eq!( thread.mem_snapshots.len(), 2 );
    assert_eq!( thread.mem_snapshots[ 0 ].alloc_midx, 4 );

    let first: Vec< MemSnapshotEntry > = read_chunk( &bytes, thread.mem_snapshots[ 0 ].loc );
    assert_eq!( first.len(), 4 );
    let last: Vec< MemSnapshotEntry > = read_chunk( &bytes, thread.mem_snapshots[ 1 ].loc );
    assert_eq!( last.len(), 6 );
    assert!( last.iter().all( |entry| entry.size == 8 ) );
}

#[test]
fn lock_wait_acquire_release_produce_matched_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::LockWaitBegin { lock_hash: HASH_LOCK } ),
        evt( 1, 10, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: true } ),
        evt( 1, 20, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: false } ),
        evt( 1, 30, Payload::LockNotify { lock_hash: HASH_LOCK } ),
        evt( 1, 40, Payload::LockNotify { lock_hash: HASH_LOCK } ),
    ]);

    let (bytes, index) = finish( recording );
    assert_eq!( index.locks.len(), 1 );
    assert_eq!( index.locks[ 0 ].name_idx, string_idx( &index, "mutex" ) );

    // The acquire implies the wait's end; the stored wait stream pairs up.
    let waits: Vec< LockEvt > = read_chunk( &bytes, index.threads[ 0 ].lock_wait_locs[ 0 ] );
    assert_eq!( waits.len(), 2 );
    assert_eq!( waits[ 0 ].kind, LOCK_EVT_WAIT_BEGIN );
    assert_eq!( waits[ 0 ].time_ns, 0 );
    assert_eq!( waits[ 1 ].kind, LOCK_EVT_WAIT_END );
    assert_eq!( waits[ 1 ].time_ns, 10 );

    let uses: Vec< LockEvt > = read_chunk( &bytes, index.lock_use_locs[ 0 ] );
    assert_eq!( uses.len(), 2 );
    assert_eq!( uses[ 0 ].kind, LOCK_EVT_ACQUIRED );
    assert_eq!( uses[ 1 ].kind, LOCK_EVT_RELEASED );

    // The second back-to-back notify is rejected.
    let notifies: Vec< LockEvt > = read_chunk( &bytes, index.lock_ntf_locs[ 0 ] );
    assert_eq!( notifies.len(), 1 );
    assert_eq!( index.errors.len(), 1 );
    assert_eq!( index.errors[ 0 ].kind, RecErrorKind::DuplicateLockNotify.as_u8() );
}

#[test]
fn ctx_switches_and_soft_irqs_become_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::CtxSwitchStart { core_id: 2 } ),
        evt( 1, 50, Payload::CtxSwitchStop ),
        evt( 1, 60, Payload::CtxSwitchStop ),
        evt( 1, 70, Payload::SoftIrqBegin { name_hash: HASH_IRQ } ),
        evt( 1, 95, Payload::SoftIrqEnd ),
        evt( 1, 100, Payload::SoftIrqEnd ),
    ]);

    let (bytes, index) = finish( recording );
    assert!( index.core_qty >= 3 );

    let thread = &index.threads[ 0 ];
    let switches: Vec< CtxSwitchEvt > = read_chunk( &bytes, thread.ctx_switch_locs[ 0 ] );
    assert_eq!( switches.len(), 1 );
    assert_eq!( switches[ 0 ].start_ns, 0 );
    assert_eq!( switches[ 0 ].end_ns, 50 );
    assert_eq!( switches[ 0 ].core_id, 2 );

    let irqs: Vec< SoftIrqEvt > = read_chunk( &bytes, thread.soft_irq_locs[ 0 ] );
    assert_eq!( irqs.len(), 1 );
    assert_eq!( irqs[ 0 ].begin_ns, 70 );
    assert_eq!( irqs[ 0 ].end_ns, 95 );
    assert_eq!( irqs[ 0 ].name_idx, string_idx( &index, "net_rx" ) );

    let kinds: Vec< u8 > = index.errors.iter().map( |error| error.kind ).collect();
    assert_eq!( kinds, vec![
        RecErrorKind::UnmatchedCtxSwitch.as_u8(),
        RecErrorKind::UnmatchedSoftIrqEnd.as_u8()
    ]);
}

#[test]
fn plots_track_their_envelope_and_core_usage_is_global() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::MemPlot { name_hash: HASH_PLOT, value: 5.0 } ),
        evt( 1, 10, Payload::MemPlot { name_hash: HASH_PLOT, value: 9.0 } ),
        evt( 1, 20, Payload::CoreUsage { core_id: 0, is_used: true } ),
        evt( 1, 30, Payload::CoreUsage { core_id: 0, is_used: true } ),
        evt( 1, 40, Payload::CoreUsage { core_id: 1, is_used: true } ),
    ]);

    let mut delta = Delta::default();
    recording.create_delta_record( &mut delta );
    assert!( delta.core_usage_changed );
    assert_eq!( delta.used_core_count, 2 );

    let (bytes, index) = finish( recording );
    let plot_elem = index.elems
        .iter()
        .find( |elem| elem.flags & ElemFlags::SCOPE.bits() == 0 )
        .unwrap();
    assert_eq!( plot_elem.name_idx, string_idx( &index, "heap" ) );
    assert_eq!( plot_elem.abs_y_min, 5.0 );
    assert_eq!( plot_elem.abs_y_max, 9.0 );

    let samples: Vec< GenericEvt > = read_chunk( &bytes, index.threads[ 0 ].mem_plot_locs[ 0 ] );
    assert_eq!( samples.len(), 2 );
    assert_eq!( samples[ 1 ].value, 9.0 );

    assert_eq!( index.used_core_count, 2 );
    assert_eq!( index.core_qty, 2 );
}

#[test]
fn full_chunks_flush_and_feed_the_speck_pyramid() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecordingConfig {
        compression: false,
        chunk_capacity: 2,
        speck_factor: 2,
        ..RecordingConfig::default()
    };
    let mut recording = new_recording_with_config( dir.path(), config );

    let mut events = Vec::new();
    for idx in 0..5_u64 {
        events.push( evt( 1, idx * 20, Payload::ScopeBegin { name_hash: HASH_A } ) );
        events.push( evt( 1, idx * 20 + 10, Payload::ScopeEnd { name_hash: HASH_A } ) );
    }
    recording.store_new_events( &events );

    let (bytes, index) = finish( recording );
    let level = &index.threads[ 0 ].levels[ 0 ];

    // 5 scopes with capacity 2: two full chunks plus the final partial one.
    assert_eq!( level.scope_locs.len(), 3 );
    let mut all: Vec< ScopeEvt > = Vec::new();
    for &loc in &level.scope_locs {
        all.extend( read_chunk::< ScopeEvt >( &bytes, loc ) );
    }
    assert_eq!( all.len(), 5 );
    assert!( all.windows( 2 ).all( |pair| pair[ 0 ].begin_ns < pair[ 1 ].begin_ns ) );

    // Every pyramid level preserves total coverage.
    assert!( level.scope_speck_levels.len() >= 2 );
    for specks in &level.scope_speck_levels {
        let coverage: i64 = specks.iter().map( |speck| speck.coverage_ns ).sum();
        assert_eq!( coverage, 50 );
    }
}

#[test]
fn begin_record_rejects_bad_setups() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecordingConfig { compression: false, ..RecordingConfig::default() };

    let mut recording = Recording::with_config( Box::new( NullSink ), dir.path().to_owned(), false, config.clone() );
    match recording.begin_record( "app", "", 99, 0, 1.0, false, 0, false ) {
        Err( BeginError::UnsupportedProtocol { got: 99 } ) => {},
        other => panic!( "unexpected: {:?}", other.err() )
    }
    assert!( !recording.is_recording() );

    recording.set_recording_config( false, None );
    match recording.begin_record( "app", "", 1, 0, 1.0, false, 0, false ) {
        Err( BeginError::RecordingDisabled ) => {},
        other => panic!( "unexpected: {:?}", other.err() )
    }

    // A forced filename collides on the second run.
    recording.set_recording_config( true, Some( "fixed.trec" ) );
    recording.begin_record( "app", "", 1, 0, 1.0, false, 0, false ).unwrap();
    assert!( recording.is_recording() );
    recording.end_record().unwrap();
    match recording.begin_record( "app", "", 1, 0, 1.0, false, 0, false ) {
        Err( BeginError::NameCollision { .. } ) => {},
        other => panic!( "unexpected: {:?}", other.err() )
    }

    // end_record with nothing in progress is a no-op.
    recording.end_record().unwrap();
}

#[test]
fn adjacent_memory_details_merge_inside_a_scope() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        // Freed straight away: leaves no detail record at all.
        evt( 1, 10, Payload::MemAlloc { pointer: 0x1000, size: 16 } ),
        evt( 1, 20, Payload::MemDealloc { pointer: 0x1000 } ),
        // Two back-to-back allocations collapse into one record.
        evt( 1, 30, Payload::MemAlloc { pointer: 0x2000, size: 24 } ),
        evt( 1, 40, Payload::MemAlloc { pointer: 0x3000, size: 8 } ),
        evt( 1, 50, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    let thread = &index.threads[ 0 ];

    let details: Vec< GenericEvt > = read_chunk( &bytes, thread.levels[ 0 ].non_scope_locs[ 0 ] );
    assert_eq!( details.len(), 1 );
    assert_eq!( details[ 0 ].flags, GENERIC_EVT_ALLOC );
    assert_eq!( details[ 0 ].time_ns, 30 );
    assert_eq!( details[ 0 ].value, 32.0 );

    // Merging only compacts the detail stream; the accounting still sees
    // every event.
    assert_eq!( thread.sum_alloc_qty, 3 );
    assert_eq!( thread.sum_alloc_size, 48 );
    assert_eq!( thread.sum_dealloc_qty, 1 );
    let scopes: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 0 ].scope_locs[ 0 ] );
    assert_eq!( scopes[ 0 ].alloc_qty, 3 );
    assert_eq!( scopes[ 0 ].dealloc_size, 16 );
    assert!( index.errors.is_empty() );
}

#[test]
fn deallocations_after_other_events_keep_their_own_detail_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 10, Payload::MemAlloc { pointer: 0x1000, size: 24 } ),
        evt( 1, 20, Payload::MemAlloc { pointer: 0x2000, size: 40 } ),
        // Not the latest allocation: no folding, a dealloc record appears.
        evt( 1, 30, Payload::MemDealloc { pointer: 0x1000 } ),
        evt( 1, 40, Payload::MemDealloc { pointer: 0x2000 } ),
        evt( 1, 50, Payload::ScopeEnd { name_hash: HASH_A } ),
    ]);

    let (bytes, index) = finish( recording );
    let details: Vec< GenericEvt > = read_chunk( &bytes, index.threads[ 0 ].levels[ 0 ].non_scope_locs[ 0 ] );
    assert_eq!( details.len(), 2 );
    assert_eq!( details[ 0 ].flags, GENERIC_EVT_ALLOC );
    assert_eq!( details[ 0 ].value, 64.0 );
    assert_eq!( details[ 1 ].flags, GENERIC_EVT_DEALLOC );
    assert_eq!( details[ 1 ].time_ns, 30 );
    assert_eq!( details[ 1 ].value, 64.0 );
}

#[test]
fn held_locks_keep_their_usage_start_in_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );
    recording.store_new_string( "rwlock", 0x6666 );

    recording.store_new_events( &[
        // "mutex" is still held when the record closes, with one waiter.
        evt( 1, 10, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: true } ),
        evt( 2, 20, Payload::LockWaitBegin { lock_hash: HASH_LOCK } ),
        // "rwlock" was acquired and fully released.
        evt( 1, 30, Payload::LockUse { lock_hash: 0x6666, is_acquired: true } ),
        evt( 1, 40, Payload::LockUse { lock_hash: 0x6666, is_acquired: false } ),
    ]);

    let (_bytes, index) = finish( recording );
    assert_eq!( index.locks.len(), 2 );

    let held = &index.locks[ 0 ];
    assert_eq!( held.name_idx, string_idx( &index, "mutex" ) );
    assert!( held.is_in_use );
    assert_eq!( held.using_start_thread_id, 1 );
    assert_eq!( held.using_start_time_ns, 10 );
    assert_eq!( held.waiting_thread_ids, vec![ 2 ] );

    let released = &index.locks[ 1 ];
    assert_eq!( released.name_idx, string_idx( &index, "rwlock" ) );
    assert!( !released.is_in_use );
    assert_eq!( released.using_start_thread_id, INVALID_IDX );
    assert_eq!( released.using_start_time_ns, 0 );
    assert!( released.waiting_thread_ids.is_empty() );
}

#[test]
fn lock_deltas_follow_ownership_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );
    let mut delta = Delta::default();

    recording.store_new_events( &[ evt( 1, 0, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: true } ) ] );
    recording.create_delta_record( &mut delta );
    assert_eq!( delta.changed_lock_ids, vec![ 0 ] );

    // A release by a thread that does not hold the lock is an anomaly, not
    // an ownership change.
    recording.store_new_events( &[ evt( 2, 10, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: false } ) ] );
    recording.create_delta_record( &mut delta );
    assert!( delta.changed_lock_ids.is_empty() );

    // Re-acquiring a lock the thread already holds changes nothing either.
    recording.store_new_events( &[
        evt( 1, 20, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: false } ),
        evt( 1, 30, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: true } ),
    ]);
    recording.create_delta_record( &mut delta );
    assert_eq!( delta.changed_lock_ids, vec![ 0 ] );

    recording.store_new_events( &[ evt( 1, 40, Payload::LockUse { lock_hash: HASH_LOCK, is_acquired: true } ) ] );
    recording.create_delta_record( &mut delta );
    assert!( delta.changed_lock_ids.is_empty() );

    let (_bytes, index) = finish( recording );
    assert_eq!( index.errors.len(), 1 );
    assert_eq!( index.errors[ 0 ].kind, RecErrorKind::UnmatchedLockRelease.as_u8() );
}

#[test]
fn unregistered_string_hashes_are_reported_unless_external() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: 0xDEAD } ),
        evt( 1, 10, Payload::ScopeEnd { name_hash: 0xDEAD } ),
    ]);

    let (_bytes, index) = finish( recording );
    assert_eq!( index.errors.len(), 1 );
    assert_eq!( index.errors[ 0 ].kind, RecErrorKind::UnknownStringHash.as_u8() );
    // The record still resolves the hash through a placeholder entry.
    assert!( index.strings.iter().any( |entry| entry.value == "@@000000000000DEAD@@" ) );

    // With externally provided strings, unknown hashes are expected.
    let dir2 = tempfile::tempdir().unwrap();
    let config = RecordingConfig { compression: false, ..RecordingConfig::default() };
    let mut external = Recording::with_config( Box::new( NullSink ), dir2.path().to_owned(), false, config );
    external.begin_record( "app", "", 1, 0, 1.0, true, 0, false ).unwrap();
    external.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: 0xDEAD } ),
        evt( 1, 10, Payload::ScopeEnd { name_hash: 0xDEAD } ),
    ]);
    let (_bytes, index) = finish( external );
    assert!( index.errors.is_empty() );
    assert!( index.strings.iter().any( |entry| entry.value == "@@000000000000DEAD@@" ) );
}

#[test]
fn still_open_scopes_are_closed_at_record_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut recording = new_recording( dir.path() );

    recording.store_new_events( &[
        evt( 1, 0, Payload::ScopeBegin { name_hash: HASH_A } ),
        evt( 1, 25, Payload::ScopeBegin { name_hash: HASH_B } ),
        evt( 1, 60, Payload::MemPlot { name_hash: HASH_PLOT, value: 1.0 } ),
    ]);

    let (bytes, index) = finish( recording );
    let thread = &index.threads[ 0 ];
    assert_eq!( thread.levels.len(), 2 );

    let level0: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 0 ].scope_locs[ 0 ] );
    let level1: Vec< ScopeEvt > = read_chunk( &bytes, thread.levels[ 1 ].scope_locs[ 0 ] );
    assert_eq!( level0[ 0 ].end_ns, 60 );
    assert_eq!( level0[ 0 ].duration_ns, 60 );
    assert_eq!( level1[ 0 ].end_ns, 60 );
    assert_eq!( level1[ 0 ].duration_ns, 35 );
}
