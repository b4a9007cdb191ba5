use std::io;

use common::record::{
    ChunkLoc,
    CoreUsageEvt,
    CtxSwitchEvt,
    ElemValue,
    GenericEvt,
    LockEvt,
    MarkerEvt,
    MemEvt,
    MemSnapshotEntry,
    ScopeEvt,
    SoftIrqEvt
};
use common::speedy::{LittleEndian, Writable};

use crate::writer::RecordWriter;

/// Time range covered by one stored record, used to stamp chunk locations.
pub trait Timed {
    fn start_ns( &self ) -> i64;

    fn end_ns( &self ) -> i64 {
        self.start_ns()
    }
}

impl Timed for ScopeEvt {
    fn start_ns( &self ) -> i64 { self.begin_ns }
    fn end_ns( &self ) -> i64 { self.end_ns }
}

impl Timed for GenericEvt {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for MemEvt {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for CtxSwitchEvt {
    fn start_ns( &self ) -> i64 { self.start_ns }
    fn end_ns( &self ) -> i64 { self.end_ns }
}

impl Timed for SoftIrqEvt {
    fn start_ns( &self ) -> i64 { self.begin_ns }
    fn end_ns( &self ) -> i64 { self.end_ns }
}

impl Timed for LockEvt {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for CoreUsageEvt {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for MarkerEvt {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for ElemValue {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

impl Timed for MemSnapshotEntry {
    fn start_ns( &self ) -> i64 { self.time_ns }
}

/// One stream of time-ordered records: a fixed-capacity in-memory append
/// buffer plus the ordered sequence of already-flushed chunk locations.
/// Every per-thread and global stream category is an instance of this.
pub struct ChunkStream< T > {
    buffer: Vec< T >,
    capacity: usize,
    locs: Vec< ChunkLoc >,
    first_lidx: u32
}

impl< T > ChunkStream< T > where T: Writable< LittleEndian > + Timed {
    pub fn new( capacity: usize ) -> Self {
        ChunkStream {
            buffer: Vec::with_capacity( capacity ),
            capacity,
            locs: Vec::new(),
            first_lidx: 0
        }
    }

    pub fn push( &mut self, record: T ) {
        debug_assert!( self.buffer.len() < self.capacity );
        self.buffer.push( record );
    }

    #[inline]
    pub fn is_full( &self ) -> bool {
        self.buffer.len() >= self.capacity
    }

    pub fn buffered( &self ) -> &[T] {
        &self.buffer
    }

    /// The not-yet-flushed tail record, for in-place merging of adjacent
    /// records before they reach the disk.
    pub fn last_buffered_mut( &mut self ) -> Option< &mut T > {
        self.buffer.last_mut()
    }

    pub fn pop_buffered( &mut self ) -> Option< T > {
        self.buffer.pop()
    }

    /// Stream index of the first record currently buffered.
    pub fn first_lidx( &self ) -> u32 {
        self.first_lidx
    }

    /// Total record count, flushed and buffered.
    pub fn total_len( &self ) -> u32 {
        self.first_lidx + self.buffer.len() as u32
    }

    pub fn locs( &self ) -> &[ChunkLoc] {
        &self.locs
    }

    /// Serializes and writes the buffered records as one chunk. A final
    /// flush keeps the buffer for finalization bookkeeping; a regular flush
    /// clears it so the stream keeps accumulating.
    pub fn flush( &mut self, writer: &mut RecordWriter, is_last: bool ) -> io::Result< () > {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let bytes = self.buffer
            .write_to_vec()
            .map_err( |error| io::Error::new( io::ErrorKind::Other, error.to_string() ) )?;
        let mut loc = writer.write_chunk( &bytes )?;
        loc.start_ns = self.buffer.first().map( |record| record.start_ns() ).unwrap_or( 0 );
        loc.end_ns = self.buffer.last().map( |record| record.end_ns() ).unwrap_or( 0 );
        self.locs.push( loc );

        if !is_last {
            self.first_lidx += self.buffer.len() as u32;
            self.buffer.clear();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkStream;
    use crate::writer::RecordWriter;
    use common::record::GenericEvt;
    use common::speedy::Readable;

    fn evt( time_ns: i64 ) -> GenericEvt {
        GenericEvt { time_ns, name_idx: 7, flags: 0, value: time_ns as f64 }
    }

    #[test]
    fn flush_on_capacity_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "chunks.rec" );
        let mut writer = RecordWriter::create( &path, true ).unwrap();

        let mut stream = ChunkStream::new( 4 );
        for time_ns in 0..4_i64 {
            stream.push( evt( time_ns * 10 ) );
        }
        assert!( stream.is_full() );
        stream.flush( &mut writer, false ).unwrap();

        assert_eq!( stream.first_lidx(), 4 );
        assert_eq!( stream.total_len(), 4 );
        assert_eq!( stream.locs().len(), 1 );

        let loc = stream.locs()[ 0 ];
        assert_eq!( loc.start_ns, 0 );
        assert_eq!( loc.end_ns, 30 );

        stream.push( evt( 100 ) );
        assert_eq!( stream.total_len(), 5 );
        stream.flush( &mut writer, true ).unwrap();
        assert_eq!( stream.locs().len(), 2 );

        // Read the first chunk back through the location descriptor.
        drop( writer );
        let bytes = std::fs::read( &path ).unwrap();
        let raw = &bytes[ loc.offset as usize..(loc.offset + loc.size as u64) as usize ];
        let decompressed;
        let payload = if loc.is_compressed() {
            decompressed = lz4_flex::block::decompress( raw, loc.raw_size as usize ).unwrap();
            &decompressed[ .. ]
        } else {
            raw
        };

        let records: Vec< GenericEvt > = Vec::read_from_buffer( payload ).unwrap();
        assert_eq!( records.len(), 4 );
        assert_eq!( records[ 3 ].time_ns, 30 );
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::create( &dir.path().join( "empty.rec" ), false ).unwrap();
        let mut stream: ChunkStream< GenericEvt > = ChunkStream::new( 4 );
        stream.flush( &mut writer, true ).unwrap();
        assert!( stream.locs().is_empty() );
    }
}
