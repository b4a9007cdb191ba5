use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use common::record::{ChunkLoc, RECORD_FORMAT_VERSION, RECORD_MAGIC};

/// Owns the record file and the reusable compression working buffer.
///
/// A write failure poisons the writer: the record is then in a failed state,
/// no further chunks are accepted, and everything flushed so far stays
/// valid and readable.
pub struct RecordWriter {
    fp: File,
    offset: u64,
    compression_enabled: bool,
    working_buffer: Vec< u8 >,
    failed: bool
}

impl RecordWriter {
    pub fn create( path: &Path, compression_enabled: bool ) -> io::Result< Self > {
        let fp = File::create( path )?;
        let mut writer = RecordWriter {
            fp,
            offset: 0,
            compression_enabled,
            working_buffer: Vec::new(),
            failed: false
        };

        writer.write_raw( RECORD_MAGIC )?;
        let mut version = [0_u8; 4];
        (&mut version[ .. ]).write_u32::< LittleEndian >( RECORD_FORMAT_VERSION )?;
        writer.write_raw( &version )?;
        Ok( writer )
    }

    pub fn offset( &self ) -> u64 {
        self.offset
    }

    pub fn has_failed( &self ) -> bool {
        self.failed
    }

    pub fn write_raw( &mut self, bytes: &[u8] ) -> io::Result< u64 > {
        if self.failed {
            return Err( io::Error::new( io::ErrorKind::Other, "record writer is in a failed state" ) );
        }

        let offset = self.offset;
        if let Err( error ) = self.fp.write_all( bytes ) {
            self.failed = true;
            return Err( error );
        }

        self.offset += bytes.len() as u64;
        Ok( offset )
    }

    /// Writes one chunk, compressing it when compression is enabled and the
    /// compressed form is actually smaller. The returned location has an
    /// empty time range; the caller fills it in.
    pub fn write_chunk( &mut self, bytes: &[u8] ) -> io::Result< ChunkLoc > {
        let raw_size = bytes.len() as u32;

        if self.compression_enabled {
            let bound = lz4_flex::block::get_maximum_output_size( bytes.len() );
            if self.working_buffer.len() < bound {
                self.working_buffer.resize( bound, 0 );
            }

            let compressed_size = lz4_flex::block::compress_into( bytes, &mut self.working_buffer )
                .map_err( |error| io::Error::new( io::ErrorKind::Other, error.to_string() ) )?;

            if compressed_size < bytes.len() {
                let offset = self.offset;
                if let Err( error ) = self.fp.write_all( &self.working_buffer[ ..compressed_size ] ) {
                    self.failed = true;
                    return Err( error );
                }
                self.offset += compressed_size as u64;

                return Ok( ChunkLoc {
                    offset,
                    size: compressed_size as u32,
                    raw_size,
                    start_ns: 0,
                    end_ns: 0
                });
            }
        }

        let offset = self.write_raw( bytes )?;
        Ok( ChunkLoc {
            offset,
            size: raw_size,
            raw_size,
            start_ns: 0,
            end_ns: 0
        })
    }

    /// Writes the serialized top-level index followed by the trailing index
    /// offset word, then flushes everything to disk.
    pub fn finalize( &mut self, index_bytes: &[u8] ) -> io::Result< () > {
        let index_offset = self.write_raw( index_bytes )?;
        let mut trailer = [0_u8; 8];
        (&mut trailer[ .. ]).write_u64::< LittleEndian >( index_offset )?;
        self.write_raw( &trailer )?;

        if let Err( error ) = self.fp.flush().and_then( |_| self.fp.sync_all() ) {
            self.failed = true;
            return Err( error );
        }

        Ok(())
    }
}
