use ahash::AHashMap as HashMap;

use common::record::StringEntry;

/// Append-only string storage, deduplicated by content hash. The index of
/// an entry is its permanent identity; entries are never removed or
/// relocated, so index-based reads stay valid while new entries are
/// appended.
pub struct StringTable {
    entries: Vec< StringEntry >,
    lookup: HashMap< u64, u32 >,
    dirty: Vec< bool >,
    updated_ids: Vec< u32 >
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            entries: Vec::new(),
            lookup: HashMap::new(),
            dirty: Vec::new(),
            updated_ids: Vec::new()
        }
    }

    /// Registers a string under its content hash. Idempotent: the same hash
    /// always yields the same index and does not grow the table. Replacing
    /// a placeholder with a real value marks the entry as updated for the
    /// next delta.
    pub fn store( &mut self, hash: u64, value: &str ) -> u32 {
        if let Some( &idx ) = self.lookup.get( &hash ) {
            let entry = &mut self.entries[ idx as usize ];
            if entry.value != value {
                entry.value = value.to_owned();
                self.mark_updated( idx );
            }
            return idx;
        }

        let idx = self.entries.len() as u32;
        self.entries.push( StringEntry { hash, value: value.to_owned() } );
        self.dirty.push( false );
        self.lookup.insert( hash, idx );
        idx
    }

    /// Resolves a hash to an index, materializing a placeholder entry when
    /// the hash was never registered (external-strings mode).
    pub fn idx_for_hash( &mut self, hash: u64 ) -> u32 {
        if let Some( &idx ) = self.lookup.get( &hash ) {
            return idx;
        }

        let placeholder = format!( "@@{:016X}@@", hash );
        self.store( hash, &placeholder )
    }

    pub fn idx_of( &self, hash: u64 ) -> Option< u32 > {
        self.lookup.get( &hash ).cloned()
    }

    pub fn get( &self, idx: u32 ) -> &str {
        &self.entries[ idx as usize ].value
    }

    pub fn hash_of( &self, idx: u32 ) -> u64 {
        self.entries[ idx as usize ].hash
    }

    pub fn len( &self ) -> usize {
        self.entries.len()
    }

    pub fn entries( &self ) -> &[StringEntry] {
        &self.entries
    }

    fn mark_updated( &mut self, idx: u32 ) {
        if !self.dirty[ idx as usize ] {
            self.dirty[ idx as usize ] = true;
            self.updated_ids.push( idx );
        }
    }

    /// Drains the entries mutated since the last call, skipping indexes at
    /// or past `below_idx` (those are reported as brand new instead).
    pub fn take_updated( &mut self, below_idx: u32, output: &mut Vec< u32 > ) {
        for idx in self.updated_ids.drain( .. ) {
            self.dirty[ idx as usize ] = false;
            if idx < below_idx {
                output.push( idx );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StringTable;

    #[test]
    fn interning_is_idempotent() {
        let mut table = StringTable::new();
        let a = table.store( 0x1234, "render" );
        let b = table.store( 0x1234, "render" );
        assert_eq!( a, b );
        assert_eq!( table.len(), 1 );
        assert_eq!( table.get( a ), "render" );
        assert_eq!( table.hash_of( a ), 0x1234 );
    }

    #[test]
    fn placeholder_is_replaced_and_reported() {
        let mut table = StringTable::new();
        let idx = table.idx_for_hash( 0xBEEF );
        assert_eq!( table.get( idx ), "@@000000000000BEEF@@" );

        let idx2 = table.store( 0xBEEF, "physics" );
        assert_eq!( idx, idx2 );
        assert_eq!( table.get( idx ), "physics" );

        let mut updated = Vec::new();
        table.take_updated( table.len() as u32, &mut updated );
        assert_eq!( updated, vec![ idx ] );

        // Drained flags reset; no repeats across consecutive calls.
        updated.clear();
        table.take_updated( table.len() as u32, &mut updated );
        assert!( updated.is_empty() );
    }

    quickcheck! {
        fn same_hash_same_index( hashes: Vec< u64 > ) -> bool {
            let mut table = StringTable::new();
            let mut first_seen = std::collections::HashMap::new();
            for &hash in &hashes {
                let idx = table.store( hash, "x" );
                let expected = *first_seen.entry( hash ).or_insert( idx );
                if idx != expected {
                    return false;
                }
            }
            table.len() == first_seen.len()
        }
    }
}
