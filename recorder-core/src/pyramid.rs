use common::record::{ElemValue, ScopeEvt, ScopeSpeck, ValueSpeck};

// Shared level bookkeeping: speck levels are kept fully in memory (they are
// small relative to full-resolution data), each level tracking how many of
// its entries were already reduced into the next-coarser one.
struct Levels< S > {
    levels: Vec< Vec< S > >,
    merged: Vec< usize >,
    factor: usize,
    chunk_capacity: usize
}

impl< S: Clone > Levels< S > {
    fn new( factor: usize, chunk_capacity: usize ) -> Self {
        Levels {
            levels: Vec::new(),
            merged: Vec::new(),
            factor,
            chunk_capacity
        }
    }

    fn push< F >( &mut self, level: usize, speck: S, merge: &F ) where F: Fn( &[S] ) -> S {
        while self.levels.len() <= level {
            self.levels.push( Vec::new() );
            self.merged.push( 0 );
        }

        self.levels[ level ].push( speck );
        if self.levels[ level ].len() - self.merged[ level ] >= self.chunk_capacity {
            self.reduce( level, self.chunk_capacity, merge );
        }
    }

    // Reduces `count` not-yet-merged entries of `level` into the next level.
    fn reduce< F >( &mut self, level: usize, count: usize, merge: &F ) where F: Fn( &[S] ) -> S {
        let start = self.merged[ level ];
        let mut coarse = Vec::with_capacity( (count + self.factor - 1) / self.factor );
        {
            let entries = &self.levels[ level ][ start..start + count ];
            for group in entries.chunks( self.factor ) {
                coarse.push( merge( group ) );
            }
        }

        self.merged[ level ] += count;
        for speck in coarse {
            self.push( level + 1, speck, merge );
        }
    }

    // Reduces every level's unmerged tail, but only where a coarser level
    // already exists; a top level with no coarser sibling stays as-is.
    fn flush_tail< F >( &mut self, merge: &F ) where F: Fn( &[S] ) -> S {
        let mut level = 0;
        while level + 1 < self.levels.len() {
            let pending = self.levels[ level ].len() - self.merged[ level ];
            if pending > 0 {
                self.reduce( level, pending, merge );
            }
            level += 1;
        }
    }
}

fn merge_scope_specks( group: &[ScopeSpeck] ) -> ScopeSpeck {
    let mut merged = group[ 0 ].clone();
    for speck in &group[ 1.. ] {
        merged.end_ns = speck.end_ns;
        merged.coverage_ns += speck.coverage_ns;
    }

    let longest = group
        .iter()
        .max_by_key( |speck| speck.coverage_ns )
        .unwrap();
    merged.lidx = longest.lidx;
    merged
}

fn merge_value_specks( group: &[ValueSpeck] ) -> ValueSpeck {
    let mut merged = group[ 0 ].clone();
    for speck in &group[ 1.. ] {
        merged.min = merged.min.min( speck.min );
        merged.max = merged.max.max( speck.max );
    }
    merged
}

/// Density-preserving pyramid for scope streams: each coarse entry carries
/// the duration-weighted coverage of the scopes it aggregates, so low-zoom
/// rendering shows density of activity instead of sampled spikes.
pub struct ScopePyramid {
    levels: Levels< ScopeSpeck >
}

impl ScopePyramid {
    pub fn new( factor: usize, chunk_capacity: usize ) -> Self {
        ScopePyramid {
            levels: Levels::new( factor, chunk_capacity )
        }
    }

    /// Feeds one flushed full-resolution scope chunk into the pyramid.
    /// `base_lidx` is the stream index of the chunk's first record.
    pub fn on_chunk_flushed( &mut self, scopes: &[ScopeEvt], base_lidx: u32 ) {
        for (group_idx, group) in scopes.chunks( self.levels.factor ).enumerate() {
            let group_base = base_lidx + (group_idx * self.levels.factor) as u32;
            let mut coverage_ns = 0;
            let mut longest_offset = 0;
            let mut longest_duration = -1;
            for (offset, scope) in group.iter().enumerate() {
                coverage_ns += scope.duration_ns;
                if scope.duration_ns > longest_duration {
                    longest_duration = scope.duration_ns;
                    longest_offset = offset;
                }
            }

            let speck = ScopeSpeck {
                start_ns: group[ 0 ].begin_ns,
                end_ns: group[ group.len() - 1 ].end_ns,
                coverage_ns,
                lidx: group_base + longest_offset as u32
            };
            self.levels.push( 0, speck, &merge_scope_specks );
        }
    }

    pub fn flush_tail( &mut self ) {
        self.levels.flush_tail( &merge_scope_specks );
    }

    pub fn speck_levels( &self ) -> &[Vec< ScopeSpeck >] {
        &self.levels.levels
    }

    pub fn clone_levels( &self ) -> Vec< Vec< ScopeSpeck > > {
        self.levels.levels.clone()
    }
}

/// Min/max pyramid for value streams (plots, memory, scope durations): each
/// coarse entry keeps the envelope of the values it aggregates, so any zoom
/// renders a correct min/max band without reading full resolution.
pub struct ValuePyramid {
    levels: Levels< ValueSpeck >
}

impl ValuePyramid {
    pub fn new( factor: usize, chunk_capacity: usize ) -> Self {
        ValuePyramid {
            levels: Levels::new( factor, chunk_capacity )
        }
    }

    pub fn on_chunk_flushed( &mut self, values: &[ElemValue] ) {
        for group in values.chunks( self.levels.factor ) {
            let mut min = group[ 0 ].value;
            let mut max = group[ 0 ].value;
            for value in &group[ 1.. ] {
                min = min.min( value.value );
                max = max.max( value.value );
            }

            let speck = ValueSpeck {
                time_ns: group[ 0 ].time_ns,
                min,
                max
            };
            self.levels.push( 0, speck, &merge_value_specks );
        }
    }

    pub fn flush_tail( &mut self ) {
        self.levels.flush_tail( &merge_value_specks );
    }

    pub fn speck_levels( &self ) -> &[Vec< ValueSpeck >] {
        &self.levels.levels
    }

    pub fn clone_levels( &self ) -> Vec< Vec< ValueSpeck > > {
        self.levels.levels.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{ScopePyramid, ValuePyramid};
    use common::record::{ElemValue, ScopeEvt};

    fn scope( begin_ns: i64, duration_ns: i64 ) -> ScopeEvt {
        ScopeEvt {
            name_idx: 0,
            begin_ns,
            end_ns: begin_ns + duration_ns,
            duration_ns,
            alloc_qty: 0,
            alloc_size: 0,
            dealloc_qty: 0,
            dealloc_size: 0
        }
    }

    #[test]
    fn scope_specks_aggregate_coverage_and_pick_the_longest() {
        let mut pyramid = ScopePyramid::new( 2, 8 );
        let scopes = vec![
            scope( 0, 5 ),
            scope( 10, 20 ),
            scope( 40, 3 ),
            scope( 50, 1 )
        ];
        pyramid.on_chunk_flushed( &scopes, 16 );

        let level0 = &pyramid.speck_levels()[ 0 ];
        assert_eq!( level0.len(), 2 );
        assert_eq!( level0[ 0 ].coverage_ns, 25 );
        assert_eq!( level0[ 0 ].lidx, 17 ); // the 20ns scope
        assert_eq!( level0[ 0 ].start_ns, 0 );
        assert_eq!( level0[ 0 ].end_ns, 30 );
        assert_eq!( level0[ 1 ].coverage_ns, 4 );
        assert_eq!( level0[ 1 ].lidx, 18 );
    }

    #[test]
    fn value_specks_keep_the_envelope_across_levels() {
        // Tiny capacities so the reduction cascades.
        let mut pyramid = ValuePyramid::new( 2, 4 );
        let values: Vec< _ > = (0..32_i64)
            .map( |idx| ElemValue {
                time_ns: idx * 10,
                value: if idx == 13 { 1000.0 } else { idx as f64 },
                lidx: idx as u32
            })
            .collect();

        for chunk in values.chunks( 8 ) {
            pyramid.on_chunk_flushed( chunk );
        }
        pyramid.flush_tail();

        assert!( pyramid.speck_levels().len() >= 2 );
        for level in pyramid.speck_levels() {
            assert!( level.iter().any( |speck| speck.max == 1000.0 ) );
            assert!( level.iter().all( |speck| speck.min <= speck.max ) );
        }
    }

    #[test]
    fn geometric_reduction() {
        let mut pyramid = ValuePyramid::new( 4, 4 );
        let values: Vec< _ > = (0..64_i64)
            .map( |idx| ElemValue { time_ns: idx, value: idx as f64, lidx: idx as u32 } )
            .collect();
        for chunk in values.chunks( 16 ) {
            pyramid.on_chunk_flushed( chunk );
        }

        // 64 values -> 16 level-0 specks -> 4 level-1 -> 1 level-2.
        assert_eq!( pyramid.speck_levels()[ 0 ].len(), 16 );
        assert_eq!( pyramid.speck_levels()[ 1 ].len(), 4 );
        assert_eq!( pyramid.speck_levels()[ 2 ].len(), 1 );
    }
}
