use speedy::{Readable, Writable};

/// Converts the raw clock ticks carried by decoded events into nanoseconds
/// relative to the record's origin.
#[derive(Copy, Clone, PartialEq, Debug, Readable, Writable)]
pub struct TickConverter {
    origin_ns: i64,
    tick_to_ns: f64
}

impl TickConverter {
    pub fn new( origin_ns: i64, tick_to_ns: f64 ) -> Self {
        TickConverter { origin_ns, tick_to_ns }
    }

    #[inline]
    pub fn ticks_to_ns( &self, ticks: u64 ) -> i64 {
        (ticks as f64 * self.tick_to_ns) as i64 - self.origin_ns
    }

    #[inline]
    pub fn origin_ns( &self ) -> i64 {
        self.origin_ns
    }

    #[inline]
    pub fn tick_to_ns( &self ) -> f64 {
        self.tick_to_ns
    }
}

#[test]
fn test_tick_conversion() {
    let conv = TickConverter::new( 1_000, 2.0 );
    assert_eq!( conv.ticks_to_ns( 0 ), -1_000 );
    assert_eq!( conv.ticks_to_ns( 500 ), 0 );
    assert_eq!( conv.ticks_to_ns( 1_000 ), 1_000 );

    let identity = TickConverter::new( 0, 1.0 );
    assert_eq!( identity.ticks_to_ns( 123_456 ), 123_456 );
}

#[test]
fn test_tick_conversion_is_monotone() {
    let conv = TickConverter::new( 0, 0.4 );
    let mut last = conv.ticks_to_ns( 0 );
    for ticks in 1..10_000 {
        let now = conv.ticks_to_ns( ticks );
        assert!( now >= last );
        last = now;
    }
}
