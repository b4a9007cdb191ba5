#[macro_use]
extern crate log;

#[macro_use]
extern crate bitflags;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod chunk;
mod errlog;
mod pyramid;
mod recording;
mod strings;
mod writer;

pub use common::event::{Event, Payload};
pub use common::record;
pub use common::speedy;
pub use common::TickConverter;

pub use crate::chunk::{ChunkStream, Timed};
pub use crate::errlog::{ErrorLog, RecErrorKind, MAX_REC_ERROR_QTY};
pub use crate::pyramid::{ScopePyramid, ValuePyramid};
pub use crate::recording::{
    BeginError,
    ElemFlags,
    EventSink,
    NullSink,
    Recording,
    RecordingConfig,
    MAX_CORE_QTY
};
pub use crate::strings::StringTable;
pub use crate::writer::RecordWriter;
