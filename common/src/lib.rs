pub extern crate speedy;

mod timestamp;

pub mod event;
pub mod record;

pub use crate::timestamp::TickConverter;
