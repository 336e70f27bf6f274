pub mod alarm;
pub mod strptime;

pub use alarm::{AlarmSink, AlarmType};
pub use strptime::{parse_timezone_offset, strptime, ParsedTime};
