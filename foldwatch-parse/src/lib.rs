//! Parsers for the three files a folding client leaves on disk: the text log,
//! the unit-info summary and the binary queue snapshot.

pub mod log;
pub mod queue;
pub mod unit_info;

pub use log::{
    ClientRun, LineData, LineType, LogError, LogLine, LogScan, UnitFrame, UnitLog, UnitStart,
    classify_line, parse_log_bytes, read_log_file,
};
pub use queue::{
    QueueError, QueueSlot, QueueSlotStatus, QueueSnapshot, QueueTrailer, decode_queue,
    read_queue_file,
};
pub use unit_info::{UnitInfo, UnitInfoError, parse_unit_info, read_unit_info_file};
