//! Log streaming pipeline: tailing, parsing and bounded history.

mod history;
mod parser;
mod tailer;

pub use history::{DEFAULT_HISTORY_CAPACITY, LogHistory};
pub use parser::parse_line;
pub use tailer::{DEFAULT_TAIL_BACKLOG, LOG_CHANNEL_CAPACITY, LogPipeline};
