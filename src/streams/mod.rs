mod replay;
mod router;

pub use replay::{parse_feed_line, read_json_lines, replay_csv, ControlLine, FeedLine, IngestStats};
pub use router::{run_symbol, TradeRouter};
