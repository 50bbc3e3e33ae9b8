/// Redis wire protocol support
///
/// - `resp`: RESP value parsing and encoding (sentinel replies, request decoding)
/// - `scanner`: incremental reply framing detection for streamed backend replies
/// - `command`: client request decoding and read/write classification
pub mod command;
pub mod resp;
pub mod scanner;

pub use command::{classify, is_read_safe, request_len, Request};
pub use resp::{RespEncoder, RespParseError, RespParser, RespValue};
pub use scanner::{frame_len, scan, ReplyProgress};
