//! Wire protocol for the single ordered, reliable data channel.
//!
//! Two payload shapes are multiplexed on the channel:
//! - JSON control messages, sent as UTF-8 text (`ChannelMessage`)
//! - raw binary file chunks of at most `CHUNK_SIZE` bytes
//!
//! The receiver disambiguates with [`parse_control`]: text payloads, and
//! binary payloads that decode to UTF-8 and look like a JSON object, are
//! parsed as control messages; everything else is a chunk.

use serde::{Deserialize, Serialize};

/// Maximum payload of a single binary chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outbound buffer level above which the sender pauses until the channel
/// drains.
pub const HIGH_WATER_MARK: usize = 1024 * 1024;

/// Minimum interval between progress updates published for one transfer.
pub const PROGRESS_THROTTLE_MS: u64 = 80;

/// Pause between consecutive files in the send queue.
pub const INTER_FILE_PAUSE_MS: u64 = 200;

/// Poll interval while the outbound buffer sits above the high-water mark.
pub const BACKPRESSURE_POLL_MS: u64 = 20;

/// Deadline for a handshake to reach the connected state.
pub const CONNECT_TIMEOUT_SECS: u64 = 180;

/// Signal strings longer than this do not fit a scannable QR code.
pub const MAX_QR_SIGNAL_LEN: usize = 2000;

/// Control messages exchanged on the data channel.
///
/// Chunks for a file travel between its `file-meta` and `file-complete`;
/// exactly one file is in flight at a time. `file-cancel` and `chat` may
/// interleave with chunks in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Announces the next file; `total_chunks` binary payloads follow.
    #[serde(rename_all = "camelCase")]
    FileMeta {
        id: String,
        name: String,
        size: u64,
        total_chunks: u64,
    },
    /// All chunks for the current file have been sent.
    FileComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Abort the transfer with this id, sent by either side.
    FileCancel { id: String },
    /// Short text message, timestamp in epoch milliseconds.
    Chat { text: String, timestamp: u64 },
}

/// Number of chunks a file of `size` bytes occupies on the wire.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Classify an inbound payload, returning the parsed control message or
/// `None` when the payload is a binary chunk.
///
/// Binary payloads are only considered for JSON when they decode to UTF-8
/// and are braced like an object; a failed parse falls back to chunk so a
/// chunk that happens to start with `{` is never lost.
pub fn parse_control(is_text: bool, data: &[u8]) -> Option<ChannelMessage> {
    if !is_text && !(data.first() == Some(&b'{') && data.last() == Some(&b'}')) {
        return None;
    }
    let text = std::str::from_utf8(data).ok()?;
    serde_json::from_str(text).ok()
}
