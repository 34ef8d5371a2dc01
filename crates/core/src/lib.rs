pub mod error;
pub mod peer;
pub mod session;
pub mod source;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod wake;

pub use error::ErrorKey;
pub use session::Session;
pub use source::{DiskSource, FileSource, MemorySource};
pub use state::{
    ChatMessage, ChatSender, ConnectionState, Direction, FileTransfer, SignalStatus,
    TransferStatus, ViewState,
};
pub use transfer::ReceivedFile;
pub use transport::DataTransport;
pub use wake::{NoopWakeLock, WakeLock};
