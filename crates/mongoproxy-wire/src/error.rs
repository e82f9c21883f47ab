/// Errors that can occur during wire message decoding/encoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The header declares a length shorter than the header itself.
    #[error("invalid message length {0} (shorter than header)")]
    InvalidLength(i32),

    /// The header declares a length above the configured maximum.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The stream ended part-way through a frame.
    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A namespace string is not of the form `database.collection`.
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),

    /// A frame body does not match its op code's layout.
    #[error("malformed {op} body: {reason}")]
    MalformedBody { op: &'static str, reason: String },

    /// An embedded document could not be decoded.
    #[error("invalid document: {0}")]
    Decode(#[from] bson::de::Error),

    /// A document could not be encoded.
    #[error("document encoding failed: {0}")]
    Encode(#[from] bson::ser::Error),
}

impl WireError {
    /// Whether the error leaves the byte stream unusable.
    ///
    /// Framing errors are fatal to the connection. Body-level errors are not:
    /// the offending frame was consumed whole and the next frame starts on a
    /// clean boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::InvalidLength(_)
                | WireError::MessageTooLarge { .. }
                | WireError::Truncated { .. }
                | WireError::Io(_)
        )
    }

    pub(crate) fn malformed(op: &'static str, reason: impl Into<String>) -> Self {
        WireError::MalformedBody {
            op,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
