/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The declared body length disagrees with the bytes that are actually
    /// present, or a known kind carries a payload it cannot decode.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The payload does not fit in the 16-bit body length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
