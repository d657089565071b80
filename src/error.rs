use std::time::Duration;

/// Errors raised while talking to a BYD Battery-Box.
///
/// Every variant except [`Error::MalformedRequest`] aborts the running poll cycle; the
/// caller is expected to wait for the next polling interval and start over.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The TCP connection to the battery could not be established.
    #[error("Cannot connect to '{address}': {source}")]
    ConnectFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },
    /// Nothing was received within the exchange deadline.
    #[error("No response within {0:?}")]
    Timeout(Duration),
    /// A response arrived but its trailing CRC-16 does not match its content.
    #[error("Invalid checksum - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The battery answered with a MODBUS exception instead of data.
    #[error("Exception reply - function={function:02X} code={code:02X}")]
    Exception { function: u8, code: u8 },
    /// The response is too short to carry a checksum.
    #[error("Invalid reply size - received={0}")]
    ReplySize(usize),
    /// A request frame could not be encoded.
    #[error("Malformed request: {0}")]
    MalformedRequest(&'static str),
    /// Any other socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
