//! Error type shared by the codec and every stream stage
//!
//! All errors are recoverable: the caller may fix the input or the
//! configuration and retry. Nothing in the library panics on user data.

use crate::wire::Format;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input packet is of the wrong format for the operation, or malformed
    #[error("invalid packet format: {0}")]
    InvalidPacketFormat(String),

    /// Requested slot is not (or no longer) held in the 250-slot history
    #[error("slot {slot} out of range: history holds slots {first}..={last}")]
    OutOfRange { slot: i64, first: i64, last: i64 },

    /// Configuration value violates a constraint
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Result does not fit the destination capacity
    #[error("buffer overflow: {needed} entries needed, capacity is {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },
}

impl Error {
    pub(crate) fn wrong_format(op: &str, found: Format) -> Self {
        Error::InvalidPacketFormat(format!("{} does not accept {:?} packets", op, found))
    }

    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let e = Error::OutOfRange { slot: 3, first: 10, last: 259 };
        assert_eq!(e.to_string(), "slot 3 out of range: history holds slots 10..=259");
        let e = Error::wrong_format("expand", Format::Flat);
        assert_eq!(e.to_string(), "invalid packet format: expand does not accept Flat packets");
        let e = Error::BufferOverflow { needed: 4096, capacity: 2048 };
        assert!(e.to_string().contains("4096"));
    }
}
