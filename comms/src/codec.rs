use std::io;

/// Writes a value as a frame body.
pub trait Encode {
    /// Appends the encoding of `self` to `buf`.
    ///
    /// # Errors
    /// Whatever prevents the value from being represented on the wire.
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()>;
}

/// Reads a value back out of a frame body, possibly borrowing from it.
pub trait Decode<'a>: Sized {
    fn decode(buf: &'a [u8]) -> io::Result<Self>;
}
