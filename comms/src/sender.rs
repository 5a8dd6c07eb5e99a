use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{Encode, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// Writes whole frames, reusing one buffer for every message.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Encodes `msg` and writes it as one frame.
    ///
    /// # Errors
    /// `InvalidInput` if the body exceeds `MAX_FRAME_LEN`, the encoder's error, or any
    /// write error.
    pub async fn send<T: Encode + ?Sized>(&mut self, msg: &T) -> io::Result<()> {
        self.buf.clear();
        self.buf.resize(LEN_TYPE_SIZE, 0);
        msg.encode(&mut self.buf)?;

        let len = self.buf.len() - LEN_TYPE_SIZE;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        let header = (len as LenType).to_be_bytes();
        self.buf[..LEN_TYPE_SIZE].copy_from_slice(&header);
        self.tx.write_all(&self.buf).await?;
        self.tx.flush().await
    }

    /// Shuts the writer down, the peer reads end of stream after the last frame.
    pub async fn close(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
