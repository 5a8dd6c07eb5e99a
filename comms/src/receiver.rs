use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Decode, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// Reads whole frames.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Holds the frame body, the returned `T` may borrow from it.
    ///
    /// # Errors
    /// `UnexpectedEof` when the peer closed between frames, `InvalidData` for a body over
    /// `MAX_FRAME_LEN` or one `T` can't decode.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<T>
    where
        T: Decode<'buf>,
    {
        let mut len_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_buf).await?;
        let len = LenType::from_be_bytes(len_buf);

        let len = match usize::try_from(len) {
            Ok(len) if len <= MAX_FRAME_LEN => len,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
                ));
            }
        };

        buf.resize(len, 0);
        self.rx.read_exact(buf).await?;

        T::decode(buf)
    }
}
