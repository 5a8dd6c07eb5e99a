//! Length prefixed frames over any async byte stream.
//!
//! Every frame is an 8 byte big endian body length followed by the body. The rendezvous
//! messages in `msg` are one such body.

mod codec;
pub mod msg;
mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Decode, Encode};
pub use receiver::FrameReceiver;
pub use sender::FrameSender;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Bodies larger than this are refused on both ends, control traffic never gets close.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Wraps both halves of a stream into frame aware ends.
///
/// # Arguments
/// * `rx` - The readable half.
/// * `tx` - The writable half.
///
/// # Returns
/// The receiving and sending ends, in that order.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
