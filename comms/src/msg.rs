//! The messages of the rendezvous protocol.
//!
//! A body starts with a 4 byte big endian kind. Control bodies carry a JSON `Command`,
//! error bodies a UTF-8 description of the violation.

use std::{borrow::Cow, io};

use serde::{Deserialize, Serialize};

use crate::{Decode, Encode};

type Kind = u32;
const KIND_SIZE: usize = size_of::<Kind>();

const ERR_KIND: Kind = 0;
const CONTROL_KIND: Kind = 1;

/// The group id every rendezvous reserves for the whole world.
pub const WORLD_GROUP: usize = 0;

/// Client to coordinator: `Join`, `NewGroup`, `Barrier`, `Disconnect`.
/// Coordinator to client: `Welcome`, `GroupCreated`, `Release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Welcome { world_size: usize },
    NewGroup { ranks: Vec<usize> },
    GroupCreated { group_id: usize },
    Barrier { group_id: usize },
    Release { group_id: usize },
    Disconnect,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Msg<'a> {
    Control(Command),
    /// A protocol violation, the sender closes the connection right after it.
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Detaches the message from the receive buffer it was decoded from.
    pub fn into_owned(self) -> Msg<'static> {
        match self {
            Msg::Control(cmd) => Msg::Control(cmd),
            Msg::Err(detail) => Msg::Err(Cow::Owned(detail.into_owned())),
        }
    }
}

impl Encode for Msg<'_> {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Msg::Err(detail) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                buf.extend_from_slice(detail.as_bytes());
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
            }
        }

        Ok(())
    }
}

impl<'a> Decode<'a> for Msg<'a> {
    fn decode(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind, body)) = buf.split_first_chunk::<KIND_SIZE>() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body of {} bytes has no room for a kind", buf.len()),
            ));
        };

        match Kind::from_be_bytes(*kind) {
            ERR_KIND => {
                let detail = str::from_utf8(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                Ok(Msg::Err(Cow::Borrowed(detail)))
            }
            CONTROL_KIND => Ok(Msg::Control(serde_json::from_slice(body)?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message kind {other}"),
            )),
        }
    }
}
