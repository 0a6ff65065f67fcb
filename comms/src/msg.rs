use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize, specs::WorkerSpec};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const PARTIAL_KIND: Header = 2;

/// Location and shape of one leaf inside a partial result.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeafHeader {
    pub path: Vec<String>,
    pub shape: Vec<usize>,
}

impl LeafHeader {
    /// The amount of values this leaf takes from the flat value section.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Describes how the flat `f32` section of a partial result is laid out.
///
/// Leaves appear in the same order as their values, each one taking
/// `LeafHeader::len` values in row major order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartialHeader {
    pub rank: usize,
    pub indices: Vec<usize>,
    pub leaves: Vec<LeafHeader>,
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Partial {
        header: PartialHeader,
        values: &'a [f32],
    },
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello { rank: usize },
    CreateWorker(Box<WorkerSpec>),
    Done { rank: usize },
    Stop,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

fn invalid_data<T>(msg: impl Into<String>) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        Ok(match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                None
            }
            Msg::Data(Payload::Partial { header, values }) => {
                let start = buf.len();
                buf.extend_from_slice(&PARTIAL_KIND.to_be_bytes());

                let len_at = buf.len();
                buf.extend_from_slice(&[0; HEADER_SIZE]);
                let json_at = buf.len();
                serde_json::to_writer(&mut *buf, header)?;

                // The values must start 4 byte aligned relative to the frame.
                while (buf.len() - start) % size_of::<f32>() != 0 {
                    buf.push(b' ');
                }

                let json_len = (buf.len() - json_at) as Header;
                buf[len_at..json_at].copy_from_slice(&json_len.to_be_bytes());
                Some(bytemuck::cast_slice(values))
            }
        })
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind, rest)) = split_header(buf) else {
            return invalid_data(format!(
                "the given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        };

        match kind {
            ERR_KIND => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            PARTIAL_KIND => {
                let Some((json_len, rest)) = split_header(rest) else {
                    return invalid_data("partial result is missing its header length");
                };

                let json_len = json_len as usize;
                if json_len > rest.len() {
                    return invalid_data(format!(
                        "partial header length {json_len} exceeds the frame size {}",
                        rest.len()
                    ));
                }

                let (json, raw) = rest.split_at(json_len);
                let header: PartialHeader = serde_json::from_slice(json)?;
                let values: &[f32] = bytemuck::try_cast_slice(raw)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}")))?;

                let expected: usize = header.leaves.iter().map(LeafHeader::len).sum();
                if expected != values.len() {
                    return invalid_data(format!(
                        "partial header describes {expected} values but {} were sent",
                        values.len()
                    ));
                }

                Ok(Self::Data(Payload::Partial { header, values }))
            }
            byte => invalid_data(format!("received an invalid kind {byte}")),
        }
    }
}

fn split_header(buf: &[u8]) -> Option<(Header, &[u8])> {
    let (head, rest) = buf.split_first_chunk::<HEADER_SIZE>()?;
    Some((Header::from_be_bytes(*head), rest))
}
