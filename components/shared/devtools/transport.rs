/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Low-level packet transports. Streams use the
//! [JSON packet framing](https://firefox-source-docs.mozilla.org/devtools/backend/protocol.html#stream-transport)
//! of the remote debugging protocol; in-process peers exchange serialized
//! packets over channels.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::packet::Packet;

/// Longest length prefix we are willing to parse.
const MAX_LENGTH_DIGITS: usize = 20;

#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Json(serde_json::Error),
    /// The length prefix of a packet could not be parsed.
    BadLength(String),
    TooLarge { length: u64, max: u64 },
    /// The peer has gone away.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(error) => write!(f, "i/o error: {error}"),
            TransportError::Json(error) => write!(f, "malformed JSON packet: {error}"),
            TransportError::BadLength(prefix) => {
                write!(f, "packet length missing / not parsable: {prefix:?}")
            },
            TransportError::TooLarge { length, max } => {
                write!(f, "packet of {length} bytes exceeds the {max} byte limit")
            },
            TransportError::Closed => f.write_str("transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(error: serde_json::Error) -> Self {
        TransportError::Json(error)
    }
}

/// The sending half of a transport.
pub trait PacketSink: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError>;

    /// Tell the peer no more packets will follow.
    fn close(&mut self) {}
}

/// The receiving half of a transport. Packets come out in arrival order;
/// `Ok(None)` means the peer closed the transport cleanly.
pub trait PacketSource: Send {
    fn recv_packet(&mut self) -> Result<Option<Value>, TransportError>;
}

pub trait JsonPacketStream {
    fn write_json_packet<T: Serialize>(&mut self, obj: &T) -> Result<(), TransportError>;
}

impl<W: Write> JsonPacketStream for W {
    fn write_json_packet<T: Serialize>(&mut self, obj: &T) -> Result<(), TransportError> {
        let s = serde_json::to_string(obj)?;
        debug!("<- {}", s);
        write!(self, "{}:{}", s.len(), s)?;
        self.flush()?;
        Ok(())
    }
}

/// Read one `[ascii length]:[JSON data of given length]` packet.
pub fn read_json_packet<R: BufRead>(
    reader: &mut R,
    max_length: u64,
) -> Result<Option<Value>, TransportError> {
    let mut prefix = Vec::new();
    loop {
        let mut byte = [0];
        match reader.read(&mut byte) {
            Ok(0) if prefix.is_empty() => return Ok(None),
            Ok(0) => return Err(TransportError::Closed),
            Ok(_) => {},
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.into()),
        }
        match byte[0] {
            b':' => break,
            digit @ b'0'..=b'9' if prefix.len() < MAX_LENGTH_DIGITS => prefix.push(digit),
            other => {
                prefix.push(other);
                return Err(TransportError::BadLength(
                    String::from_utf8_lossy(&prefix).into_owned(),
                ));
            },
        }
    }

    let prefix = String::from_utf8_lossy(&prefix).into_owned();
    let length: u64 = prefix
        .parse()
        .map_err(|_| TransportError::BadLength(prefix.clone()))?;
    if length > max_length {
        return Err(TransportError::TooLarge {
            length,
            max: max_length,
        });
    }

    let mut packet = Vec::with_capacity(length as usize);
    reader.take(length).read_to_end(&mut packet)?;
    if (packet.len() as u64) < length {
        return Err(TransportError::Closed);
    }
    debug!("-> {}", String::from_utf8_lossy(&packet));
    Ok(Some(serde_json::from_slice(&packet)?))
}

/// Writes framed packets to any byte stream.
pub struct StreamSink<W> {
    stream: W,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(stream: W) -> Self {
        StreamSink { stream }
    }
}

impl<W: Write + Send> PacketSink for StreamSink<W> {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.stream.write_json_packet(packet)
    }
}

impl PacketSink for TcpStream {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write_json_packet(packet)
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Reads framed packets from any byte stream.
pub struct StreamSource<R> {
    reader: BufReader<R>,
    max_length: u64,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(stream: R, max_length: u64) -> Self {
        StreamSource {
            reader: BufReader::new(stream),
            max_length,
        }
    }
}

impl<R: Read + Send> PacketSource for StreamSource<R> {
    fn recv_packet(&mut self) -> Result<Option<Value>, TransportError> {
        read_json_packet(&mut self.reader, self.max_length)
    }
}

/// Split a TCP connection into its two transport halves.
pub fn tcp_transport(
    stream: TcpStream,
    max_length: u64,
) -> io::Result<(TcpStream, StreamSource<TcpStream>)> {
    let reader = stream.try_clone()?;
    Ok((stream, StreamSource::new(reader, max_length)))
}

/// The sending half of an in-process transport.
pub struct ChannelSink {
    sender: Option<Sender<String>>,
}

impl PacketSink for ChannelSink {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::Closed)?;
        let s = serde_json::to_string(packet)?;
        debug!("<- {}", s);
        sender.send(s).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.sender = None;
    }
}

/// The receiving half of an in-process transport.
pub struct ChannelSource {
    receiver: Receiver<String>,
}

impl PacketSource for ChannelSource {
    fn recv_packet(&mut self) -> Result<Option<Value>, TransportError> {
        match self.receiver.recv() {
            Ok(s) => {
                debug!("-> {}", s);
                Ok(Some(serde_json::from_str(&s)?))
            },
            Err(_) => Ok(None),
        }
    }
}

/// One end of an in-process connection.
pub struct ChannelTransport {
    pub sink: ChannelSink,
    pub source: ChannelSource,
}

/// Two connected in-process transport ends. Packets are serialized on the way
/// through, exactly as they would be on a socket.
pub fn channel_transport() -> (ChannelTransport, ChannelTransport) {
    let (a_sender, a_receiver) = unbounded();
    let (b_sender, b_receiver) = unbounded();
    (
        ChannelTransport {
            sink: ChannelSink {
                sender: Some(a_sender),
            },
            source: ChannelSource {
                receiver: b_receiver,
            },
        },
        ChannelTransport {
            sink: ChannelSink {
                sender: Some(b_sender),
            },
            source: ChannelSource {
                receiver: a_receiver,
            },
        },
    )
}
