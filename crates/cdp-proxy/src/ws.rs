use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_FRAME_HEADER_BYTES: usize = 14;
const CONTROL_MAX_PAYLOAD_BYTES: u64 = 125;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Server-role WebSocket reader over a stream that may carry bytes already
/// read past the HTTP upgrade. Client frames arrive masked and are unmasked
/// here; fragmented data frames are reassembled up to a bounded size.
#[derive(Debug)]
pub struct WsFrameReader<R> {
    prefix: Vec<u8>,
    prefix_offset: usize,
    source: R,
    fragment_opcode: Option<u8>,
    fragment_buf: Vec<u8>,
}

impl<R> WsFrameReader<R> {
    pub fn new(prefix: Vec<u8>, source: R) -> Self {
        Self {
            prefix,
            prefix_offset: 0,
            source,
            fragment_opcode: None,
            fragment_buf: Vec::new(),
        }
    }
}

impl<R> WsFrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Next complete message, or `None` on a clean EOF between messages.
    pub async fn read_message(&mut self) -> io::Result<Option<WsMessage>> {
        loop {
            let frame = match self.read_frame().await? {
                Some(frame) => frame,
                None => {
                    if self.fragment_opcode.is_some() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside a fragmented message",
                        ));
                    }
                    return Ok(None);
                }
            };

            match frame.opcode {
                OPCODE_PING => return Ok(Some(WsMessage::Ping(frame.payload))),
                OPCODE_PONG => return Ok(Some(WsMessage::Pong(frame.payload))),
                OPCODE_CLOSE => return Ok(Some(WsMessage::Close)),
                OPCODE_TEXT | OPCODE_BINARY => {
                    if self.fragment_opcode.is_some() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "data frame interleaved with a fragmented message",
                        ));
                    }
                    if frame.fin {
                        return Ok(Some(finish_message(frame.opcode, frame.payload)?));
                    }
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragment_buf = frame.payload;
                }
                OPCODE_CONTINUATION => {
                    let opcode = self.fragment_opcode.ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            "continuation frame without a message start",
                        )
                    })?;
                    if self.fragment_buf.len() + frame.payload.len() > MAX_MESSAGE_BYTES {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "websocket message exceeds the size limit",
                        ));
                    }
                    self.fragment_buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let payload = std::mem::take(&mut self.fragment_buf);
                        self.fragment_opcode = None;
                        return Ok(Some(finish_message(opcode, payload)?));
                    }
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unsupported websocket opcode",
                    ))
                }
            }
        }
    }

    async fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut initial_header = [0_u8; 2];
        if !self.read_exact_or_eof(&mut initial_header).await? {
            return Ok(None);
        }

        let fin = (initial_header[0] & 0b1000_0000) != 0;
        let opcode = initial_header[0] & 0b0000_1111;
        let masked = (initial_header[1] & 0b1000_0000) != 0;
        let mut payload_len = (initial_header[1] & 0b0111_1111) as u64;

        if (opcode & 0b1000) != 0 {
            if !fin {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "fragmented websocket control frame",
                ));
            }
            if payload_len > CONTROL_MAX_PAYLOAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "websocket control frame payload exceeds 125 bytes",
                ));
            }
        }

        if payload_len == 126 {
            let mut ext_len = [0_u8; 2];
            self.read_exact_required(&mut ext_len, "extended payload length")
                .await?;
            payload_len = u16::from_be_bytes(ext_len) as u64;
        } else if payload_len == 127 {
            let mut ext_len = [0_u8; 8];
            self.read_exact_required(&mut ext_len, "extended payload length")
                .await?;
            payload_len = u64::from_be_bytes(ext_len);
            if (payload_len & (1_u64 << 63)) != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "websocket payload length used the reserved high bit",
                ));
            }
        }

        if payload_len > MAX_MESSAGE_BYTES as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket frame exceeds the size limit",
            ));
        }

        let mut masking_key: Option<[u8; 4]> = None;
        if masked {
            let mut key = [0_u8; 4];
            self.read_exact_required(&mut key, "masking key").await?;
            masking_key = Some(key);
        }

        let mut payload = vec![0_u8; payload_len as usize];
        if payload_len > 0 {
            self.read_exact_required(&mut payload, "payload").await?;
        }
        if let Some(mask) = masking_key {
            for (index, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[index % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }

    async fn read_exact_or_eof(&mut self, out: &mut [u8]) -> io::Result<bool> {
        let mut written = 0_usize;
        while written < out.len() {
            if self.prefix_offset < self.prefix.len() {
                let available = self.prefix.len() - self.prefix_offset;
                let take = available.min(out.len() - written);
                out[written..written + take].copy_from_slice(
                    &self.prefix[self.prefix_offset..self.prefix_offset + take],
                );
                self.prefix_offset += take;
                written += take;
                continue;
            }

            let read = self.source.read(&mut out[written..]).await?;
            if read == 0 {
                if written == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "websocket frame ended before the expected bytes were read",
                ));
            }
            written += read;
        }
        Ok(true)
    }

    async fn read_exact_required(&mut self, out: &mut [u8], label: &str) -> io::Result<()> {
        if self.read_exact_or_eof(out).await? {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed while reading websocket {label}"),
        ))
    }
}

fn finish_message(opcode: u8, payload: Vec<u8>) -> io::Result<WsMessage> {
    match opcode {
        OPCODE_TEXT => {
            let text = String::from_utf8(payload).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "websocket text frame was not valid UTF-8",
                )
            })?;
            Ok(WsMessage::Text(text))
        }
        OPCODE_BINARY => Ok(WsMessage::Binary(payload)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected websocket data opcode",
        )),
    }
}

pub async fn write_text_frame<W>(sink: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(sink, OPCODE_TEXT, text.as_bytes()).await
}

pub async fn write_pong_frame<W>(sink: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > CONTROL_MAX_PAYLOAD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "websocket control frame payload exceeds 125 bytes",
        ));
    }
    write_frame(sink, OPCODE_PONG, payload).await
}

pub async fn write_close_frame<W>(sink: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(sink, OPCODE_CLOSE, &[]).await
}

/// Server frames are never masked.
async fn write_frame<W>(sink: &mut W, opcode: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(MAX_FRAME_HEADER_BYTES + payload.len());
    frame.push(0b1000_0000 | (opcode & 0x0F));
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    sink.write_all(&frame).await?;
    sink.flush().await
}
