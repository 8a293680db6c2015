//! Byte-level framing: the `NumHeader` length prefix and the text greeting
//! that precedes the first framed message on every connection.
//!
//! The framer is a pull parser: bytes arrive via [`Framer::push`] and are
//! buffered until a complete greeting or message is available, at which
//! point [`Framer::next_event`] drains the consumed prefix and returns it.
//! Nothing is ever discarded except the bytes that were actually consumed,
//! so a short read never loses data.

use anyhow::{anyhow, Result};

/// Frames larger than this are rejected outright; see the Resource severity
/// class in the error handling section.
pub const MAX_FRAME_SIZE: u32 = 128 * 1024 * 1024;

const GREETING_LINE: &str = "RMFP/1.0";
const NUM_HEADER_KEY: &str = "NumHeader-Format";
const NUM_HEADER_VALUE: &str = "32";

#[derive(Debug, Clone)]
pub struct Greeting {
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub enum FramerEvent {
    Greeting(Greeting),
    Message(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Greeting,
    Message,
}

/// Stream-oriented decoder for one connection's inbound direction.
pub struct Framer {
    mode: Mode,
    buffer: Vec<u8>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            mode: Mode::Greeting,
            buffer: Vec::new(),
        }
    }

    /// Buffers newly-read bytes. Does not attempt to parse them; call
    /// [`Framer::next_event`] in a loop afterwards.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next fully-buffered event, or `None` if more bytes are
    /// needed. Once a [`FramerEvent::Greeting`] has been produced the framer
    /// never parses another one on this instance, even if the peer sends
    /// the greeting text again verbatim - it is simply decoded (and will
    /// almost always fail to decode) as a framed message.
    pub fn next_event(&mut self) -> Result<Option<FramerEvent>> {
        match self.mode {
            Mode::Greeting => self.try_parse_greeting(),
            Mode::Message => self.try_parse_message(),
        }
    }

    fn try_parse_greeting(&mut self) -> Result<Option<FramerEvent>> {
        let Some(blank_at) = find_blank_line(&self.buffer) else {
            if self.buffer.len() > 4096 {
                return Err(anyhow!("greeting exceeds maximum size without a terminating blank line"));
            }
            return Ok(None);
        };
        let text = std::str::from_utf8(&self.buffer[..blank_at])
            .map_err(|_| anyhow!("greeting is not valid UTF-8"))?;
        let mut lines = text.lines();
        let first = lines.next().unwrap_or("");
        if first != GREETING_LINE {
            return Err(anyhow!("unexpected greeting line: {first:?}"));
        }
        let mut headers = Vec::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed greeting header: {line:?}"))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
        let has_num_header = headers
            .iter()
            .any(|(k, v)| k == NUM_HEADER_KEY && v == NUM_HEADER_VALUE);
        if !has_num_header {
            return Err(anyhow!("greeting missing required {NUM_HEADER_KEY}:{NUM_HEADER_VALUE}"));
        }
        let consumed = blank_at + 2;
        self.buffer.drain(..consumed);
        self.mode = Mode::Message;
        Ok(Some(FramerEvent::Greeting(Greeting { headers })))
    }

    fn try_parse_message(&mut self) -> Result<Option<FramerEvent>> {
        let Some((len, header_len)) = decode_num_header(&self.buffer) else {
            return Ok(None);
        };
        if len > MAX_FRAME_SIZE {
            return Err(anyhow!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"));
        }
        let total = header_len + len as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let payload = self.buffer[header_len..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(FramerEvent::Message(payload)))
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Produces the one-time text greeting every connection sends before its
/// first framed message.
pub fn encode_greeting() -> Vec<u8> {
    format!("{GREETING_LINE}\n{NUM_HEADER_KEY}:{NUM_HEADER_VALUE}\n\n").into_bytes()
}

/// Encodes `len` using the short (1 byte) form when it fits in 7 bits,
/// otherwise the long (4 byte, big-endian, top bit set) form.
pub fn encode_num_header(len: u32) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        (len | 0x8000_0000).to_be_bytes().to_vec()
    }
}

/// Decodes a `NumHeader` from the front of `buf`. Returns `(value,
/// header_len)` or `None` if `buf` does not yet contain a complete header.
fn decode_num_header(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        Some((first as u32, 1))
    } else {
        if buf.len() < 4 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[0..4]);
        Some((u32::from_be_bytes(raw) & 0x7FFF_FFFF, 4))
    }
}

/// Wraps a fully-encoded RMF payload in its `NumHeader` length prefix, ready
/// to hand to a transport's `write_all`.
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut out = encode_num_header(payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_bytes() -> Vec<u8> {
        format!("{GREETING_LINE}\n{NUM_HEADER_KEY}:{NUM_HEADER_VALUE}\n\n").into_bytes()
    }

    #[test]
    fn short_header_round_trips() {
        assert_eq!(encode_num_header(30), vec![30u8]);
        assert_eq!(decode_num_header(&[30u8]), Some((30, 1)));
    }

    #[test]
    fn long_header_round_trips() {
        let encoded = encode_num_header(200_000);
        assert_eq!(encoded.len(), 4);
        assert_eq!(decode_num_header(&encoded), Some((200_000, 4)));
    }

    #[test]
    fn parses_greeting_then_message() {
        let mut framer = Framer::new();
        framer.push(&greeting_bytes());
        let ack_payload = vec![0xBFu8, 0xFF, 0xFC, 0x00, 0x00, 0x00, 0x00, 0x00];
        framer.push(&frame_message(&ack_payload));

        match framer.next_event().unwrap() {
            Some(FramerEvent::Greeting(g)) => {
                assert!(g.headers.iter().any(|(k, v)| k == NUM_HEADER_KEY && v == NUM_HEADER_VALUE));
            }
            other => panic!("expected greeting, got {other:?}"),
        }
        match framer.next_event().unwrap() {
            Some(FramerEvent::Message(payload)) => assert_eq!(payload, ack_payload),
            other => panic!("expected message, got {other:?}"),
        }
        assert!(framer.next_event().unwrap().is_none());
    }

    #[test]
    fn rejects_greeting_missing_num_header() {
        let mut framer = Framer::new();
        framer.push(b"RMFP/1.0\nOther:1\n\n");
        assert!(framer.next_event().is_err());
    }

    #[test]
    fn mode_never_reverts_to_greeting() {
        let mut framer = Framer::new();
        framer.push(&greeting_bytes());
        framer.next_event().unwrap();
        // The peer resending the greeting text is just message bytes now.
        framer.push(&greeting_bytes());
        let result = framer.next_event();
        // Either it fails to decode as a sane frame, or it decodes into
        // garbage; either way it must not be treated as a second greeting.
        if let Ok(Some(event)) = result {
            assert!(matches!(event, FramerEvent::Message(_)));
        }
    }

    #[test]
    fn partial_message_waits_for_more_bytes() {
        let mut framer = Framer::new();
        framer.push(&greeting_bytes());
        framer.next_event().unwrap();
        framer.push(&[5u8]); // header says 5 bytes, none supplied yet
        assert!(framer.next_event().unwrap().is_none());
        framer.push(&[1, 2, 3, 4, 5]);
        match framer.next_event().unwrap() {
            Some(FramerEvent::Message(payload)) => assert_eq!(payload, vec![1, 2, 3, 4, 5]),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut framer = Framer::new();
        framer.push(&greeting_bytes());
        framer.next_event().unwrap();
        framer.push(&encode_num_header(MAX_FRAME_SIZE + 1));
        assert!(framer.next_event().is_err());
    }
}
