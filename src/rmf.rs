//! The RMF command protocol: the small set of addressed commands that ride
//! inside framed messages, plus the plain data writes that make up the bulk
//! of wire traffic.
//!
//! Every message starts with a 4-byte big-endian address. Addresses in
//! `COMMAND_LOW..=COMMAND_HIGH` carry a command id (also 4 bytes,
//! big-endian) and a command-specific body; every other address is a plain
//! write of the remaining bytes into that file's logical region.

use anyhow::{anyhow, bail, Result};

pub const COMMAND_LOW: u32 = 0xBFFF_FC00;
pub const COMMAND_HIGH: u32 = 0xBFFF_FFFF;

const CMD_ACK: u32 = 0x0;
const CMD_FILE_INFO: u32 = 0x3;
const CMD_FILE_OPEN: u32 = 0x0A;
const CMD_FILE_CLOSE: u32 = 0x0B;

const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Fixed,
    Stream,
}

impl FileType {
    fn to_u16(self) -> u16 {
        match self {
            FileType::Fixed => 0,
            FileType::Stream => 1,
        }
    }

    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(FileType::Fixed),
            1 => Ok(FileType::Stream),
            other => bail!("unrecognized file type code {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileInfoMsg {
    pub address: u32,
    pub size: u32,
    pub file_type: FileType,
    pub digest_type: u16,
    pub digest: [u8; DIGEST_LEN],
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum RmfMessage {
    Ack,
    FileInfo(FileInfoMsg),
    FileOpen { address: u32 },
    FileClose { address: u32 },
    Write { address: u32, data: Vec<u8> },
}

impl RmfMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RmfMessage::Ack => command_header(CMD_ACK),
            RmfMessage::FileInfo(info) => {
                let mut out = command_header(CMD_FILE_INFO);
                out.extend_from_slice(&info.address.to_be_bytes());
                out.extend_from_slice(&info.size.to_be_bytes());
                out.extend_from_slice(&info.file_type.to_u16().to_be_bytes());
                out.extend_from_slice(&info.digest_type.to_be_bytes());
                out.extend_from_slice(&info.digest);
                out.extend_from_slice(info.name.as_bytes());
                out.push(0);
                out
            }
            RmfMessage::FileOpen { address } => {
                let mut out = command_header(CMD_FILE_OPEN);
                out.extend_from_slice(&address.to_be_bytes());
                out
            }
            RmfMessage::FileClose { address } => {
                let mut out = command_header(CMD_FILE_CLOSE);
                out.extend_from_slice(&address.to_be_bytes());
                out
            }
            RmfMessage::Write { address, data } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            bail!("message shorter than an address field");
        }
        let address = be_u32(&payload[0..4]);
        if !(COMMAND_LOW..=COMMAND_HIGH).contains(&address) {
            return Ok(RmfMessage::Write {
                address,
                data: payload[4..].to_vec(),
            });
        }
        if payload.len() < 8 {
            bail!("command message shorter than a command id field");
        }
        let cmd = be_u32(&payload[4..8]);
        let body = &payload[8..];
        match cmd {
            CMD_ACK => Ok(RmfMessage::Ack),
            CMD_FILE_INFO => decode_file_info(body),
            CMD_FILE_OPEN => {
                if body.len() < 4 {
                    bail!("FILE_OPEN body too short");
                }
                Ok(RmfMessage::FileOpen { address: be_u32(&body[0..4]) })
            }
            CMD_FILE_CLOSE => {
                if body.len() < 4 {
                    bail!("FILE_CLOSE body too short");
                }
                Ok(RmfMessage::FileClose { address: be_u32(&body[0..4]) })
            }
            other => bail!("unrecognized command id 0x{other:X}"),
        }
    }
}

fn decode_file_info(body: &[u8]) -> Result<RmfMessage> {
    if body.len() < 4 + 4 + 2 + 2 + DIGEST_LEN + 1 {
        bail!("FILE_INFO body too short");
    }
    let address = be_u32(&body[0..4]);
    let size = be_u32(&body[4..8]);
    let file_type = FileType::from_u16(be_u16(&body[8..10]))?;
    let digest_type = be_u16(&body[10..12]);
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&body[12..12 + DIGEST_LEN]);
    let name_bytes = &body[12 + DIGEST_LEN..];
    let nul_at = name_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("FILE_INFO name is not NUL-terminated"))?;
    let name = std::str::from_utf8(&name_bytes[..nul_at])
        .map_err(|_| anyhow!("FILE_INFO name is not valid UTF-8"))?
        .to_string();
    Ok(RmfMessage::FileInfo(FileInfoMsg {
        address,
        size,
        file_type,
        digest_type,
        digest,
        name,
    }))
}

fn command_header(cmd: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&COMMAND_LOW.to_be_bytes());
    out.extend_from_slice(&cmd.to_be_bytes());
    out
}

fn be_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[0..4]);
    u32::from_be_bytes(raw)
}

fn be_u16(b: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&b[0..2]);
    u16::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_round_trips() {
        let encoded = RmfMessage::Ack.encode();
        assert_eq!(
            encoded,
            vec![0xBF, 0xFF, 0xFC, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        match RmfMessage::decode(&encoded).unwrap() {
            RmfMessage::Ack => {}
            other => panic!("expected Ack, got {other:?}"),
        }
    }

    #[test]
    fn file_info_round_trips() {
        let info = FileInfoMsg {
            address: 0x0000_0400,
            size: 64,
            file_type: FileType::Fixed,
            digest_type: 0,
            digest: [0u8; DIGEST_LEN],
            name: "Node1.out".to_string(),
        };
        let encoded = RmfMessage::FileInfo(info).encode();
        match RmfMessage::decode(&encoded).unwrap() {
            RmfMessage::FileInfo(decoded) => {
                assert_eq!(decoded.address, 0x0000_0400);
                assert_eq!(decoded.size, 64);
                assert_eq!(decoded.name, "Node1.out");
            }
            other => panic!("expected FileInfo, got {other:?}"),
        }
    }

    #[test]
    fn plain_write_outside_command_range() {
        let msg = RmfMessage::Write { address: 0x1000, data: vec![1, 2, 3] };
        let encoded = msg.encode();
        match RmfMessage::decode(&encoded).unwrap() {
            RmfMessage::Write { address, data } => {
                assert_eq!(address, 0x1000);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_command_is_rejected() {
        let mut bytes = COMMAND_LOW.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0xFFu32.to_be_bytes());
        assert!(RmfMessage::decode(&bytes).is_err());
    }
}
