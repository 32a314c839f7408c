use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Fixed payload size of a DATA packet. Anything shorter ends a transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram the protocol produces: opcode, block number and a full block.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket or the packet codec
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Codes outside the RFC 1350 table collapse to `Undefined`.
    pub fn from_code(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the block, at most `DATA_BUFFER_SIZE` bytes.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Extracts the null-terminated string at the start of `buf`.
///
/// Returns the string and the position of its terminating 0 byte, or `None` for the position
/// when the buffer ends before a terminator shows up.
fn string_from_buffer(buf: &[u8]) -> (String, Option<usize>) {
    match buf.iter().position(|&b| b == 0x00) {
        Some(end) => (String::from_utf8_lossy(&buf[..end]).into_owned(), Some(end)),
        None => (String::from_utf8_lossy(buf).into_owned(), None),
    }
}

/// The opcode that leads every TFTP datagram
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

/// Reads only the two opcode bytes, so callers can route a datagram before parsing the rest.
pub fn peek_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    if buf.len() < 2 {
        return Err(SocketError::PacketParse("Packet too short to carry an opcode".to_string()));
    }

    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);
    let path_end = match path_end {
        Some(end) => end,
        None => {
            let msg = "Request does not contain a mode, but it needs to!";
            return Err(SocketError::PacketParse(msg.to_string()));
        }
    };

    if path.is_empty() {
        return Err(SocketError::PacketParse("Request names an empty file".to_string()));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);
    if mode_end.is_none() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'"))),
    };

    Ok((path, mode))
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let payload = &buf[4..];
    if payload.len() > DATA_BUFFER_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            payload.len()
        )));
    }
    Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: payload.to_vec() })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_code(u16_from_buffer(&buf[2..4]));
    // Peers are sloppy about the trailing terminator, accept the message either way.
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match peek_op_code(buf)? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) }),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet in network byte order.
    pub fn serialize(&self) -> Vec<u8> {
        let raw_op: u16 = match self.op_code() {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        };

        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&raw_op.to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.code().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around the server's UDP socket. The dispatch loop and every handler task share
/// one instance, so sending and receiving both work through `&self`.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Receives one raw datagram. Decoding is left to the caller.
    pub async fn recv(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        // One spare byte so an oversized DATA packet is seen as such instead of truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_read, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..total_read].to_vec(), src))
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_raw(&packet.serialize(), dst).await
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: hello.txt with terminating nullchar
            0x68, 0x65, 0x6C, 0x6C, 0x6F, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: OCTET, case must not matter
            0x4F, 0x43, 0x54, 0x45, 0x54, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::ReadReq { path: "hello.txt".to_string(), mode: FileMode::Octet });
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: up.bin
            0x75, 0x70, 0x2E, 0x62, 0x69, 0x6E, 0x00,
            // mode: netascii
            0x6E, 0x65, 0x74, 0x61, 0x73, 0x63, 0x69, 0x69, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::WriteReq { path: "up.bin".to_string(), mode: FileMode::NetAscii });
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![0x00, 0x03, 0xAB, 0x01, 0xCA, 0xFE];
        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Data { block: 0xAB01, data: vec![0xCA, 0xFE] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let packet = assert_ok!(Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x07]));
        assert_eq!(packet, Packet::Data { block: 7, data: vec![] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let packet = assert_ok!(Packet::parse_from_buf(&[0x00, 0x04, 0xFF, 0xFE]));
        assert_eq!(packet, Packet::Ack { block: 0xFFFE });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x06,
            // Error message: exists
            0x65, 0x78, 0x69, 0x73, 0x74, 0x73, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(
            packet,
            Packet::Error { code: ErrorCode::FileAlreadyExists, message: "exists".to_string() }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short or unknown opcodes
        assert_err!(Packet::parse_from_buf(&[0x10]));
        assert_err!(Packet::parse_from_buf(&[0x00, 0x04, 0x01]));
        assert_err!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x01]));
        // Unterminated path
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]));
        // Missing mode string
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]));
        // Unterminated mode string
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x6F, 0x63]));
        // Unknown mode string
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]));
        // Empty file name
        assert_err!(Packet::parse_from_buf(&[0x00, 0x02, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00]));
    }

    #[test]
    fn test_oversized_data_is_rejected() {
        let mut buf = vec![0x00, 0x03, 0x00, 0x01];
        buf.extend_from_slice(&[0x41; DATA_BUFFER_SIZE + 1]);
        assert_err!(Packet::parse_from_buf(&buf));

        buf.pop();
        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Data { block: 1, data: vec![0x41; DATA_BUFFER_SIZE] });
    }

    #[test]
    fn test_peek_op_code_ignores_body() {
        // The body is garbage, but routing only needs the first two bytes.
        assert_eq!(assert_ok!(peek_op_code(&[0x00, 0x01, 0xFF])), OpCode::Rrq);
        assert_eq!(assert_ok!(peek_op_code(&[0x00, 0x04])), OpCode::Ack);
        assert_err!(peek_op_code(&[0x00]));
        assert_err!(peek_op_code(&[0x00, 0x00]));
    }

    #[test]
    fn test_serialize_layouts() {
        assert_eq!(Packet::Ack { block: 0x0102 }.serialize(), vec![0x00, 0x04, 0x01, 0x02]);
        assert_eq!(
            Packet::Data { block: 2, data: vec![] }.serialize(),
            vec![0x00, 0x03, 0x00, 0x02]
        );
        assert_eq!(
            Packet::Error { code: ErrorCode::UnknownTid, message: "who?".to_string() }.serialize(),
            vec![0x00, 0x05, 0x00, 0x05, 0x77, 0x68, 0x6F, 0x3F, 0x00]
        );
        assert_eq!(
            Packet::ReadReq { path: "a".to_string(), mode: FileMode::Octet }.serialize(),
            vec![0x00, 0x01, 0x61, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00]
        );
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::BrokenPipe), ErrorCode::Undefined);
        assert_eq!(ErrorCode::from_code(42), ErrorCode::Undefined);
        assert_eq!(ErrorCode::from_code(ErrorCode::NoSuchUser.code()), ErrorCode::NoSuchUser);
    }
}
