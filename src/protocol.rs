//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 프레이밍(3바이트 길이 + 1바이트 시퀀스)과 바이트 단위 읽기 도구를 제공합니다.

use crate::connection::ReplicationConnection;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::BufMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 단일 패킷 최대 길이. 이 길이의 패킷 뒤에는 이어지는 패킷이 옵니다.
pub const MAX_PACKET_LEN: usize = 0xFF_FFFF;

/// 바이트 슬라이스 위를 움직이는 읽기 커서
///
/// 범위를 벗어난 읽기는 패닉 대신 `ProtocolError`를 반환합니다.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PacketReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(CdcError::truncated("packet", len, self.remaining()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// 남은 바이트 전부
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u24(self.read_bytes(3)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u48(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u48(self.read_bytes(6)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    /// little-endian 가변 길이 정수 (0..=8 바이트)
    pub fn read_uint(&mut self, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        check_int_width(len)?;
        Ok(LittleEndian::read_uint(self.read_bytes(len)?, len))
    }

    /// big-endian 가변 길이 정수 (0..=8 바이트)
    pub fn read_uint_be(&mut self, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        check_int_width(len)?;
        Ok(BigEndian::read_uint(self.read_bytes(len)?, len))
    }

    /// Length-encoded integer. `0xFB`(NULL)은 `None`
    pub fn read_lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        match first {
            0..=0xfa => Ok(Some(first as u64)),
            0xfb => Ok(None),
            0xfc => Ok(Some(self.read_u16()? as u64)),
            0xfd => Ok(Some(self.read_u24()? as u64)),
            0xfe => Ok(Some(self.read_u64()?)),
            0xff => Err(CdcError::ProtocolError(
                "invalid length-encoded integer prefix 0xff".to_string(),
            )),
        }
    }

    pub fn read_lenenc(&mut self) -> Result<u64> {
        self.read_lenenc_int()?.ok_or_else(|| {
            CdcError::ProtocolError("unexpected NULL length-encoded integer".to_string())
        })
    }

    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc()?;
        self.read_bytes(to_usize(len)?)
    }

    pub fn read_null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            CdcError::ProtocolError("missing NUL terminator".to_string())
        })?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// `width` 바이트 little-endian 길이 뒤에 오는 데이터
    pub fn read_length_prefixed(&mut self, width: usize) -> Result<&'a [u8]> {
        let len = self.read_uint(width)?;
        self.read_bytes(to_usize(len)?)
    }
}

fn check_int_width(len: usize) -> Result<()> {
    if len > 8 {
        return Err(CdcError::ProtocolError(format!(
            "integer width {} exceeds 8 bytes",
            len
        )));
    }
    Ok(())
}

pub(crate) fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| CdcError::ProtocolError(format!("length {} does not fit in memory", value)))
}

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 패킷 하나를 읽습니다. 0xFFFFFF 길이 패킷은 다음 패킷과 이어 붙입니다.
    ///
    /// 패킷 경계에서 연결이 닫히면 `None`을 반환합니다.
    pub async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            match self.stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && payload.is_empty() => {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(CdcError::IoError(format!("Failed to read packet header: {}", e)))
                }
            }

            let length = LittleEndian::read_u24(&header[..3]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_LEN {
                return Ok(Some(payload));
            }
        }
    }

    /// 지정한 시퀀스 번호로 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8], sequence: u8) -> Result<()> {
        if data.len() >= MAX_PACKET_LEN {
            return Err(CdcError::ProtocolError(format!(
                "command of {} bytes exceeds a single packet",
                data.len()
            )));
        }

        let mut frame = Vec::with_capacity(4 + data.len());
        frame.put_uint_le(data.len() as u64, 3);
        frame.put_u8(sequence);
        frame.put_slice(data);

        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;

        self.sequence = sequence.wrapping_add(1);
        Ok(())
    }

    /// 마지막으로 읽은 패킷 다음 시퀀스로 응답 쓰기 (핸드셰이크용)
    pub async fn write_reply(&mut self, data: &[u8]) -> Result<()> {
        let sequence = self.sequence;
        self.write_packet(data, sequence).await
    }
}

#[async_trait]
impl<S> ReplicationConnection for PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_command(&mut self, command: &[u8]) -> Result<()> {
        self.write_packet(command, 0).await
    }

    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        PacketChannel::read_packet(self).await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(server_error(data));
        }

        let mut reader = PacketReader::new(data);

        let protocol_version = reader.read_u8()?;
        let server_version = String::from_utf8_lossy(reader.read_null_terminated()?).into_owned();
        let thread_id = reader.read_u32()?;
        let mut scramble = reader.read_bytes(8)?.to_vec();
        reader.skip(1)?;

        let capabilities_lower = reader.read_u16()?;
        let server_collation = reader.read_u8()?;
        let server_status = reader.read_u16()?;
        let capabilities_upper = reader.read_u16()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = reader.read_u8()?;
        reader.skip(10)?;

        // 두 번째 scramble 조각은 최소 13바이트이며 NUL로 끝남
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let part2 = reader.read_bytes(part2_len.min(reader.remaining()))?;
        let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
        scramble.extend_from_slice(part2);

        let plugin = reader.read_rest();
        let plugin = plugin.strip_suffix(&[0]).unwrap_or(plugin);

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin: String::from_utf8_lossy(plugin).into_owned(),
        })
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 길이 9 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

/// ERR 패킷을 `ServerError`로 변환
pub fn server_error(data: &[u8]) -> CdcError {
    if data.len() < 3 {
        return CdcError::ProtocolError("truncated error packet".to_string());
    }
    let code = u16::from_le_bytes([data[1], data[2]]);
    // '#' 뒤에 5바이트 SQLSTATE
    let message = if data.len() >= 9 && data[3] == b'#' {
        &data[9..]
    } else {
        &data[3..]
    };
    CdcError::ServerError {
        code,
        message: String::from_utf8_lossy(message).into_owned(),
    }
}
