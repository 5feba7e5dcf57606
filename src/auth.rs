//! MySQL 인증 처리
//!
//! Native password authentication 구현

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::protocol::{server_error, GreetingPacket, PacketChannel, PacketReader};
use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
/// utf8mb4_general_ci
const DEFAULT_COLLATION: u8 = 45;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(&stage3).map(|(a, b)| a ^ b).collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 핸드셰이크 응답 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
) -> Vec<u8> {
    let mut buffer = Vec::new();

    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;
    if database.is_some() {
        flags |= capabilities::CONNECT_WITH_DB;
    }

    buffer.put_u32_le(flags);
    // Max packet size - 0이면 서버 기본값
    buffer.put_u32_le(0);
    buffer.put_u8(collation);
    buffer.put_bytes(0, 23);

    buffer.put_slice(username.as_bytes());
    buffer.put_u8(0);

    let auth_response = create_auth_response(password, scramble);
    buffer.put_u8(auth_response.len() as u8);
    buffer.put_slice(&auth_response);

    if let Some(db) = database {
        buffer.put_slice(db.as_bytes());
        buffer.put_u8(0);
    }

    buffer.put_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
    buffer.put_u8(0);

    buffer
}

async fn expect_packet<S>(channel: &mut PacketChannel<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel.read_packet().await?.ok_or_else(|| {
        CdcError::ConnectionError("Connection closed during authentication".to_string())
    })
}

/// Greeting 수신부터 OK 패킷까지 핸드셰이크 수행
pub async fn authenticate<S>(
    channel: &mut PacketChannel<S>,
    config: &ConnectionConfig,
) -> Result<GreetingPacket>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let greeting = GreetingPacket::parse(&expect_packet(channel).await?)?;
    info!(
        "MySQL server {} (thread {}), auth plugin {}",
        greeting.server_version, greeting.thread_id, greeting.auth_plugin
    );

    let response = create_handshake_response(
        &config.username,
        &config.password,
        config.database.as_deref(),
        &greeting.scramble,
        DEFAULT_COLLATION,
    );
    channel.write_reply(&response).await?;

    loop {
        let packet = expect_packet(channel).await?;
        match packet.first() {
            Some(0x00) => {
                debug!("Authenticated as {}", config.username);
                return Ok(greeting);
            }
            Some(0xFF) => return Err(server_error(&packet)),
            // Auth switch request
            Some(0xFE) => {
                let mut reader = PacketReader::new(&packet[1..]);
                let plugin = String::from_utf8_lossy(reader.read_null_terminated()?).into_owned();
                if plugin != NATIVE_PASSWORD_PLUGIN {
                    return Err(CdcError::ConnectionError(format!(
                        "Unsupported authentication plugin: {}",
                        plugin
                    )));
                }
                let scramble = reader.read_rest();
                let scramble = scramble.strip_suffix(&[0]).unwrap_or(scramble);
                debug!("Server requested auth switch to {}", plugin);
                channel
                    .write_reply(&create_auth_response(&config.password, scramble))
                    .await?;
            }
            // caching_sha2_password fast auth 성공 표시. 이어서 OK 패킷이 옴
            Some(0x01) if packet.get(1) == Some(&0x03) => continue,
            _ => {
                return Err(CdcError::ConnectionError(format!(
                    "Unexpected packet during authentication: {:02x?}",
                    &packet[..packet.len().min(8)]
                )))
            }
        }
    }
}
