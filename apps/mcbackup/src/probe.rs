use async_trait::async_trait;
use mcbackup_core::errors::ProbeError;
use mcbackup_core::service::{ServiceProbe, ServiceStatus};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

// Any protocol number works for a status query; -1 is what clients send when probing.
const PROBE_PROTOCOL: i32 = -1;
const MAX_RESPONSE_BYTES: i32 = 1 << 20;

/// Server-list-ping status query against the game port.
pub struct StatusProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl StatusProbe {
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self { host, port, timeout }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn query(&self, address: &str) -> Result<ServiceStatus, ProbeError> {
        let unreachable = |source: io::Error| ProbeError::Unreachable {
            address: address.to_string(),
            source,
        };

        let mut stream = TcpStream::connect(address).await.map_err(unreachable)?;
        stream
            .write_all(&handshake_packet(&self.host, self.port))
            .await
            .map_err(unreachable)?;
        stream
            .write_all(&frame(&[0x00]))
            .await
            .map_err(unreachable)?;

        let body = read_status_body(&mut stream).await?;
        parse_status(&body)
    }
}

#[async_trait]
impl ServiceProbe for StatusProbe {
    async fn status(&self) -> Result<ServiceStatus, ProbeError> {
        let address = self.address();
        match timeout(self.timeout, self.query(&address)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                address,
                timeout: self.timeout,
            }),
        }
    }
}

fn handshake_packet(host: &str, port: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(host.len() + 8);
    write_varint(&mut payload, 0x00);
    write_varint(&mut payload, PROBE_PROTOCOL);
    write_varint(&mut payload, host.len() as i32);
    payload.extend_from_slice(host.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut payload, 1);
    frame(&payload)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut packet, payload.len() as i32);
    packet.extend_from_slice(payload);
    packet
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, ProbeError> {
    let mut value: u32 = 0;
    for position in 0..5 {
        let byte = reader
            .read_u8()
            .await
            .map_err(|err| ProbeError::Malformed(format!("truncated varint: {err}")))?;
        value |= u32::from(byte & 0x7f) << (7 * position);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProbeError::Malformed("varint longer than 5 bytes".to_string()))
}

async fn read_status_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProbeError> {
    let length = read_varint(reader).await?;
    if !(1..=MAX_RESPONSE_BYTES).contains(&length) {
        return Err(ProbeError::Malformed(format!("packet length {length}")));
    }
    let packet_id = read_varint(reader).await?;
    if packet_id != 0x00 {
        return Err(ProbeError::Malformed(format!("unexpected packet id {packet_id:#x}")));
    }
    let json_len = read_varint(reader).await?;
    if json_len < 0 || json_len >= length {
        return Err(ProbeError::Malformed(format!("status length {json_len}")));
    }

    let mut body = vec![0u8; json_len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| ProbeError::Malformed(format!("truncated status body: {err}")))?;
    String::from_utf8(body).map_err(|err| ProbeError::Malformed(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: Option<VersionInfo>,
    players: PlayersInfo,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayersInfo {
    max: u32,
    online: u32,
}

fn parse_status(body: &str) -> Result<ServiceStatus, ProbeError> {
    let response: StatusResponse =
        serde_json::from_str(body).map_err(|err| ProbeError::Malformed(err.to_string()))?;
    Ok(ServiceStatus {
        online: true,
        version: response.version.map(|v| v.name).unwrap_or_default(),
        current_player_count: response.players.online,
        max_player_count: response.players.max,
    })
}
