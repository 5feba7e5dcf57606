//! Binlog 이벤트 스트림
//!
//! 복제 세션을 준비하고(체크섬, 세션 변수, 복제본 등록, 덤프 요청) 이벤트를 하나씩 읽어
//! 디코딩, 필터링, 위치 추적을 수행합니다.
//!
//! 상태: `Disconnected → Registering → Streaming → Closed`.
//! 연결이 끊기면 재연결하지 않고 종료됩니다. 재시작은 호출자가
//! 마지막으로 저장한 [`StreamPosition`]으로 새 스트림을 여는 방식입니다.

use crate::auth;
use crate::binlog::{BinlogParser, DecodeContext, EventDecoderRegistry};
use crate::config::{StartPosition, StreamConfig};
use crate::connection::{CatalogConnection, MySqlConnection, ReplicationConnection};
use crate::error::{CdcError, Result};
use crate::events::*;
use crate::gtid::GtidSet;
use crate::offset::StreamPosition;
use crate::protocol::{is_eof_packet, is_error_packet, server_error, PacketChannel, PacketReader};
use crate::row_decoder::DecodeOptions;
use crate::table_map::TableMetadataCache;
use bytes::BufMut;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;
const BINLOG_THROUGH_GTID: u16 = 0x04;

/// binlog 파일의 첫 이벤트 위치 (4바이트 매직 넘버 다음)
const BINLOG_START_POS: u64 = 4;
/// MariaDB 5.3 이후 이벤트(GTID 등)를 받겠다는 표시
const MARIADB_SLAVE_CAPABILITY: u8 = 4;

const CHECKSUM_QUERY: &str = "SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'";
const CHECKSUM_SET: &str = "SET @master_binlog_checksum = @@global.binlog_checksum";
const BINARY_LOG_STATUS: &str = "SHOW BINARY LOG STATUS";
const MASTER_STATUS: &str = "SHOW MASTER STATUS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Registering,
    Streaming,
    Closed,
}

/// 텍스트 프로토콜 결과 행. NULL은 `None`
type TextRow = Vec<Option<String>>;

/// Pull 방식 binlog 이벤트 스트림
///
/// 테이블 메타데이터 캐시와 위치는 이 스트림만 소유하고 갱신합니다.
pub struct BinlogStream<C: ReplicationConnection> {
    connection: C,
    catalog: Option<Box<dyn CatalogConnection>>,
    config: StreamConfig,
    registry: EventDecoderRegistry,
    format: FormatDescriptionData,
    tables: TableMetadataCache,
    position: StreamPosition,
    state: StreamState,
    has_checksum: bool,
    past_end: bool,
}

impl BinlogStream<PacketChannel<TcpStream>> {
    /// TCP 연결, 인증, 세션 준비까지 마친 스트림을 엽니다.
    ///
    /// 카탈로그 조회에는 `control_connection`(없으면 `connection`) 설정을 사용합니다.
    pub async fn connect(config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let settings = &config.connection;
        info!("Connecting to {}:{}", settings.hostname, settings.port);
        let mut channel =
            PacketChannel::connect(&settings.hostname, settings.port, settings.timeout()).await?;
        auth::authenticate(&mut channel, settings).await?;

        let catalog = MySqlConnection::new(
            config
                .control_connection
                .as_ref()
                .unwrap_or(&config.connection),
        );

        let mut stream = BinlogStream::new(channel, config).with_catalog(Box::new(catalog));
        stream.start().await?;
        Ok(stream)
    }
}

impl<C: ReplicationConnection> BinlogStream<C> {
    /// 인증된 연결 위에 스트림을 만듭니다. 세션 준비는 [`start`](Self::start) 또는
    /// 첫 [`next_event`](Self::next_event) 호출 시 수행됩니다.
    pub fn new(connection: C, config: StreamConfig) -> Self {
        let registry = EventDecoderRegistry::for_dialect(config.dialect);
        let tables = TableMetadataCache::new(config.strict_table_metadata);
        BinlogStream {
            connection,
            catalog: None,
            config,
            registry,
            format: FormatDescriptionData::default(),
            tables,
            position: StreamPosition::default(),
            state: StreamState::Disconnected,
            has_checksum: false,
            past_end: false,
        }
    }

    /// 컬럼 이름 보강에 사용할 카탈로그 연결
    pub fn with_catalog(mut self, catalog: Box<dyn CatalogConnection>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// 기본 디코더 대신 사용할 레지스트리
    pub fn with_registry(mut self, registry: EventDecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// 마지막으로 완전히 처리한 이벤트 다음 위치
    pub fn position(&self) -> &StreamPosition {
        &self.position
    }

    pub fn table_cache(&self) -> &TableMetadataCache {
        &self.tables
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn get_ref(&self) -> &C {
        &self.connection
    }

    /// 세션 준비와 덤프 요청. 이미 시작했으면 아무것도 하지 않습니다.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            StreamState::Streaming => return Ok(()),
            StreamState::Closed => {
                return Err(CdcError::ConnectionError("Stream is closed".to_string()))
            }
            StreamState::Disconnected | StreamState::Registering => {}
        }

        self.state = StreamState::Registering;
        match self.bootstrap().await {
            Ok(()) => {
                self.state = StreamState::Streaming;
                info!("Binlog streaming started at {}", self.position);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start binlog stream: {}", e);
                self.state = StreamState::Closed;
                Err(e)
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<()> {
        self.config.validate()?;

        self.detect_checksum().await?;

        if let Some(period) = self.config.heartbeat_period_secs {
            let nanos = (period * 1_000_000_000.0) as u64;
            self.execute(&format!("SET @master_heartbeat_period = {}", nanos))
                .await?;
            debug!("Heartbeat period set to {}s", period);
        }
        if let Some(uuid) = self.config.replica_uuid {
            self.execute(&format!("SET @slave_uuid = '{}'", uuid)).await?;
        }
        if self.config.dialect == Dialect::MariaDb {
            self.execute(&format!(
                "SET @mariadb_slave_capability = {}",
                MARIADB_SLAVE_CAPABILITY
            ))
            .await?;
        }

        let start = match self.config.start.clone() {
            StartPosition::Current => self.current_position().await?,
            other => other,
        };

        if let StartPosition::MariadbGtid(state) = &start {
            self.execute(&format!(
                "SET @slave_connect_state = '{}'",
                state.replace('\'', "")
            ))
            .await?;
            self.execute("SET @slave_gtid_strict_mode = 1").await?;
            self.execute("SET @slave_gtid_ignore_duplicates = 0").await?;
        }

        self.register().await?;

        match &start {
            StartPosition::File { log_file, log_pos } => {
                self.position.log_file = Some(log_file.clone());
                self.position.log_pos = Some(*log_pos);
            }
            StartPosition::Gtid(set) => self.position.gtid_set = Some(set.clone()),
            StartPosition::MariadbGtid(_) | StartPosition::Current => {}
        }

        let command = self.dump_command(&start)?;
        self.connection.send_command(&command).await?;
        info!("Requested binlog dump from {:?}", start);
        Ok(())
    }

    async fn detect_checksum(&mut self) -> Result<()> {
        let rows = self.query_rows(CHECKSUM_QUERY).await?;
        let algorithm = rows
            .first()
            .and_then(|row| row.get(1).cloned().flatten())
            .unwrap_or_else(|| "NONE".to_string());

        if !algorithm.eq_ignore_ascii_case("NONE") {
            self.execute(CHECKSUM_SET).await?;
            self.has_checksum = true;
        }
        info!("Binlog checksum: {}", algorithm);
        Ok(())
    }

    /// 서버의 현재 binlog 끝. 8.2 이전 서버는 SHOW MASTER STATUS만 지원합니다.
    async fn current_position(&mut self) -> Result<StartPosition> {
        let rows = match self.query_rows(BINARY_LOG_STATUS).await {
            Ok(rows) => rows,
            Err(CdcError::ServerError { code, .. }) => {
                debug!("{} failed ({}), falling back to {}", BINARY_LOG_STATUS, code, MASTER_STATUS);
                self.query_rows(MASTER_STATUS).await?
            }
            Err(e) => return Err(e),
        };

        let row = rows.into_iter().next().ok_or_else(|| {
            CdcError::ConfigError("Binary logging is not enabled on the server".to_string())
        })?;
        let mut columns = row.into_iter();
        let log_file = columns.next().flatten().ok_or_else(|| {
            CdcError::ProtocolError("binary log status without a file name".to_string())
        })?;
        let log_pos = columns
            .next()
            .flatten()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                CdcError::ProtocolError("binary log status without a position".to_string())
            })?;

        // File, Position, Binlog_Do_DB, Binlog_Ignore_DB, Executed_Gtid_Set
        if self.config.dialect == Dialect::MySql {
            if let Some(executed) = columns.nth(2).flatten().filter(|s| !s.trim().is_empty()) {
                self.position.gtid_set = Some(GtidSet::parse(&executed)?);
            }
        }

        Ok(StartPosition::File { log_file, log_pos })
    }

    async fn register(&mut self) -> Result<()> {
        let command = self.register_command();
        self.connection.send_command(&command).await?;
        let reply = self.expect_packet().await?;
        if is_error_packet(&reply) {
            return Err(server_error(&reply));
        }
        debug!("Registered as replica with server_id {}", self.config.server_id);
        Ok(())
    }

    fn register_command(&self) -> Vec<u8> {
        let report = self.config.report.clone().unwrap_or_default();
        let mut buf = Vec::new();
        buf.put_u8(COM_REGISTER_SLAVE);
        buf.put_u32_le(self.config.server_id);
        for field in [&report.hostname, &report.username, &report.password] {
            let bytes = &field.as_bytes()[..field.len().min(255)];
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        buf.put_u16_le(report.port);
        // replication rank, master id
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf
    }

    fn dump_command(&self, start: &StartPosition) -> Result<Vec<u8>> {
        let mut flags = if self.config.blocking {
            0
        } else {
            BINLOG_DUMP_NON_BLOCK
        };
        let mut buf = Vec::new();

        match start {
            StartPosition::Gtid(set) => {
                flags |= BINLOG_THROUGH_GTID;
                buf.put_u8(COM_BINLOG_DUMP_GTID);
                buf.put_u16_le(flags);
                buf.put_u32_le(self.config.server_id);
                // 파일명 없이 GTID로만 위치 지정
                buf.put_u32_le(0);
                buf.put_u64_le(BINLOG_START_POS);
                let len = u32::try_from(set.encoded_len()).map_err(|_| {
                    CdcError::ConfigError("GTID set too large for dump request".to_string())
                })?;
                buf.put_u32_le(len);
                set.encode_into(&mut buf);
            }
            StartPosition::File { log_file, log_pos } => {
                let pos = u32::try_from(*log_pos).map_err(|_| {
                    CdcError::ConfigError(format!("log position {} exceeds 4 bytes", log_pos))
                })?;
                buf.put_u8(COM_BINLOG_DUMP);
                buf.put_u32_le(pos);
                buf.put_u16_le(flags);
                buf.put_u32_le(self.config.server_id);
                buf.put_slice(log_file.as_bytes());
            }
            StartPosition::MariadbGtid(_) => {
                buf.put_u8(COM_BINLOG_DUMP);
                buf.put_u32_le(BINLOG_START_POS as u32);
                buf.put_u16_le(flags);
                buf.put_u32_le(self.config.server_id);
            }
            StartPosition::Current => {
                return Err(CdcError::ConfigError(
                    "current position must be resolved before the dump request".to_string(),
                ))
            }
        }
        Ok(buf)
    }

    async fn expect_packet(&mut self) -> Result<Vec<u8>> {
        self.connection.read_packet().await?.ok_or_else(|| {
            CdcError::ConnectionError("Connection closed during session setup".to_string())
        })
    }

    async fn send_query(&mut self, sql: &str) -> Result<()> {
        let mut command = Vec::with_capacity(sql.len() + 1);
        command.put_u8(COM_QUERY);
        command.put_slice(sql.as_bytes());
        self.connection.send_command(&command).await
    }

    /// 결과 행이 없는 문장 실행
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.send_query(sql).await?;
        let reply = self.expect_packet().await?;
        if is_error_packet(&reply) {
            return Err(server_error(&reply));
        }
        debug!("Executed: {}", sql);
        Ok(())
    }

    /// 텍스트 프로토콜 쿼리. 컬럼 정의는 읽고 버립니다.
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<TextRow>> {
        self.send_query(sql).await?;

        let first = self.expect_packet().await?;
        if is_error_packet(&first) {
            return Err(server_error(&first));
        }
        if first.first() == Some(&0x00) {
            return Ok(Vec::new());
        }
        let column_count = PacketReader::new(&first).read_lenenc()?;

        for _ in 0..column_count {
            self.expect_packet().await?;
        }
        let eof = self.expect_packet().await?;
        if !is_eof_packet(&eof) {
            return Err(CdcError::ProtocolError(
                "expected EOF after column definitions".to_string(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.expect_packet().await?;
            if is_eof_packet(&packet) {
                break;
            }
            if is_error_packet(&packet) {
                return Err(server_error(&packet));
            }
            let mut reader = PacketReader::new(&packet);
            let mut row = Vec::new();
            for _ in 0..column_count {
                let value = match reader.read_lenenc_int()? {
                    Some(len) => Some(
                        String::from_utf8_lossy(reader.read_bytes(crate::protocol::to_usize(len)?)?)
                            .into_owned(),
                    ),
                    None => None,
                };
                row.push(value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// 다음 이벤트. 스트림이 끝났으면 `None`
    ///
    /// blocking 모드에서는 서버가 이벤트를 보낼 때까지 기다립니다.
    /// 에러가 나면 스트림은 닫히고 이후 호출은 `None`을 반환합니다.
    pub async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        match self.state {
            StreamState::Closed => return Ok(None),
            StreamState::Disconnected | StreamState::Registering => self.start().await?,
            StreamState::Streaming => {}
        }

        loop {
            if self.past_end {
                info!("Reached end position {:?}", self.config.end_log_pos);
                self.shutdown().await;
                return Ok(None);
            }

            let packet = match self.connection.read_packet().await {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    warn!("Replication connection closed at {}", self.position);
                    self.state = StreamState::Closed;
                    return Ok(None);
                }
                Err(e) => {
                    error!("Lost replication connection at {}: {}", self.position, e);
                    self.state = StreamState::Closed;
                    return Err(e);
                }
            };

            match packet.first() {
                Some(0x00) => {}
                Some(0xFE) if is_eof_packet(&packet) => {
                    debug!("No more events at {}", self.position);
                    self.shutdown().await;
                    return Ok(None);
                }
                Some(0xFF) => {
                    let err = server_error(&packet);
                    error!("Server error during streaming: {}", err);
                    self.shutdown().await;
                    return Err(err);
                }
                other => {
                    warn!("Skipping unexpected packet with marker {:?}", other);
                    continue;
                }
            }

            match self.process_event(&packet[1..]).await {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to process event at {}: {}", self.position, e);
                    self.shutdown().await;
                    return Err(e);
                }
            }
        }
    }

    /// 이벤트 하나를 처리하고 호출자에게 보낼 이벤트면 반환합니다.
    async fn process_event(&mut self, data: &[u8]) -> Result<Option<BinlogEvent>> {
        let header = BinlogParser::parse_header(data, self.config.dialect)?;
        let body = BinlogParser::event_body(data, self.has_checksum)?;
        let event_type = header.event_type;

        // 캐시와 위치를 유지하려면 필터와 무관하게 디코딩해야 하는 이벤트
        let internal = matches!(
            event_type,
            EventType::FormatDescription
                | EventType::Rotate
                | EventType::TableMap
                | EventType::Gtid
                | EventType::MariadbGtid
        );
        // 시작 시각 이전 이벤트는 내부 처리만 하고 디코딩하지 않음
        let before_target = self
            .config
            .skip_to_timestamp
            .map_or(false, |target| header.timestamp < target);
        let wanted = self.config.allows_event(event_type) && !before_target;

        let mut table_filtered = false;
        if wanted && event_type.is_rows() && self.config.has_table_filter() {
            let table_id =
                BinlogParser::peek_table_id(body, self.format.table_id_len(header.type_code))?;
            table_filtered = match self.tables.get(table_id) {
                Some(table) => !self.config.allows_table(&table.schema, &table.table),
                None => true,
            };
        }

        let data = if internal || (wanted && !table_filtered) {
            Some(self.decode(&header, body).await?)
        } else {
            None
        };

        if event_type != EventType::Rotate && header.next_pos != 0 {
            self.position.log_pos = Some(header.next_pos as u64);
        }
        if let Some(end) = self.config.end_log_pos {
            if self.position.log_pos.map_or(false, |pos| pos >= end) {
                self.past_end = true;
            }
        }

        let data = match data {
            Some(data) if wanted && !table_filtered => data,
            _ => {
                debug!("Filtered {:?} event", event_type);
                return Ok(None);
            }
        };

        Ok(Some(BinlogEvent { header, data }))
    }

    /// 디코딩하고 캐시, 위치 같은 내부 상태에 반영
    async fn decode(&mut self, header: &EventHeader, body: &[u8]) -> Result<BinlogEventData> {
        let data = {
            let ctx = DecodeContext {
                format: &self.format,
                tables: &self.tables,
                options: DecodeOptions {
                    ignore_decode_errors: self.config.ignore_decode_errors,
                },
            };
            self.registry.decode(header, body, &ctx)?
        };

        let data = match data {
            BinlogEventData::TableMap(table) => {
                let table = Arc::try_unwrap(table).unwrap_or_else(|shared| (*shared).clone());
                let installed = self.tables.install(table, self.catalog.as_deref_mut()).await;
                BinlogEventData::TableMap(installed)
            }
            other => other,
        };

        match &data {
            BinlogEventData::FormatDescription(format) => {
                info!(
                    "Format description: server {}, binlog v{}, checksum {:?}",
                    format.server_version, format.binlog_version, format.checksum_algorithm
                );
                if format.checksum_algorithm.is_some()
                    && format.has_checksum() != self.has_checksum
                {
                    warn!(
                        "Format description checksum {:?} disagrees with session setting",
                        format.checksum_algorithm
                    );
                }
                self.format = format.clone();
            }
            BinlogEventData::Rotate(rotate) => {
                info!(
                    "Rotating to {}:{}",
                    rotate.next_binlog_name, rotate.position
                );
                self.position.log_file = Some(rotate.next_binlog_name.clone());
                self.position.log_pos = Some(rotate.position);
                // table id는 파일 단위로 다시 할당됨
                self.tables.clear();
            }
            BinlogEventData::Gtid(event) => {
                if let Some(set) = self.position.gtid_set.as_mut() {
                    let gtid = event.gtid()?;
                    if !set.contains_gtid(&gtid) {
                        set.merge(gtid)?;
                    }
                }
            }
            BinlogEventData::MariadbGtid(event) => {
                self.position
                    .mariadb_gtids
                    .insert(event.gtid.domain_id, event.gtid);
            }
            BinlogEventData::Heartbeat(heartbeat) => {
                debug!("Heartbeat from {}", heartbeat.log_ident);
            }
            _ => {}
        }

        Ok(data)
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.close().await {
            warn!("Error while closing stream: {}", e);
        }
    }

    /// 연결을 닫습니다. 이후 `next_event`는 `None`을 반환합니다.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.state = StreamState::Closed;
        if let Some(catalog) = self.catalog.as_mut() {
            if let Err(e) = catalog.close().await {
                warn!("Failed to close catalog connection: {}", e);
            }
        }
        self.connection.close().await?;
        info!("Binlog stream closed at {}", self.position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::{event_bytes, format_description_body};
    use crate::table_map::column_type;
    use crate::table_map::tests::{StaticCatalog, TableMapBuilder};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use uuid::Uuid;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    /// 미리 정한 패킷을 돌려주고 보낸 명령을 기록하는 연결
    #[derive(Default)]
    struct MockConnection {
        packets: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    impl MockConnection {
        fn push(&mut self, packet: Vec<u8>) {
            self.packets.push_back(packet);
        }

        fn push_all(&mut self, packets: Vec<Vec<u8>>) {
            self.packets.extend(packets);
        }

        fn queries(&self) -> Vec<String> {
            self.sent
                .iter()
                .filter(|c| c.first() == Some(&COM_QUERY))
                .map(|c| String::from_utf8_lossy(&c[1..]).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl ReplicationConnection for MockConnection {
        async fn send_command(&mut self, command: &[u8]) -> Result<()> {
            self.sent.push(command.to_vec());
            Ok(())
        }

        async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.packets.pop_front())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn ok_packet() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    fn eof_packet() -> Vec<u8> {
        vec![0xFE, 0x00, 0x00, 0x02, 0x00]
    }

    fn error_packet(code: u16, message: &str) -> Vec<u8> {
        let mut packet = vec![0xFF];
        packet.extend_from_slice(&code.to_le_bytes());
        packet.extend_from_slice(b"#HY000");
        packet.extend_from_slice(message.as_bytes());
        packet
    }

    fn result_set(columns: usize, rows: &[Vec<Option<&str>>]) -> Vec<Vec<u8>> {
        let mut packets = vec![vec![columns as u8]];
        for _ in 0..columns {
            packets.push(vec![0x03, b'd', b'e', b'f']);
        }
        packets.push(eof_packet());
        for row in rows {
            let mut packet = Vec::new();
            for value in row {
                match value {
                    Some(text) => {
                        packet.push(text.len() as u8);
                        packet.extend_from_slice(text.as_bytes());
                    }
                    None => packet.push(0xFB),
                }
            }
            packets.push(packet);
        }
        packets.push(eof_packet());
        packets
    }

    fn checksum_result(algorithm: &str) -> Vec<Vec<u8>> {
        result_set(2, &[vec![Some("binlog_checksum"), Some(algorithm)]])
    }

    fn event(type_code: u8, next_pos: u32, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x00];
        packet.extend_from_slice(&event_bytes(type_code, next_pos, timestamp, body));
        packet
    }

    fn file_config() -> StreamConfig {
        StreamConfig {
            start: StartPosition::File {
                log_file: "mysql-bin.000001".to_string(),
                log_pos: 4,
            },
            ..Default::default()
        }
    }

    /// 체크섬 NONE + 복제본 등록 OK
    fn file_session() -> MockConnection {
        let mut connection = MockConnection::default();
        connection.push_all(checksum_result("NONE"));
        connection.push(ok_packet());
        connection
    }

    fn users_table_map(with_names: bool) -> Vec<u8> {
        let builder = TableMapBuilder::new(5, "shop", "users")
            .column(column_type::LONG, &[], false)
            .column(column_type::VARCHAR, &[0x40, 0x00], true)
            .optional(3, &[45]);
        let builder = if with_names {
            builder.names(&["id", "name"])
        } else {
            builder
        };
        builder.build()
    }

    fn write_rows(table_id: u64, id: u32, name: &str) -> Vec<u8> {
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(2);
        body.push(0b11);
        body.push(0x00);
        body.extend_from_slice(&id.to_le_bytes());
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        body
    }

    fn query_body(query: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        body
    }

    fn gtid_body(sid: Uuid, gno: u64) -> Vec<u8> {
        let mut body = vec![1];
        body.extend_from_slice(sid.as_bytes());
        body.extend_from_slice(&gno.to_le_bytes());
        body
    }

    fn rotate_body(file: &str, pos: u64) -> Vec<u8> {
        let mut body = pos.to_le_bytes().to_vec();
        body.extend_from_slice(file.as_bytes());
        body
    }

    #[tokio::test]
    async fn test_file_dump_command() {
        let mut stream = BinlogStream::new(file_session(), file_config());
        stream.start().await.unwrap();
        assert_eq!(stream.state(), StreamState::Streaming);

        let sent = &stream.get_ref().sent;
        assert_eq!(stream.get_ref().queries(), vec![CHECKSUM_QUERY.to_string()]);

        let register = &sent[1];
        assert_eq!(register[0], COM_REGISTER_SLAVE);
        assert_eq!(&register[1..5], &255u32.to_le_bytes());

        let dump = sent.last().unwrap();
        assert_eq!(dump[0], COM_BINLOG_DUMP);
        assert_eq!(&dump[1..5], &4u32.to_le_bytes());
        assert_eq!(&dump[5..7], &BINLOG_DUMP_NON_BLOCK.to_le_bytes());
        assert_eq!(&dump[7..11], &255u32.to_le_bytes());
        assert_eq!(&dump[11..], b"mysql-bin.000001");

        assert_eq!(stream.position().log_file.as_deref(), Some("mysql-bin.000001"));
        assert_eq!(stream.position().log_pos, Some(4));
    }

    #[tokio::test]
    async fn test_allow_list_hides_structural_events() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(true)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));
        connection.push(event(code::XID, 331, 10, &9u64.to_le_bytes()));
        connection.push(eof_packet());

        let config = StreamConfig {
            only_events: Some(vec![EventType::WriteRows]),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event_type(), EventType::WriteRows);
        match &event.data {
            BinlogEventData::Rows(rows) => {
                assert_eq!(rows.columns, vec!["id", "name"]);
                match &rows.rows[0] {
                    DecodedRow::Row { values } => {
                        assert_eq!(values["id"], CellValue::Int(1));
                        assert_eq!(values["name"], CellValue::String("kim".to_string()));
                    }
                    other => panic!("unexpected row {:?}", other),
                }
            }
            other => panic!("unexpected data {:?}", other),
        }

        assert!(stream.next_event().await.unwrap().is_none());
        assert_eq!(stream.position().log_pos, Some(331));
        assert_eq!(stream.table_cache().len(), 1);
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.get_ref().closed);
    }

    #[tokio::test]
    async fn test_strict_metadata_without_catalog() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(false)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));

        let config = StreamConfig {
            strict_table_metadata: true,
            only_events: Some(vec![EventType::WriteRows]),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        match stream.next_event().await {
            Err(CdcError::TableMetadataUnavailable { schema, table }) => {
                assert_eq!(schema, "shop");
                assert_eq!(table, "users");
            }
            other => panic!("unexpected: {:?}", other.map(|e| e.map(|e| e.event_type()))),
        }
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_best_effort_metadata_uses_positional_names() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(false)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));

        let config = StreamConfig {
            only_events: Some(vec![EventType::WriteRows]),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        match event.data {
            BinlogEventData::Rows(rows) => {
                assert_eq!(rows.columns, vec!["UNKNOWN_COL0", "UNKNOWN_COL1"]);
                match &rows.rows[0] {
                    DecodedRow::Row { values } => {
                        assert_eq!(values["UNKNOWN_COL1"], CellValue::String("kim".to_string()))
                    }
                    other => panic!("unexpected row {:?}", other),
                }
            }
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_catalog_enrichment() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(false)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));

        let catalog = StaticCatalog::with_table(
            "shop",
            "users",
            &[("user_id", "int(11)"), ("user_name", "varchar(64)")],
        );
        let config = StreamConfig {
            strict_table_metadata: true,
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config).with_catalog(Box::new(catalog));

        let table_map = stream.next_event().await.unwrap().unwrap();
        assert_eq!(table_map.event_type(), EventType::TableMap);

        let rows = stream.next_event().await.unwrap().unwrap();
        match rows.data {
            BinlogEventData::Rows(rows) => assert_eq!(rows.columns, vec!["user_id", "user_name"]),
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_table_filter_drops_rows_but_keeps_metadata() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(true)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));
        connection.push(event(code::XID, 331, 10, &9u64.to_le_bytes()));

        let config = StreamConfig {
            ignored_tables: vec!["shop.users".to_string()],
            ignored_events: vec![EventType::TableMap],
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event_type(), EventType::Xid);
        assert!(stream.table_cache().get(5).is_some());
    }

    #[tokio::test]
    async fn test_end_log_pos_cutoff() {
        let mut connection = file_session();
        connection.push(event(code::QUERY, 200, 10, &query_body("BEGIN")));
        connection.push(event(code::XID, 300, 10, &1u64.to_le_bytes()));
        connection.push(event(code::QUERY, 400, 10, &query_body("BEGIN")));

        let config = StreamConfig {
            end_log_pos: Some(300),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event_type(),
            EventType::Query
        );
        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event_type(),
            EventType::Xid
        );
        assert!(stream.next_event().await.unwrap().is_none());
        assert_eq!(stream.position().log_pos, Some(300));
        assert_eq!(stream.get_ref().packets.len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_resets_position_and_cache() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(true)));
        connection.push(event(code::ROTATE, 0, 0, &rotate_body("mysql-bin.000002", 4)));

        let mut stream = BinlogStream::new(connection, file_config());

        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event_type(),
            EventType::TableMap
        );
        assert_eq!(stream.table_cache().len(), 1);

        let rotate = stream.next_event().await.unwrap().unwrap();
        assert_eq!(rotate.event_type(), EventType::Rotate);
        assert!(stream.table_cache().is_empty());
        assert_eq!(stream.position().log_file.as_deref(), Some("mysql-bin.000002"));
        assert_eq!(stream.position().log_pos, Some(4));
    }

    #[tokio::test]
    async fn test_gtid_dump_and_position_tracking() {
        let sid = Uuid::parse_str(SID).unwrap();
        let set = GtidSet::parse(&format!("{}:1-5", SID)).unwrap();

        let mut connection = file_session();
        connection.push(event(code::GTID, 500, 10, &gtid_body(sid, 6)));
        connection.push(event(code::GTID, 600, 10, &gtid_body(sid, 3)));

        let config = StreamConfig {
            start: StartPosition::Gtid(set.clone()),
            ..Default::default()
        };
        let mut stream = BinlogStream::new(connection, config);

        stream.next_event().await.unwrap().unwrap();
        let dump = stream.get_ref().sent.last().unwrap().clone();
        assert_eq!(dump[0], COM_BINLOG_DUMP_GTID);
        assert_eq!(
            &dump[1..3],
            &(BINLOG_THROUGH_GTID | BINLOG_DUMP_NON_BLOCK).to_le_bytes()
        );
        assert_eq!(&dump[3..7], &255u32.to_le_bytes());
        assert_eq!(&dump[7..11], &0u32.to_le_bytes());
        assert_eq!(&dump[11..19], &4u64.to_le_bytes());
        assert_eq!(&dump[19..23], &(set.encoded_len() as u32).to_le_bytes());
        assert_eq!(&dump[23..], set.encode().as_slice());

        let tracked = stream.position().gtid_set.clone().unwrap();
        assert_eq!(tracked.to_string(), format!("{}:1-6", SID));

        // 이미 포함된 GTID는 집합을 바꾸지 않음
        stream.next_event().await.unwrap().unwrap();
        assert_eq!(
            stream.position().gtid_set.as_ref().unwrap().to_string(),
            format!("{}:1-6", SID)
        );
        assert_eq!(stream.position().log_pos, Some(600));
    }

    #[tokio::test]
    async fn test_server_error_during_streaming() {
        let mut connection = file_session();
        connection.push(error_packet(1236, "Could not find first log file name"));
        let mut stream = BinlogStream::new(connection, file_config());

        match stream.next_event().await {
            Err(CdcError::ServerError { code, .. }) => assert_eq!(code, 1236),
            other => panic!("unexpected: {:?}", other.map(|e| e.is_some())),
        }
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_connection_closed_ends_stream() {
        let mut stream = BinlogStream::new(file_session(), file_config());
        assert!(stream.next_event().await.unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_skip_to_timestamp() {
        let mut connection = file_session();
        connection.push(event(code::QUERY, 200, 100, &query_body("BEGIN")));
        connection.push(event(code::QUERY, 300, 200, &query_body("COMMIT")));

        let config = StreamConfig {
            skip_to_timestamp: Some(150),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.header.timestamp, 200);
        match event.data {
            BinlogEventData::Query(query) => assert_eq!(query.query, "COMMIT"),
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skipped_rows_are_not_decoded() {
        let mut connection = file_session();
        connection.push(event(code::TABLE_MAP, 200, 10, &users_table_map(false)));
        connection.push(event(code::WRITE_ROWS_V2, 300, 10, &write_rows(5, 1, "kim")));
        connection.push(event(code::XID, 331, 2000, &9u64.to_le_bytes()));

        let config = StreamConfig {
            strict_table_metadata: true,
            skip_to_timestamp: Some(1000),
            ..file_config()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event_type(), EventType::Xid);
        assert_eq!(stream.state(), StreamState::Streaming);
        // 건너뛴 구간의 테이블 맵도 캐시에는 남음
        assert!(stream.table_cache().get(5).is_some());
        assert_eq!(stream.position().log_pos, Some(331));
    }

    #[tokio::test]
    async fn test_heartbeat_hidden_unless_requested() {
        let mut connection = file_session();
        connection.push(event(code::HEARTBEAT, 200, 0, b"mysql-bin.000001"));
        connection.push(event(code::XID, 300, 10, &1u64.to_le_bytes()));

        let mut stream = BinlogStream::new(connection, file_config());
        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event_type(),
            EventType::Xid
        );
    }

    #[tokio::test]
    async fn test_checksum_is_stripped() {
        let mut connection = MockConnection::default();
        connection.push_all(checksum_result("CRC32"));
        connection.push(ok_packet());
        connection.push(ok_packet());

        let mut fde = event(code::FORMAT_DESCRIPTION, 0, 0, &format_description_body("8.0.34", 1));
        fde.extend_from_slice(&[1, 2, 3, 4]);
        connection.push(fde);
        let mut xid = event(code::XID, 300, 10, &77u64.to_le_bytes());
        xid.extend_from_slice(&[5, 6, 7, 8]);
        connection.push(xid);

        let mut stream = BinlogStream::new(connection, file_config());
        let fde = stream.next_event().await.unwrap().unwrap();
        match fde.data {
            BinlogEventData::FormatDescription(format) => assert!(format.has_checksum()),
            other => panic!("unexpected data {:?}", other),
        }
        match stream.next_event().await.unwrap().unwrap().data {
            BinlogEventData::Xid(xid) => assert_eq!(xid.xid, 77),
            other => panic!("unexpected data {:?}", other),
        }
        assert!(stream.get_ref().queries().contains(&CHECKSUM_SET.to_string()));
    }

    #[tokio::test]
    async fn test_current_position_falls_back_to_master_status() {
        let mut connection = MockConnection::default();
        connection.push_all(checksum_result("NONE"));
        connection.push(error_packet(1064, "syntax error"));
        connection.push_all(result_set(
            5,
            &[vec![
                Some("mysql-bin.000007"),
                Some("1234"),
                Some(""),
                Some(""),
                Some(""),
            ]],
        ));
        connection.push(ok_packet());

        let mut stream = BinlogStream::new(connection, StreamConfig::default());
        stream.start().await.unwrap();

        assert_eq!(
            stream.get_ref().queries(),
            vec![
                CHECKSUM_QUERY.to_string(),
                BINARY_LOG_STATUS.to_string(),
                MASTER_STATUS.to_string()
            ]
        );
        let dump = stream.get_ref().sent.last().unwrap();
        assert_eq!(&dump[1..5], &1234u32.to_le_bytes());
        assert_eq!(&dump[11..], b"mysql-bin.000007");
        assert!(stream.position().gtid_set.is_none());
    }

    #[tokio::test]
    async fn test_binary_logging_disabled() {
        let mut connection = MockConnection::default();
        connection.push_all(checksum_result("NONE"));
        connection.push_all(result_set(5, &[]));

        let mut stream = BinlogStream::new(connection, StreamConfig::default());
        assert!(matches!(
            stream.start().await,
            Err(CdcError::ConfigError(_))
        ));
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_mariadb_gtid_session() {
        let mut connection = MockConnection::default();
        connection.push_all(checksum_result("NONE"));
        for _ in 0..4 {
            connection.push(ok_packet());
        }
        // 등록
        connection.push(ok_packet());

        let mut gtid = 101u64.to_le_bytes().to_vec();
        gtid.extend_from_slice(&0u32.to_le_bytes());
        gtid.push(0);
        connection.push(event(code::MARIADB_GTID, 500, 10, &gtid));

        let config = StreamConfig {
            dialect: Dialect::MariaDb,
            start: StartPosition::MariadbGtid("0-1-100".to_string()),
            ..Default::default()
        };
        let mut stream = BinlogStream::new(connection, config);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event_type(), EventType::MariadbGtid);

        let queries = stream.get_ref().queries();
        assert_eq!(queries[1], "SET @mariadb_slave_capability = 4");
        assert_eq!(queries[2], "SET @slave_connect_state = '0-1-100'");

        let dump = stream.get_ref().sent.last().unwrap();
        assert_eq!(dump[0], COM_BINLOG_DUMP);
        assert_eq!(dump.len(), 11);

        assert_eq!(
            stream.position().resume_point(),
            StartPosition::MariadbGtid("0-1-101".to_string())
        );
    }
}
