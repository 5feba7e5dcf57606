//! MySQL Binlog 이벤트 파싱
//!
//! 복제 연결로 받은 이벤트 하나(패킷의 0x00 표시 바이트 이후)는 다음과 같습니다.
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, 체크섬이 켜진 경우)
//!
//! 타입 코드별 디코더는 [`EventDecoderRegistry`]에 등록됩니다.

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::gtid::GtidSet;
use crate::protocol::{to_usize, PacketReader};
use crate::row_decoder::{bitmap_len, DecodeOptions, RowImageDecoder};
use crate::table_map::{TableMap, TableMetadataCache};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

pub const EVENT_HEADER_SIZE: usize = 19;
pub const CHECKSUM_SIZE: usize = 4;

const SERVER_VERSION_LEN: usize = 50;
/// 체크섬 알고리즘 바이트를 기록하기 시작한 버전
const CHECKSUM_VERSION: (u32, u32, u32) = (5, 6, 1);
/// GTID 이벤트의 logical timestamp 표시
const LOGICAL_TIMESTAMP_TYPE: u8 = 2;
const MARIADB_FL_GROUP_COMMIT_ID: u8 = 0x02;

/// 디코더가 참조하는 스트림 상태
pub struct DecodeContext<'a> {
    pub format: &'a FormatDescriptionData,
    pub tables: &'a TableMetadataCache,
    pub options: DecodeOptions,
}

/// 헤더와 본문(체크섬 제외)을 받아 이벤트 데이터를 만드는 함수
pub type EventDecoder = fn(&EventHeader, &[u8], &DecodeContext<'_>) -> Result<BinlogEventData>;

fn ddl_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?is)^\s*(?:CREATE|ALTER|DROP|RENAME|TRUNCATE)\s+(?:(?:TEMPORARY|OR\s+REPLACE|ONLINE|IGNORE)\s+)*(DATABASE|SCHEMA|TABLE)\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?([`"'\w$.]+)"#,
        )
        .expect("static DDL pattern")
    })
}

/// DDL 문장의 첫 대상 식별자
///
/// 테이블 이름에 스키마가 없으면 쿼리가 실행된 스키마를 사용합니다.
pub(crate) fn ddl_target(query: &str, context_schema: &str) -> Option<DdlTarget> {
    let captures = ddl_pattern().captures(query)?;
    let identifier: String = captures[2]
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '\''))
        .collect();

    if captures[1].eq_ignore_ascii_case("TABLE") {
        let (schema, table) = match identifier.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => (context_schema.to_string(), identifier.clone()),
        };
        Some(DdlTarget {
            schema,
            table: Some(table),
        })
    } else {
        Some(DdlTarget {
            schema: identifier,
            table: None,
        })
    }
}

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8], dialect: Dialect) -> Result<EventHeader> {
        let mut reader = PacketReader::new(data);

        let timestamp = reader.read_u32()?;
        let type_code = reader.read_u8()?;
        let server_id = reader.read_u32()?;
        let event_length = reader.read_u32()?;
        let next_pos = reader.read_u32()?;
        let flags = reader.read_u16()?;

        Ok(EventHeader {
            timestamp,
            type_code,
            event_type: EventType::from_code(type_code, dialect),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 헤더 뒤의 본문. 체크섬이 켜져 있으면 마지막 4바이트를 제외합니다.
    pub fn event_body(data: &[u8], has_checksum: bool) -> Result<&[u8]> {
        let trailer = if has_checksum { CHECKSUM_SIZE } else { 0 };
        if data.len() < EVENT_HEADER_SIZE + trailer {
            return Err(CdcError::truncated(
                "binlog event",
                EVENT_HEADER_SIZE + trailer,
                data.len(),
            ));
        }
        Ok(&data[EVENT_HEADER_SIZE..data.len() - trailer])
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(data: &[u8]) -> Result<FormatDescriptionData> {
        let mut reader = PacketReader::new(data);

        let binlog_version = reader.read_u16()?;
        let server_version = String::from_utf8_lossy(reader.read_bytes(SERVER_VERSION_LEN)?)
            .trim_end_matches('\0')
            .to_string();
        let create_timestamp = reader.read_u32()?;
        let header_length = reader.read_u8()?;
        let rest = reader.read_rest();

        let (post_header_lengths, checksum_algorithm) =
            if version_at_least(&server_version, CHECKSUM_VERSION) && !rest.is_empty() {
                let (lengths, alg) = rest.split_at(rest.len() - 1);
                (lengths.to_vec(), Some(alg[0]))
            } else {
                (rest.to_vec(), None)
            };

        Ok(FormatDescriptionData {
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            post_header_lengths,
            checksum_algorithm,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        let mut reader = PacketReader::new(data);

        let position = reader.read_u64()?;
        let next_binlog_name = String::from_utf8_lossy(reader.read_rest()).into_owned();

        Ok(RotateEventData {
            next_binlog_name,
            position,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        let mut reader = PacketReader::new(data);

        let thread_id = reader.read_u32()?;
        let exec_time = reader.read_u32()?;
        let schema_len = reader.read_u8()? as usize;
        let error_code = reader.read_u16()?;
        let status_len = reader.read_u16()? as usize;

        // Status variables skip
        reader.skip(status_len)?;

        let schema = String::from_utf8_lossy(reader.read_bytes(schema_len)?).into_owned();
        // null terminator
        reader.skip(1)?;
        let query = String::from_utf8_lossy(reader.read_rest()).into_owned();
        let ddl_target = ddl_target(&query, &schema);

        Ok(QueryEventData {
            thread_id,
            exec_time,
            error_code,
            schema,
            query,
            ddl_target,
        })
    }

    /// XID 이벤트 파싱 (16)
    pub fn parse_xid_event(data: &[u8]) -> Result<XidEventData> {
        let xid = PacketReader::new(data).read_u64()?;
        Ok(XidEventData { xid })
    }

    /// GTID / ANONYMOUS_GTID 이벤트 파싱 (33, 34)
    pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
        let mut reader = PacketReader::new(data);

        let flags = reader.read_u8()?;
        let sid = Uuid::from_slice(reader.read_bytes(16)?)
            .map_err(|e| CdcError::ProtocolError(format!("invalid GTID sid: {}", e)))?;
        let gno = reader.read_u64()?;

        let (last_committed, sequence_number) =
            if !reader.is_empty() && reader.read_u8()? == LOGICAL_TIMESTAMP_TYPE {
                (
                    Some(reader.read_u64()? as i64),
                    Some(reader.read_u64()? as i64),
                )
            } else {
                (None, None)
            };

        Ok(GtidEventData {
            sid,
            gno,
            committed: flags == 1,
            last_committed,
            sequence_number,
        })
    }

    /// HEARTBEAT 이벤트 파싱 (27, 41)
    pub fn parse_heartbeat(type_code: u8, data: &[u8]) -> Result<HeartbeatData> {
        if type_code != code::HEARTBEAT_V2 {
            return Ok(HeartbeatData {
                log_ident: String::from_utf8_lossy(data).into_owned(),
            });
        }

        // v2: (타입, 길이, 값) 목록. 1 = 파일명
        let mut reader = PacketReader::new(data);
        let mut log_ident = String::new();
        while !reader.is_empty() {
            let field = reader.read_u8()?;
            let value = reader.read_lenenc_bytes()?;
            if field == 1 {
                log_ident = String::from_utf8_lossy(value).into_owned();
            }
        }
        Ok(HeartbeatData { log_ident })
    }

    /// ROWS_QUERY 이벤트 파싱 (29). 첫 바이트의 길이는 255에서 잘리므로 무시합니다.
    pub fn parse_rows_query(data: &[u8]) -> Result<String> {
        let mut reader = PacketReader::new(data);
        reader.skip(1)?;
        Ok(String::from_utf8_lossy(reader.read_rest()).into_owned())
    }

    pub fn parse_intvar(data: &[u8]) -> Result<IntvarData> {
        let mut reader = PacketReader::new(data);
        Ok(IntvarData {
            kind: reader.read_u8()?,
            value: reader.read_u64()?,
        })
    }

    pub fn parse_rand(data: &[u8]) -> Result<RandData> {
        let mut reader = PacketReader::new(data);
        Ok(RandData {
            seed1: reader.read_u64()?,
            seed2: reader.read_u64()?,
        })
    }

    pub fn parse_begin_load_query(data: &[u8]) -> Result<BeginLoadQueryData> {
        let mut reader = PacketReader::new(data);
        Ok(BeginLoadQueryData {
            file_id: reader.read_u32()?,
            block_data: reader.read_rest().to_vec(),
        })
    }

    /// EXECUTE_LOAD_QUERY 이벤트 파싱 (18). QUERY 이벤트에 파일 정보가 붙은 형태
    pub fn parse_execute_load_query(data: &[u8]) -> Result<ExecuteLoadQueryData> {
        let mut reader = PacketReader::new(data);

        let thread_id = reader.read_u32()?;
        let exec_time = reader.read_u32()?;
        let schema_len = reader.read_u8()? as usize;
        let error_code = reader.read_u16()?;
        let status_len = reader.read_u16()? as usize;
        let file_id = reader.read_u32()?;
        let start_pos = reader.read_u32()?;
        let end_pos = reader.read_u32()?;
        let dup_handling = reader.read_u8()?;

        reader.skip(status_len)?;
        let schema = String::from_utf8_lossy(reader.read_bytes(schema_len)?).into_owned();
        reader.skip(1)?;
        let query = String::from_utf8_lossy(reader.read_rest()).into_owned();

        Ok(ExecuteLoadQueryData {
            thread_id,
            exec_time,
            error_code,
            schema,
            query,
            file_id,
            start_pos,
            end_pos,
            dup_handling,
        })
    }

    /// PREVIOUS_GTIDS 이벤트 파싱 (35)
    pub fn parse_previous_gtids(data: &[u8]) -> Result<GtidSet> {
        GtidSet::read_from(&mut PacketReader::new(data))
    }

    /// MariaDB GTID 이벤트 파싱 (162). 서버 ID는 이벤트 헤더의 값입니다.
    pub fn parse_mariadb_gtid(header: &EventHeader, data: &[u8]) -> Result<MariadbGtidEventData> {
        let mut reader = PacketReader::new(data);

        let sequence = reader.read_u64()?;
        let domain_id = reader.read_u32()?;
        let flags = reader.read_u8()?;
        let commit_id = if flags & MARIADB_FL_GROUP_COMMIT_ID != 0 {
            Some(reader.read_u64()?)
        } else {
            None
        };

        Ok(MariadbGtidEventData {
            gtid: MariadbGtid {
                domain_id,
                server_id: header.server_id,
                sequence,
            },
            flags,
            commit_id,
        })
    }

    /// MariaDB GTID_LIST 이벤트 파싱 (163)
    pub fn parse_mariadb_gtid_list(data: &[u8]) -> Result<Vec<MariadbGtid>> {
        let mut reader = PacketReader::new(data);
        // 상위 4비트는 플래그
        let count = reader.read_u32()? & 0x0fff_ffff;

        // 항목당 16바이트
        let mut gtids = Vec::with_capacity((count as usize).min(reader.remaining() / 16));
        for _ in 0..count {
            gtids.push(MariadbGtid {
                domain_id: reader.read_u32()?,
                server_id: reader.read_u32()?,
                sequence: reader.read_u64()?,
            });
        }
        Ok(gtids)
    }

    /// MariaDB BINLOG_CHECKPOINT 이벤트 파싱 (161)
    pub fn parse_mariadb_checkpoint(data: &[u8]) -> Result<String> {
        let mut reader = PacketReader::new(data);
        let len = reader.read_u32()? as usize;
        Ok(String::from_utf8_lossy(reader.read_bytes(len)?).into_owned())
    }

    /// MariaDB START_ENCRYPTION 이벤트 파싱 (164)
    pub fn parse_mariadb_start_encryption(data: &[u8]) -> Result<MariadbStartEncryptionData> {
        let mut reader = PacketReader::new(data);
        Ok(MariadbStartEncryptionData {
            schema: reader.read_u8()?,
            key_version: reader.read_u32()?,
            nonce: reader.read_bytes(12)?.to_vec(),
        })
    }

    /// 행/테이블 맵 이벤트 본문 앞의 table id
    pub fn peek_table_id(data: &[u8], table_id_len: usize) -> Result<u64> {
        PacketReader::new(data).read_uint(table_id_len)
    }

    /// WRITE/UPDATE/DELETE_ROWS 이벤트 파싱 (23-25, 30-32)
    pub fn parse_rows_event(
        header: &EventHeader,
        data: &[u8],
        ctx: &DecodeContext<'_>,
    ) -> Result<RowsEventData> {
        let kind = match header.event_type {
            EventType::WriteRows => RowsKind::Write,
            EventType::UpdateRows => RowsKind::Update,
            EventType::DeleteRows => RowsKind::Delete,
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "{:?} is not a rows event",
                    other
                )))
            }
        };

        let mut reader = PacketReader::new(data);
        let table_id = reader.read_uint(ctx.format.table_id_len(header.type_code))?;
        let flags = reader.read_u16()?;

        if matches!(
            header.type_code,
            code::WRITE_ROWS_V2 | code::UPDATE_ROWS_V2 | code::DELETE_ROWS_V2
        ) {
            // extra data 길이는 자기 자신 2바이트를 포함
            let extra_len = reader.read_u16()? as usize;
            reader.skip(extra_len.saturating_sub(2))?;
        }

        let column_count = reader.read_lenenc()?;
        let present = reader.read_bytes(bitmap_len(column_count)?)?;
        let present_after = match kind {
            RowsKind::Update => Some(reader.read_bytes(bitmap_len(column_count)?)?),
            _ => None,
        };

        let table = match ctx.tables.resolve(table_id)? {
            Some(table) => table,
            None => {
                debug!("Rows event for unknown table_id {}, skipping rows", table_id);
                return Ok(RowsEventData {
                    table_id,
                    flags,
                    kind,
                    schema: String::new(),
                    table: String::new(),
                    columns: Vec::new(),
                    rows: Vec::new(),
                    table_map: None,
                });
            }
        };

        if table.columns.len() != to_usize(column_count)? {
            return Err(CdcError::ProtocolError(format!(
                "rows event for {}.{} has {} columns, table map has {}",
                table.schema,
                table.table,
                column_count,
                table.columns.len()
            )));
        }

        let rows = RowImageDecoder::new(&table, ctx.options).decode_rows(
            kind,
            &mut reader,
            present,
            present_after,
        )?;

        Ok(RowsEventData {
            table_id,
            flags,
            kind,
            schema: table.schema.clone(),
            table: table.table.clone(),
            columns: table.column_names(),
            rows,
            table_map: Some(table),
        })
    }
}

/// "x.y.z-suffix" 형식의 서버 버전 비교
fn version_at_least(version: &str, minimum: (u32, u32, u32)) -> bool {
    let mut parts = version.split('.').map(|part| {
        part.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .unwrap_or(0)
    });
    let current = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    current >= minimum
}

/// 타입 코드 → 디코더
pub struct EventDecoderRegistry {
    dialect: Dialect,
    decoders: HashMap<u8, EventDecoder>,
}

impl EventDecoderRegistry {
    /// 빈 레지스트리. 모든 이벤트가 `Unknown`으로 디코딩됩니다.
    pub fn empty(dialect: Dialect) -> Self {
        EventDecoderRegistry {
            dialect,
            decoders: HashMap::new(),
        }
    }

    /// 방언의 기본 디코더가 모두 등록된 레지스트리
    pub fn for_dialect(dialect: Dialect) -> Self {
        let mut registry = Self::empty(dialect);

        registry.register(code::FORMAT_DESCRIPTION, |_, body, _| {
            Ok(BinlogEventData::FormatDescription(
                BinlogParser::parse_format_description(body)?,
            ))
        });
        registry.register(code::ROTATE, |_, body, _| {
            Ok(BinlogEventData::Rotate(BinlogParser::parse_rotate_event(body)?))
        });
        registry.register(code::QUERY, |_, body, _| {
            Ok(BinlogEventData::Query(BinlogParser::parse_query_event(body)?))
        });
        registry.register(code::XID, |_, body, _| {
            Ok(BinlogEventData::Xid(BinlogParser::parse_xid_event(body)?))
        });
        registry.register(code::STOP, |_, _, _| Ok(BinlogEventData::Stop));
        registry.register(code::INTVAR, |_, body, _| {
            Ok(BinlogEventData::Intvar(BinlogParser::parse_intvar(body)?))
        });
        registry.register(code::RAND, |_, body, _| {
            Ok(BinlogEventData::Rand(BinlogParser::parse_rand(body)?))
        });
        registry.register(code::BEGIN_LOAD_QUERY, |_, body, _| {
            Ok(BinlogEventData::BeginLoadQuery(
                BinlogParser::parse_begin_load_query(body)?,
            ))
        });
        registry.register(code::EXECUTE_LOAD_QUERY, |_, body, _| {
            Ok(BinlogEventData::ExecuteLoadQuery(
                BinlogParser::parse_execute_load_query(body)?,
            ))
        });
        registry.register(code::TABLE_MAP, |header, body, ctx| {
            let table = TableMap::decode(body, ctx.format.table_id_len(header.type_code))?;
            Ok(BinlogEventData::TableMap(Arc::new(table)))
        });
        for rows_code in [
            code::WRITE_ROWS_V1,
            code::UPDATE_ROWS_V1,
            code::DELETE_ROWS_V1,
            code::WRITE_ROWS_V2,
            code::UPDATE_ROWS_V2,
            code::DELETE_ROWS_V2,
        ] {
            registry.register(rows_code, |header, body, ctx| {
                Ok(BinlogEventData::Rows(BinlogParser::parse_rows_event(
                    header, body, ctx,
                )?))
            });
        }
        for heartbeat_code in [code::HEARTBEAT, code::HEARTBEAT_V2] {
            registry.register(heartbeat_code, |header, body, _| {
                Ok(BinlogEventData::Heartbeat(BinlogParser::parse_heartbeat(
                    header.type_code,
                    body,
                )?))
            });
        }
        registry.register(code::ROWS_QUERY, |_, body, _| {
            Ok(BinlogEventData::RowsQuery(BinlogParser::parse_rows_query(body)?))
        });
        registry.register(code::GTID, |_, body, _| {
            Ok(BinlogEventData::Gtid(BinlogParser::parse_gtid_event(body)?))
        });
        registry.register(code::ANONYMOUS_GTID, |_, body, _| {
            Ok(BinlogEventData::AnonymousGtid(
                BinlogParser::parse_gtid_event(body)?,
            ))
        });
        registry.register(code::PREVIOUS_GTIDS, |_, body, _| {
            Ok(BinlogEventData::PreviousGtids(
                BinlogParser::parse_previous_gtids(body)?,
            ))
        });

        if dialect == Dialect::MariaDb {
            registry.register(code::MARIADB_ANNOTATE_ROWS, |_, body, _| {
                Ok(BinlogEventData::MariadbAnnotateRows(
                    String::from_utf8_lossy(body).into_owned(),
                ))
            });
            registry.register(code::MARIADB_BINLOG_CHECKPOINT, |_, body, _| {
                Ok(BinlogEventData::MariadbBinlogCheckpoint(
                    BinlogParser::parse_mariadb_checkpoint(body)?,
                ))
            });
            registry.register(code::MARIADB_GTID, |header, body, _| {
                Ok(BinlogEventData::MariadbGtid(
                    BinlogParser::parse_mariadb_gtid(header, body)?,
                ))
            });
            registry.register(code::MARIADB_GTID_LIST, |_, body, _| {
                Ok(BinlogEventData::MariadbGtidList(
                    BinlogParser::parse_mariadb_gtid_list(body)?,
                ))
            });
            registry.register(code::MARIADB_START_ENCRYPTION, |_, body, _| {
                Ok(BinlogEventData::MariadbStartEncryption(
                    BinlogParser::parse_mariadb_start_encryption(body)?,
                ))
            });
        }

        registry
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// 디코더 등록. 같은 코드의 기존 디코더는 교체됩니다.
    pub fn register(&mut self, type_code: u8, decoder: EventDecoder) {
        self.decoders.insert(type_code, decoder);
    }

    pub fn has_decoder(&self, type_code: u8) -> bool {
        self.decoders.contains_key(&type_code)
    }

    pub fn decode(
        &self,
        header: &EventHeader,
        body: &[u8],
        ctx: &DecodeContext<'_>,
    ) -> Result<BinlogEventData> {
        match self.decoders.get(&header.type_code) {
            Some(decoder) => decoder(header, body, ctx),
            None => Ok(BinlogEventData::Unknown(body.to_vec())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::table_map::column_type;
    use crate::table_map::tests::TableMapBuilder;

    pub(crate) fn event_bytes(type_code: u8, next_pos: u32, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.push(type_code);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&((EVENT_HEADER_SIZE + body.len()) as u32).to_le_bytes());
        data.extend_from_slice(&next_pos.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(body);
        data
    }

    fn header(type_code: u8, dialect: Dialect) -> EventHeader {
        BinlogParser::parse_header(&event_bytes(type_code, 0, 0, &[]), dialect).unwrap()
    }

    pub(crate) fn format_description_body(server_version: &str, checksum_alg: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = server_version.as_bytes().to_vec();
        version.resize(SERVER_VERSION_LEN, 0);
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(19);
        let mut post_headers = vec![0u8; 40];
        post_headers[(code::TABLE_MAP - 1) as usize] = 8;
        post_headers[(code::WRITE_ROWS_V2 - 1) as usize] = 10;
        body.extend_from_slice(&post_headers);
        body.push(checksum_alg);
        body
    }

    #[test]
    fn test_parse_header() {
        let data = event_bytes(code::XID, 1234, 1_700_000_000, &42u64.to_le_bytes());
        let header = BinlogParser::parse_header(&data, Dialect::MySql).unwrap();
        assert_eq!(header.timestamp, 1_700_000_000);
        assert_eq!(header.event_type, EventType::Xid);
        assert_eq!(header.next_pos, 1234);
        assert_eq!(header.event_length, 27);

        assert!(matches!(
            BinlogParser::parse_header(&data[..10], Dialect::MySql),
            Err(CdcError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_event_body_strips_checksum() {
        let mut data = event_bytes(code::XID, 0, 0, &7u64.to_le_bytes());
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let body = BinlogParser::event_body(&data, true).unwrap();
        assert_eq!(body, &7u64.to_le_bytes());
        assert_eq!(BinlogParser::event_body(&data, false).unwrap().len(), 12);
    }

    #[test]
    fn test_parse_format_description() {
        let fde = BinlogParser::parse_format_description(&format_description_body("8.0.34", 1))
            .unwrap();
        assert_eq!(fde.server_version, "8.0.34");
        assert_eq!(fde.header_length, 19);
        assert!(fde.has_checksum());
        assert_eq!(fde.table_id_len(code::TABLE_MAP), 6);
        assert_eq!(fde.post_header_lengths.len(), 40);

        let old = BinlogParser::parse_format_description(&format_description_body("5.5.62", 0))
            .unwrap();
        assert_eq!(old.checksum_algorithm, None);
        assert_eq!(old.post_header_lengths.len(), 41);
    }

    #[test]
    fn test_version_at_least() {
        assert!(version_at_least("5.6.1", (5, 6, 1)));
        assert!(version_at_least("10.5.8-MariaDB-log", (5, 6, 1)));
        assert!(!version_at_least("5.5.62-log", (5, 6, 1)));
    }

    #[test]
    fn test_parse_rotate_and_query() {
        let mut rotate = 4u64.to_le_bytes().to_vec();
        rotate.extend_from_slice(b"mysql-bin.000002");
        let rotate = BinlogParser::parse_rotate_event(&rotate).unwrap();
        assert_eq!(rotate.next_binlog_name, "mysql-bin.000002");
        assert_eq!(rotate.position, 4);

        let mut query = Vec::new();
        query.extend_from_slice(&11u32.to_le_bytes());
        query.extend_from_slice(&0u32.to_le_bytes());
        query.push(4);
        query.extend_from_slice(&0u16.to_le_bytes());
        query.extend_from_slice(&2u16.to_le_bytes());
        query.extend_from_slice(&[0xaa, 0xbb]);
        query.extend_from_slice(b"test\0BEGIN");
        let query = BinlogParser::parse_query_event(&query).unwrap();
        assert_eq!(query.thread_id, 11);
        assert_eq!(query.schema, "test");
        assert_eq!(query.query, "BEGIN");
        assert!(query.ddl_target.is_none());
    }

    #[test]
    fn test_ddl_target() {
        assert_eq!(
            ddl_target("ALTER TABLE users ADD COLUMN age INT", "shop"),
            Some(DdlTarget {
                schema: "shop".to_string(),
                table: Some("users".to_string()),
            })
        );
        assert_eq!(
            ddl_target("create table if not exists `crm`.`accounts` (id int)", "shop"),
            Some(DdlTarget {
                schema: "crm".to_string(),
                table: Some("accounts".to_string()),
            })
        );
        assert_eq!(
            ddl_target("DROP DATABASE IF EXISTS `archive`", ""),
            Some(DdlTarget {
                schema: "archive".to_string(),
                table: None,
            })
        );
        assert!(ddl_target("INSERT INTO users VALUES (1)", "shop").is_none());
        assert!(ddl_target("CREATE INDEX idx ON users (name)", "shop").is_none());
    }

    #[test]
    fn test_parse_gtid_event() {
        let sid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let mut body = vec![1];
        body.extend_from_slice(sid.as_bytes());
        body.extend_from_slice(&23u64.to_le_bytes());
        body.push(LOGICAL_TIMESTAMP_TYPE);
        body.extend_from_slice(&5u64.to_le_bytes());
        body.extend_from_slice(&6u64.to_le_bytes());

        let gtid = BinlogParser::parse_gtid_event(&body).unwrap();
        assert_eq!(gtid.sid, sid);
        assert_eq!(gtid.gno, 23);
        assert!(gtid.committed);
        assert_eq!(gtid.last_committed, Some(5));
        assert_eq!(gtid.sequence_number, Some(6));
        assert_eq!(
            gtid.gtid().unwrap().to_string(),
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:23"
        );
    }

    #[test]
    fn test_parse_mariadb_events() {
        let mut header = header(code::MARIADB_GTID, Dialect::MariaDb);
        header.server_id = 2;
        let mut body = 100u64.to_le_bytes().to_vec();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(MARIADB_FL_GROUP_COMMIT_ID);
        body.extend_from_slice(&9u64.to_le_bytes());
        let gtid = BinlogParser::parse_mariadb_gtid(&header, &body).unwrap();
        assert_eq!(gtid.gtid.to_string(), "0-2-100");
        assert_eq!(gtid.commit_id, Some(9));

        let mut list = (2u32 | 0x1000_0000).to_le_bytes().to_vec();
        for (domain, server, seq) in [(0u32, 1u32, 10u64), (1, 1, 20)] {
            list.extend_from_slice(&domain.to_le_bytes());
            list.extend_from_slice(&server.to_le_bytes());
            list.extend_from_slice(&seq.to_le_bytes());
        }
        let list = BinlogParser::parse_mariadb_gtid_list(&list).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "1-1-20");

        let oversized = 0x0fff_ffffu32.to_le_bytes();
        assert!(matches!(
            BinlogParser::parse_mariadb_gtid_list(&oversized),
            Err(CdcError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_registry_unknown_and_dialect() {
        let format = FormatDescriptionData::default();
        let tables = TableMetadataCache::new(false);
        let ctx = DecodeContext {
            format: &format,
            tables: &tables,
            options: DecodeOptions::default(),
        };

        let mysql = EventDecoderRegistry::for_dialect(Dialect::MySql);
        let header = header(code::MARIADB_GTID, Dialect::MySql);
        assert_eq!(header.event_type, EventType::Unknown);
        assert!(matches!(
            mysql.decode(&header, &[1, 2, 3], &ctx).unwrap(),
            BinlogEventData::Unknown(bytes) if bytes == vec![1, 2, 3]
        ));

        let mariadb = EventDecoderRegistry::for_dialect(Dialect::MariaDb);
        assert!(mariadb.has_decoder(code::MARIADB_GTID_LIST));
        assert!(!mysql.has_decoder(code::MARIADB_GTID_LIST));
    }

    fn write_rows_v2(table_id: u64, column_count: u8, image: &[u8]) -> Vec<u8> {
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&0u16.to_le_bytes());
        // extra data: 길이 필드만
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(column_count);
        body.push(0xff);
        body.extend_from_slice(image);
        body
    }

    #[tokio::test]
    async fn test_parse_rows_event_v2() {
        let table = TableMapBuilder::new(5, "test", "t")
            .column(column_type::LONG, &[], false)
            .names(&["id"])
            .build();
        let mut tables = TableMetadataCache::new(false);
        tables.install(TableMap::decode(&table, 6).unwrap(), None).await;

        let format = FormatDescriptionData::default();
        let ctx = DecodeContext {
            format: &format,
            tables: &tables,
            options: DecodeOptions::default(),
        };
        let header = header(code::WRITE_ROWS_V2, Dialect::MySql);

        let mut image = vec![0x00];
        image.extend_from_slice(&77u32.to_le_bytes());
        let rows = BinlogParser::parse_rows_event(&header, &write_rows_v2(5, 1, &image), &ctx)
            .unwrap();
        assert_eq!(rows.kind, RowsKind::Write);
        assert_eq!(rows.table, "t");
        assert_eq!(rows.columns, vec!["id"]);
        assert_eq!(rows.rows.len(), 1);

        // 컬럼 수 불일치
        assert!(matches!(
            BinlogParser::parse_rows_event(&header, &write_rows_v2(5, 2, &image), &ctx),
            Err(CdcError::ProtocolError(_))
        ));

        // 알 수 없는 table id
        let unknown = BinlogParser::parse_rows_event(&header, &write_rows_v2(6, 1, &image), &ctx)
            .unwrap();
        assert!(unknown.rows.is_empty());
        assert!(unknown.table_map.is_none());

        // present 비트맵이 비었는데 데이터가 남은 경우
        let mut empty_present = write_rows_v2(5, 1, &[0x2a]);
        empty_present[11] = 0x00;
        assert!(matches!(
            BinlogParser::parse_rows_event(&header, &empty_present, &ctx),
            Err(CdcError::ProtocolError(_))
        ));
    }
}
