//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::gtid::{Gtid, GtidSet};
use crate::table_map::TableMap;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// 이벤트 타입 코드
pub mod code {
    pub const QUERY: u8 = 2;
    pub const STOP: u8 = 3;
    pub const ROTATE: u8 = 4;
    pub const INTVAR: u8 = 5;
    pub const RAND: u8 = 13;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const BEGIN_LOAD_QUERY: u8 = 17;
    pub const EXECUTE_LOAD_QUERY: u8 = 18;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const HEARTBEAT: u8 = 27;
    pub const ROWS_QUERY: u8 = 29;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const GTID: u8 = 33;
    pub const ANONYMOUS_GTID: u8 = 34;
    pub const PREVIOUS_GTIDS: u8 = 35;
    pub const HEARTBEAT_V2: u8 = 41;

    pub const MARIADB_ANNOTATE_ROWS: u8 = 160;
    pub const MARIADB_BINLOG_CHECKPOINT: u8 = 161;
    pub const MARIADB_GTID: u8 = 162;
    pub const MARIADB_GTID_LIST: u8 = 163;
    pub const MARIADB_START_ENCRYPTION: u8 = 164;
}

/// 프로토콜 방언. MariaDB는 160번 이후의 확장 이벤트를 가집니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    MySql,
    MariaDb,
}

/// MySQL Binlog 이벤트 타입
///
/// 두 가지 on-wire 버전이 있는 행 이벤트는 하나의 타입으로 묶입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// 디코더가 없는 이벤트
    Unknown,
    Query,
    Stop,
    /// 로테이션 이벤트 (새 binlog 파일)
    Rotate,
    Intvar,
    Rand,
    FormatDescription,
    /// 트랜잭션 커밋 표시
    Xid,
    BeginLoadQuery,
    ExecuteLoadQuery,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMap,
    /// INSERT
    WriteRows,
    /// UPDATE
    UpdateRows,
    /// DELETE
    DeleteRows,
    Heartbeat,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQuery,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    MariadbAnnotateRows,
    MariadbBinlogCheckpoint,
    MariadbGtid,
    MariadbGtidList,
    MariadbStartEncryption,
}

impl EventType {
    pub fn from_code(type_code: u8, dialect: Dialect) -> Self {
        match type_code {
            code::QUERY => EventType::Query,
            code::STOP => EventType::Stop,
            code::ROTATE => EventType::Rotate,
            code::INTVAR => EventType::Intvar,
            code::RAND => EventType::Rand,
            code::FORMAT_DESCRIPTION => EventType::FormatDescription,
            code::XID => EventType::Xid,
            code::BEGIN_LOAD_QUERY => EventType::BeginLoadQuery,
            code::EXECUTE_LOAD_QUERY => EventType::ExecuteLoadQuery,
            code::TABLE_MAP => EventType::TableMap,
            code::WRITE_ROWS_V1 | code::WRITE_ROWS_V2 => EventType::WriteRows,
            code::UPDATE_ROWS_V1 | code::UPDATE_ROWS_V2 => EventType::UpdateRows,
            code::DELETE_ROWS_V1 | code::DELETE_ROWS_V2 => EventType::DeleteRows,
            code::HEARTBEAT | code::HEARTBEAT_V2 => EventType::Heartbeat,
            code::ROWS_QUERY => EventType::RowsQuery,
            code::GTID => EventType::Gtid,
            code::ANONYMOUS_GTID => EventType::AnonymousGtid,
            code::PREVIOUS_GTIDS => EventType::PreviousGtids,
            other if dialect == Dialect::MariaDb => match other {
                code::MARIADB_ANNOTATE_ROWS => EventType::MariadbAnnotateRows,
                code::MARIADB_BINLOG_CHECKPOINT => EventType::MariadbBinlogCheckpoint,
                code::MARIADB_GTID => EventType::MariadbGtid,
                code::MARIADB_GTID_LIST => EventType::MariadbGtidList,
                code::MARIADB_START_ENCRYPTION => EventType::MariadbStartEncryption,
                _ => EventType::Unknown,
            },
            _ => EventType::Unknown,
        }
    }

    pub fn is_rows(&self) -> bool {
        matches!(
            self,
            EventType::WriteRows | EventType::UpdateRows | EventType::DeleteRows
        )
    }
}

/// Binlog 이벤트 헤더 (19 바이트)
#[derive(Debug, Clone, Serialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// on-wire 타입 코드
    pub type_code: u8,
    pub event_type: EventType,
    /// 이벤트를 기록한 서버 ID
    pub server_id: u32,
    /// 헤더와 체크섬을 포함한 이벤트 길이
    pub event_length: u32,
    /// 다음 이벤트 위치. 0이면 위치 정보 없음
    pub next_pos: u32,
    pub flags: u16,
}

/// FORMAT_DESCRIPTION 이벤트
#[derive(Debug, Clone, Serialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    /// 타입 코드 1부터 시작하는 post-header 길이
    pub post_header_lengths: Vec<u8>,
    /// 0 = 없음, 1 = CRC32. 5.6.1 미만 서버는 `None`
    pub checksum_algorithm: Option<u8>,
}

impl FormatDescriptionData {
    pub const CHECKSUM_CRC32: u8 = 1;

    pub fn post_header_len(&self, type_code: u8) -> Option<u8> {
        let index = (type_code as usize).checked_sub(1)?;
        self.post_header_lengths.get(index).copied()
    }

    /// 행/테이블 맵 이벤트의 table id 길이 (post-header가 6이면 구형 4바이트)
    pub fn table_id_len(&self, type_code: u8) -> usize {
        match self.post_header_len(type_code) {
            Some(6) => 4,
            _ => 6,
        }
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum_algorithm == Some(Self::CHECKSUM_CRC32)
    }
}

impl Default for FormatDescriptionData {
    /// 첫 FORMAT_DESCRIPTION 이벤트 전에 사용하는 v4 기본값
    fn default() -> Self {
        FormatDescriptionData {
            binlog_version: 4,
            server_version: String::new(),
            create_timestamp: 0,
            header_length: 19,
            post_header_lengths: Vec::new(),
            checksum_algorithm: None,
        }
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
    /// DDL 문장이 변경하는 대상. DDL이 아니면 `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddl_target: Option<DdlTarget>,
}

/// `CREATE/ALTER/DROP ... DATABASE|SCHEMA|TABLE` 의 대상
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlTarget {
    pub schema: String,
    /// 데이터베이스 단위 DDL이면 `None`
    pub table: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XidEventData {
    pub xid: u64,
}

/// GTID 이벤트 데이터 (익명 GTID 포함)
#[derive(Debug, Clone, Serialize)]
pub struct GtidEventData {
    pub sid: Uuid,
    pub gno: u64,
    pub committed: bool,
    pub last_committed: Option<i64>,
    pub sequence_number: Option<i64>,
}

impl GtidEventData {
    /// `sid:gno` 트랜잭션 하나
    pub fn gtid(&self) -> crate::Result<Gtid> {
        Gtid::single(self.sid, self.gno)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatData {
    /// 현재 binlog 파일명
    pub log_ident: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntvarData {
    /// 1 = LAST_INSERT_ID, 2 = INSERT_ID
    pub kind: u8,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RandData {
    pub seed1: u64,
    pub seed2: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeginLoadQueryData {
    pub file_id: u32,
    pub block_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteLoadQueryData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
    pub file_id: u32,
    pub start_pos: u32,
    pub end_pos: u32,
    pub dup_handling: u8,
}

/// MariaDB GTID `domain-server-sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MariadbGtidEventData {
    pub gtid: MariadbGtid,
    pub flags: u8,
    pub commit_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MariadbStartEncryptionData {
    pub schema: u8,
    pub key_version: u32,
    pub nonce: Vec<u8>,
}

/// 행 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// MySQL TIME 값. 범위가 ±838시간이라 시각 타입으로 표현하지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MysqlTime {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

impl fmt::Display for MysqlTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.microseconds > 0 {
            write!(f, ".{:06}", self.microseconds)?;
        }
        Ok(())
    }
}

/// 셀 값 (컬럼 타입별 디코딩 결과)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// 정밀도를 잃지 않도록 문자열로 보관
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(MysqlTime),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
    Year(u16),
    Enum(String),
    Set(Vec<String>),
    Bit(u64),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::UInt(u) => Some(u.to_string()),
            CellValue::Float(v) => Some(v.to_string()),
            CellValue::Double(v) => Some(v.to_string()),
            CellValue::Decimal(s) | CellValue::String(s) | CellValue::Enum(s) => Some(s.clone()),
            CellValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            CellValue::Date(d) => Some(d.to_string()),
            CellValue::Time(t) => Some(t.to_string()),
            CellValue::DateTime(dt) => Some(dt.to_string()),
            CellValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            CellValue::Year(y) => Some(y.to_string()),
            CellValue::Set(items) => Some(items.join(",")),
            CellValue::Bit(b) => Some(format!("{:b}", b)),
            CellValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// 컬럼 이름 → 값
pub type RowValues = HashMap<String, CellValue>;

/// 디코딩된 행. 부분 이미지에서 빠진 컬럼은 `Null`입니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedRow {
    /// INSERT / DELETE
    Row { values: RowValues },
    /// UPDATE
    Update {
        before_values: RowValues,
        after_values: RowValues,
    },
}

/// 행 변경 이벤트 데이터
#[derive(Debug, Clone, Serialize)]
pub struct RowsEventData {
    pub table_id: u64,
    pub flags: u16,
    pub kind: RowsKind,
    pub schema: String,
    pub table: String,
    /// 서수 순서의 컬럼 이름 (이름이 없으면 위치 기반 이름)
    pub columns: Vec<String>,
    pub rows: Vec<DecodedRow>,
    /// 행 디코딩에 사용한 테이블 정의. 핸들을 알 수 없으면 `None`
    #[serde(skip)]
    pub table_map: Option<Arc<TableMap>>,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize)]
pub enum BinlogEventData {
    FormatDescription(FormatDescriptionData),
    Rotate(RotateEventData),
    Query(QueryEventData),
    Xid(XidEventData),
    TableMap(Arc<TableMap>),
    Rows(RowsEventData),
    Gtid(GtidEventData),
    AnonymousGtid(GtidEventData),
    PreviousGtids(GtidSet),
    Heartbeat(HeartbeatData),
    RowsQuery(String),
    Stop,
    Intvar(IntvarData),
    Rand(RandData),
    BeginLoadQuery(BeginLoadQueryData),
    ExecuteLoadQuery(ExecuteLoadQueryData),
    MariadbAnnotateRows(String),
    MariadbBinlogCheckpoint(String),
    MariadbGtid(MariadbGtidEventData),
    MariadbGtidList(Vec<MariadbGtid>),
    MariadbStartEncryption(MariadbStartEncryptionData),
    Unknown(Vec<u8>),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: BinlogEventData,
}

impl BinlogEvent {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    pub fn to_json(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
