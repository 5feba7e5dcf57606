//! MySQL / MariaDB binlog 복제 클라이언트
//!
//! 복제본으로 서버에 접속해 바이너리 로그를 스트리밍하고 이벤트를 디코딩합니다.
//! 주요 기능:
//! - Binlog 프로토콜 파싱
//! - GTID (Global Transaction ID) 집합 연산
//! - 테이블 메타데이터 캐시와 행 이미지 디코딩
//! - 재시작 가능한 위치 추적

pub mod auth;
pub mod binlog;
pub mod binlog_stream;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod json_binary;
pub mod offset;
pub mod protocol;
pub mod row_decoder;
pub mod table_map;

pub use binlog::{BinlogParser, EventDecoderRegistry};
pub use binlog_stream::{BinlogStream, StreamState};
pub use config::{StartPosition, StreamConfig};
pub use connection::{CatalogConnection, ConnectionConfig, MySqlConnection, ReplicationConnection};
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, BinlogEventData, CellValue, DecodedRow, Dialect, EventType};
pub use gtid::{Gtid, GtidInterval, GtidSet};
pub use offset::{BinlogPosition, StreamPosition};
pub use row_decoder::{DecodeOptions, RowImageDecoder};
pub use table_map::{TableMap, TableMetadataCache};
