//! 스트림 전체에서 사용하는 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 시작 값이 끝 값보다 큰 GTID 구간
    #[error("잘못된 GTID 구간: [{start}, {stop})")]
    MalformedInterval { start: u64, stop: u64 },

    /// 기존 구간과 겹치는 GTID 구간 추가
    #[error("기존 구간과 겹치는 GTID 구간: [{start}, {stop})")]
    OverlappingInterval { start: u64, stop: u64 },

    #[error("SID가 다른 GTID는 합칠 수 없습니다: {left} != {right}")]
    SidMismatch { left: String, right: String },

    #[error("GTID 파싱 에러: {0}")]
    ParseError(String),

    /// strict 모드에서 테이블 컬럼 정보를 얻지 못한 경우
    #[error("테이블 메타데이터를 사용할 수 없습니다: {schema}.{table}")]
    TableMetadataUnavailable { schema: String, table: String },

    #[error("컬럼 `{column}` 문자열 디코딩 에러: {message}")]
    DecodingError { column: String, message: String },

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("서버 에러 {code}: {message}")]
    ServerError { code: u16, message: String },

    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("설정 에러: {0}")]
    ConfigError(String),
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl CdcError {
    pub(crate) fn truncated(what: &str, needed: usize, remaining: usize) -> Self {
        CdcError::ProtocolError(format!(
            "truncated {}: need {} bytes, {} remaining",
            what, needed, remaining
        ))
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
