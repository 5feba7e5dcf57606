//! MySQL 연결 관리
//!
//! 스트림은 두 종류의 연결에 의존합니다.
//! - [`ReplicationConnection`]: 명령 전송과 패킷 읽기 (binlog 덤프가 흐르는 메인 연결)
//! - [`CatalogConnection`]: 테이블 컬럼 정보 조회 (메타데이터 보강용 제어 연결)

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// MySQL 연결 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            connect_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// binlog 덤프가 흐르는 메인 연결
#[async_trait]
pub trait ReplicationConnection: Send {
    /// 새 명령 전송 (패킷 시퀀스는 0부터 다시 시작)
    async fn send_command(&mut self, command: &[u8]) -> Result<()>;

    /// 다음 패킷. 연결이 정상적으로 닫혔으면 `None`
    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 테이블 컬럼 정보를 조회하는 카탈로그 연결
#[async_trait]
pub trait CatalogConnection: Send {
    /// 서수 순서대로 정렬된 컬럼 목록. 테이블이 없으면 빈 목록입니다.
    async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// information_schema.columns 한 행
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub collation_name: Option<String>,
    pub character_set_name: Option<String>,
    pub comment: String,
    /// 예: "int(10) unsigned", "enum('a','b')"
    pub column_type: String,
    /// "PRI", "UNI", "MUL" 또는 빈 문자열
    pub column_key: String,
}

impl ColumnInfo {
    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    pub fn is_primary_key(&self) -> bool {
        self.column_key == "PRI"
    }

    /// `enum(...)`/`set(...)` 타입 문자열의 레이블 목록
    pub fn labels(&self) -> Option<Vec<String>> {
        let lower = self.column_type.to_ascii_lowercase();
        if !(lower.starts_with("enum(") || lower.starts_with("set(")) {
            return None;
        }

        static LABEL: OnceLock<Regex> = OnceLock::new();
        let pattern =
            LABEL.get_or_init(|| Regex::new(r"'((?:[^']|'')*)'").expect("static label pattern"));

        Some(
            pattern
                .captures_iter(&self.column_type)
                .map(|c| c[1].replace("''", "'"))
                .collect(),
        )
    }
}

/// mysql_async 기반 카탈로그 연결
///
/// 풀은 첫 쿼리 시점에 연결을 엽니다.
pub struct MySqlConnection {
    pool: Pool,
}

impl MySqlConnection {
    pub fn new(config: &ConnectionConfig) -> Self {
        MySqlConnection {
            pool: Pool::new(config.build_opts()),
        }
    }
}

#[async_trait]
impl CatalogConnection for MySqlConnection {
    async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        let rows: Vec<(String, Option<String>, Option<String>, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLLATION_NAME, CHARACTER_SET_NAME, \
                        COLUMN_COMMENT, COLUMN_TYPE, COLUMN_KEY \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        debug!("Catalog returned {} columns for {}.{}", rows.len(), schema, table);

        Ok(rows
            .into_iter()
            .map(
                |(name, collation_name, character_set_name, comment, column_type, column_key)| {
                    ColumnInfo {
                        name,
                        collation_name,
                        character_set_name,
                        comment,
                        column_type,
                        column_key,
                    }
                },
            )
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to close pool: {}", e)))
    }
}
