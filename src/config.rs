//! 스트림 설정
//!
//! serde로 역직렬화하거나 `BINLOG_*` 환경 변수로 만들 수 있습니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::{Dialect, EventType};
use crate::gtid::GtidSet;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

/// 복제 시작 위치
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// 서버의 현재 binlog 끝
    #[default]
    Current,
    File { log_file: String, log_pos: u64 },
    /// 주어진 집합에 없는 트랜잭션부터 (auto-positioning)
    Gtid(GtidSet),
    /// MariaDB `domain-server-seq[,...]`
    MariadbGtid(String),
}

/// COM_REGISTER_SLAVE로 서버에 알리는 복제본 정보
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicaReport {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub connection: ConnectionConfig,
    /// 카탈로그 조회용 별도 연결. 없으면 `connection` 설정으로 엽니다.
    pub control_connection: Option<ConnectionConfig>,
    /// 서버에 알리는 복제본 ID. 다른 복제본과 겹치면 안 됩니다.
    pub server_id: u32,
    /// false면 새 이벤트가 없을 때 스트림이 끝납니다.
    pub blocking: bool,
    pub start: StartPosition,
    /// 이 위치에 도달한 이벤트까지만 반환
    pub end_log_pos: Option<u64>,

    /// 지정하면 `ignored_events`는 무시됩니다.
    pub only_events: Option<Vec<EventType>>,
    pub ignored_events: Vec<EventType>,
    pub filter_unknown_events: bool,
    pub only_tables: Option<Vec<String>>,
    pub ignored_tables: Vec<String>,
    pub only_schemas: Option<Vec<String>>,
    pub ignored_schemas: Vec<String>,
    /// 이 시각(유닉스 초) 이전 이벤트는 반환하지 않음
    pub skip_to_timestamp: Option<u32>,

    pub strict_table_metadata: bool,
    pub ignore_decode_errors: bool,
    pub dialect: Dialect,

    pub heartbeat_period_secs: Option<f64>,
    pub replica_uuid: Option<Uuid>,
    pub report: Option<ReplicaReport>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            connection: ConnectionConfig::default(),
            control_connection: None,
            server_id: 255,
            blocking: false,
            start: StartPosition::Current,
            end_log_pos: None,
            only_events: None,
            ignored_events: Vec::new(),
            filter_unknown_events: true,
            only_tables: None,
            ignored_tables: Vec::new(),
            only_schemas: None,
            ignored_schemas: Vec::new(),
            skip_to_timestamp: None,
            strict_table_metadata: false,
            ignore_decode_errors: false,
            dialect: Dialect::MySql,
            heartbeat_period_secs: None,
            replica_uuid: None,
            report: None,
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CdcError::ConfigError(format!("invalid value for {}: {}", name, value))),
        None => Ok(None),
    }
}

fn parse_flag(name: &str) -> Result<Option<bool>> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(v) => Err(CdcError::ConfigError(format!(
            "invalid flag for {}: {}",
            name, v
        ))),
        None => Ok(None),
    }
}

fn parse_list(name: &str) -> Option<Vec<String>> {
    var(name).map(|v| {
        v.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

/// `WriteRows,Xid` 같은 이벤트 타입 목록
fn parse_event_list(name: &str) -> Result<Option<Vec<EventType>>> {
    parse_list(name)
        .map(|items| {
            items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(serde_json::Value::String(item.clone())).map_err(|_| {
                        CdcError::ConfigError(format!("unknown event type in {}: {}", name, item))
                    })
                })
                .collect()
        })
        .transpose()
}

impl StreamConfig {
    /// `BINLOG_*` 환경 변수로 설정 생성
    pub fn from_env() -> Result<Self> {
        let mut config = StreamConfig::default();

        let connection = &mut config.connection;
        if let Some(host) = var("BINLOG_HOST") {
            connection.hostname = host;
        }
        if let Some(port) = parse_var("BINLOG_PORT")? {
            connection.port = port;
        }
        if let Some(user) = var("BINLOG_USER") {
            connection.username = user;
        }
        if let Some(password) = var("BINLOG_PASSWORD") {
            connection.password = password;
        }
        if let Some(timeout) = parse_var("BINLOG_CONNECT_TIMEOUT")? {
            connection.connect_timeout_secs = timeout;
        }

        if let Some(host) = var("BINLOG_CONTROL_HOST") {
            config.control_connection = Some(ConnectionConfig {
                hostname: host,
                ..config.connection.clone()
            });
        }

        if let Some(server_id) = parse_var("BINLOG_SERVER_ID")? {
            config.server_id = server_id;
        }
        if let Some(blocking) = parse_flag("BINLOG_BLOCKING")? {
            config.blocking = blocking;
        }

        config.start = match (
            var("BINLOG_GTID_SET"),
            var("BINLOG_MARIADB_GTID"),
            var("BINLOG_FILE"),
        ) {
            (Some(gtid_set), _, _) => StartPosition::Gtid(GtidSet::parse(&gtid_set)?),
            (None, Some(mariadb), _) => StartPosition::MariadbGtid(mariadb),
            (None, None, Some(log_file)) => StartPosition::File {
                log_file,
                log_pos: parse_var("BINLOG_POS")?.unwrap_or(4),
            },
            (None, None, None) => StartPosition::Current,
        };
        config.end_log_pos = parse_var("BINLOG_END_POS")?;

        config.only_events = parse_event_list("BINLOG_ONLY_EVENTS")?;
        config.ignored_events = parse_event_list("BINLOG_IGNORED_EVENTS")?.unwrap_or_default();
        if let Some(filter) = parse_flag("BINLOG_FILTER_UNKNOWN_EVENTS")? {
            config.filter_unknown_events = filter;
        }
        config.only_tables = parse_list("BINLOG_ONLY_TABLES");
        config.ignored_tables = parse_list("BINLOG_IGNORED_TABLES").unwrap_or_default();
        config.only_schemas = parse_list("BINLOG_ONLY_SCHEMAS");
        config.ignored_schemas = parse_list("BINLOG_IGNORED_SCHEMAS").unwrap_or_default();
        config.skip_to_timestamp = parse_var("BINLOG_SKIP_TO_TIMESTAMP")?;

        config.strict_table_metadata = parse_flag("BINLOG_STRICT_METADATA")?.unwrap_or(false);
        config.ignore_decode_errors = parse_flag("BINLOG_IGNORE_DECODE_ERRORS")?.unwrap_or(false);
        config.dialect = match var("BINLOG_DIALECT").map(|d| d.to_ascii_lowercase()) {
            Some(d) if d == "mariadb" => Dialect::MariaDb,
            Some(d) if d == "mysql" => Dialect::MySql,
            Some(other) => {
                return Err(CdcError::ConfigError(format!("unknown dialect: {}", other)))
            }
            None => Dialect::MySql,
        };

        config.heartbeat_period_secs = parse_var("BINLOG_HEARTBEAT_SECS")?;
        config.replica_uuid = parse_var("BINLOG_REPLICA_UUID")?;

        config.validate()?;
        Ok(config)
    }

    /// 서로 맞지 않는 옵션 조합 검사
    pub fn validate(&self) -> Result<()> {
        if let StartPosition::MariadbGtid(_) = self.start {
            if self.dialect != Dialect::MariaDb {
                return Err(CdcError::ConfigError(
                    "MariaDB GTID start position requires the mariadb dialect".to_string(),
                ));
            }
        }
        if let StartPosition::Gtid(_) = self.start {
            if self.dialect == Dialect::MariaDb {
                return Err(CdcError::ConfigError(
                    "MySQL GTID set start position is not supported by MariaDB".to_string(),
                ));
            }
        }
        if let Some(period) = self.heartbeat_period_secs {
            if !(period > 0.0 && period <= 4_294_967.0) {
                return Err(CdcError::ConfigError(format!(
                    "heartbeat period out of range: {}",
                    period
                )));
            }
        }
        if self.server_id == 0 {
            return Err(CdcError::ConfigError(
                "server_id must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// 이벤트 타입이 반환 대상인지
    pub fn allows_event(&self, event_type: EventType) -> bool {
        if event_type == EventType::Unknown && self.filter_unknown_events {
            return false;
        }
        match &self.only_events {
            Some(only) => only.contains(&event_type),
            // 하트비트는 명시적으로 요청한 경우에만
            None => event_type != EventType::Heartbeat && !self.ignored_events.contains(&event_type),
        }
    }

    /// 스키마/테이블이 반환 대상인지
    pub fn allows_table(&self, schema: &str, table: &str) -> bool {
        let qualified = format!("{}.{}", schema, table);
        let matches = |list: &[String]| list.iter().any(|t| t == table || *t == qualified);

        if let Some(only) = &self.only_tables {
            if !matches(only) {
                return false;
            }
        }
        if matches(&self.ignored_tables) {
            return false;
        }
        if let Some(only) = &self.only_schemas {
            if !only.iter().any(|s| s == schema) {
                return false;
            }
        }
        !self.ignored_schemas.iter().any(|s| s == schema)
    }

    pub(crate) fn has_table_filter(&self) -> bool {
        self.only_tables.is_some()
            || !self.ignored_tables.is_empty()
            || self.only_schemas.is_some()
            || !self.ignored_schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert!(!config.blocking);
        assert!(config.filter_unknown_events);
        assert_eq!(config.start, StartPosition::Current);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize() {
        let config: StreamConfig = serde_json::from_str(
            r#"{
                "connection": {"hostname": "db1", "port": 3307},
                "server_id": 42,
                "blocking": true,
                "start": {"gtid": "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"},
                "only_events": ["WriteRows", "UpdateRows"],
                "only_tables": ["shop.orders"],
                "dialect": "mysql"
            }"#,
        )
        .unwrap();
        assert_eq!(config.connection.hostname, "db1");
        assert_eq!(config.connection.port, 3307);
        assert_eq!(config.server_id, 42);
        assert!(matches!(config.start, StartPosition::Gtid(ref set) if set.len() == 1));
        assert_eq!(
            config.only_events,
            Some(vec![EventType::WriteRows, EventType::UpdateRows])
        );

        let file: StreamConfig = serde_json::from_str(
            r#"{"start": {"file": {"log_file": "mysql-bin.000003", "log_pos": 120}}}"#,
        )
        .unwrap();
        assert_eq!(
            file.start,
            StartPosition::File {
                log_file: "mysql-bin.000003".to_string(),
                log_pos: 120
            }
        );
    }

    #[test]
    fn test_validate_dialect_mismatch() {
        let config = StreamConfig {
            start: StartPosition::MariadbGtid("0-1-100".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CdcError::ConfigError(_))));

        let config = StreamConfig {
            heartbeat_period_secs: Some(-1.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_event_filter() {
        let mut config = StreamConfig::default();
        assert!(config.allows_event(EventType::Query));
        assert!(!config.allows_event(EventType::Heartbeat));
        assert!(!config.allows_event(EventType::Unknown));

        config.ignored_events = vec![EventType::Query];
        assert!(!config.allows_event(EventType::Query));

        // allow-list가 있으면 deny-list는 무시
        config.only_events = Some(vec![EventType::Query, EventType::Heartbeat]);
        assert!(config.allows_event(EventType::Query));
        assert!(config.allows_event(EventType::Heartbeat));
        assert!(!config.allows_event(EventType::Xid));

        config.filter_unknown_events = false;
        config.only_events = None;
        assert!(config.allows_event(EventType::Unknown));
    }

    #[test]
    fn test_table_filter() {
        let mut config = StreamConfig {
            only_tables: Some(vec!["orders".to_string(), "shop.items".to_string()]),
            ..Default::default()
        };
        assert!(config.allows_table("shop", "orders"));
        assert!(config.allows_table("shop", "items"));
        assert!(!config.allows_table("other", "items"));
        assert!(!config.allows_table("shop", "users"));

        config.ignored_tables = vec!["shop.orders".to_string()];
        assert!(!config.allows_table("shop", "orders"));
        assert!(config.allows_table("archive", "orders"));

        config.ignored_schemas = vec!["archive".to_string()];
        assert!(!config.allows_table("archive", "orders"));
        assert!(config.has_table_filter());
    }

    #[test]
    fn test_parse_event_list_names() {
        let value: EventType =
            serde_json::from_value(serde_json::Value::String("TableMap".to_string())).unwrap();
        assert_eq!(value, EventType::TableMap);
    }
}
