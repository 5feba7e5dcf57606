//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//!
//! GTID 모드에서는 지금까지 처리한 트랜잭션 집합이 재시작 지점이 됩니다.

use crate::config::StartPosition;
use crate::error::Result;
use crate::events::MariadbGtid;
use crate::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 스트림의 재시작 가능한 위치
///
/// 이벤트 하나를 완전히 처리한 뒤에만 갱신됩니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub log_file: Option<String>,
    pub log_pos: Option<u64>,
    /// GTID 모드로 시작했을 때 처리한 트랜잭션 집합
    pub gtid_set: Option<GtidSet>,
    /// MariaDB 도메인별 마지막 GTID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mariadb_gtids: BTreeMap<u32, MariadbGtid>,
}

impl StreamPosition {
    pub fn binlog_position(&self) -> Option<BinlogPosition> {
        match (&self.log_file, self.log_pos) {
            (Some(file), Some(pos)) => Some(BinlogPosition::new(file.clone(), pos)),
            _ => None,
        }
    }

    /// `domain-server-seq` 목록 (도메인 순)
    pub fn mariadb_gtid_text(&self) -> Option<String> {
        if self.mariadb_gtids.is_empty() {
            return None;
        }
        Some(
            self.mariadb_gtids
                .values()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// 이 위치에서 새 스트림을 열기 위한 시작 위치
    ///
    /// GTID 집합이 있으면 파일 위치보다 우선합니다.
    pub fn resume_point(&self) -> StartPosition {
        if let Some(gtid_set) = &self.gtid_set {
            return StartPosition::Gtid(gtid_set.clone());
        }
        if let Some(text) = self.mariadb_gtid_text() {
            return StartPosition::MariadbGtid(text);
        }
        match self.binlog_position() {
            Some(position) => StartPosition::File {
                log_file: position.filename,
                log_pos: position.position,
            },
            None => StartPosition::Current,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binlog_position() {
            Some(position) => write!(f, "{}", position)?,
            None => f.write_str("-")?,
        }
        if let Some(gtid_set) = &self.gtid_set {
            write!(f, " gtid={}", gtid_set)?;
        }
        if let Some(text) = self.mariadb_gtid_text() {
            write!(f, " mariadb_gtid={}", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_display() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_resume_point_prefers_gtid() {
        let mut position = StreamPosition {
            log_file: Some("mysql-bin.000002".to_string()),
            log_pos: Some(154),
            ..Default::default()
        };
        assert_eq!(
            position.resume_point(),
            StartPosition::File {
                log_file: "mysql-bin.000002".to_string(),
                log_pos: 154
            }
        );

        let set = GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-9").unwrap();
        position.gtid_set = Some(set.clone());
        assert_eq!(position.resume_point(), StartPosition::Gtid(set));
        assert_eq!(StreamPosition::default().resume_point(), StartPosition::Current);
    }

    #[test]
    fn test_mariadb_resume_point() {
        let mut position = StreamPosition::default();
        for (domain, seq) in [(1, 20), (0, 10)] {
            position.mariadb_gtids.insert(
                domain,
                MariadbGtid {
                    domain_id: domain,
                    server_id: 1,
                    sequence: seq,
                },
            );
        }
        assert_eq!(
            position.resume_point(),
            StartPosition::MariadbGtid("0-1-10,1-1-20".to_string())
        );
    }

    #[test]
    fn test_position_json() {
        let position = StreamPosition {
            log_file: Some("mysql-bin.000001".to_string()),
            log_pos: Some(4),
            gtid_set: Some(GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-3").unwrap()),
            ..Default::default()
        };
        let json = position.to_json().unwrap();
        assert_eq!(json["log_file"], "mysql-bin.000001");
        assert_eq!(json["gtid_set"], "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-3");
        assert_eq!(StreamPosition::from_json(json).unwrap(), position);
    }
}
