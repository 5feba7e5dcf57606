//! 테이블 맵 이벤트와 테이블 메타데이터 캐시
//!
//! 서버가 세션 안에서 할당한 table id마다 컬럼 정의를 보관합니다.
//! 같은 id로 새 테이블 맵이 오면 이전 정의는 통째로 교체됩니다.

use crate::connection::{CatalogConnection, ColumnInfo};
use crate::error::{CdcError, Result};
use crate::protocol::{to_usize, PacketReader};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// MySQL 컬럼 타입 코드
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// 확장 메타데이터 블록 태그
mod metadata_tag {
    pub const SIGNEDNESS: u8 = 1;
    pub const DEFAULT_CHARSET: u8 = 2;
    pub const COLUMN_CHARSET: u8 = 3;
    pub const COLUMN_NAME: u8 = 4;
    pub const SET_STR_VALUE: u8 = 5;
    pub const ENUM_STR_VALUE: u8 = 6;
    pub const GEOMETRY_TYPE: u8 = 7;
    pub const SIMPLE_PRIMARY_KEY: u8 = 8;
    pub const PRIMARY_KEY_WITH_PREFIX: u8 = 9;
    pub const ENUM_AND_SET_DEFAULT_CHARSET: u8 = 10;
    pub const ENUM_AND_SET_COLUMN_CHARSET: u8 = 11;
    pub const COLUMN_VISIBILITY: u8 = 12;
}

/// LSB 우선 비트맵
pub(crate) fn bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// MSB 우선 비트맵 (확장 메타데이터용)
fn bit_set_msb(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|byte| byte & (0x80 >> (index % 8)) != 0)
        .unwrap_or(false)
}

/// 컬럼 이름을 얻은 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnNameSource {
    /// 테이블 맵의 확장 메타데이터
    Wire,
    /// information_schema 조회
    Catalog,
    /// 이름 없음 (위치 기반 이름 사용)
    Placeholder,
}

/// 컬럼 정의
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub ordinal: usize,
    /// on-wire 타입 코드
    pub type_code: u8,
    /// STRING 래핑을 풀어낸 실제 타입 (ENUM, SET 등)
    pub real_type: u8,
    /// 타입별 메타데이터 값
    pub meta: u16,
    pub nullable: bool,
    pub unsigned: Option<bool>,
    pub max_length: u32,
    /// collation id
    pub charset: Option<u32>,
    /// 카탈로그에서 얻은 문자셋 이름
    pub charset_name: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub set_values: Option<Vec<String>>,
    pub geometry_type: Option<u32>,
    pub primary_key: bool,
    pub key_prefix: Option<u32>,
    pub visible: Option<bool>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub column_type: Option<String>,
}

impl Column {
    fn from_wire(ordinal: usize, type_code: u8, meta: u16) -> Self {
        use column_type::*;

        let (real_type, max_length) = match type_code {
            STRING => {
                let byte0 = (meta >> 8) as u8;
                let byte1 = (meta & 0xff) as u32;
                if byte0 & 0x30 != 0x30 {
                    // 255바이트를 넘는 CHAR 길이는 byte0의 두 비트에 나뉘어 저장됨
                    (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as u32) << 4))
                } else {
                    (byte0, byte1)
                }
            }
            VARCHAR | VAR_STRING => (type_code, meta as u32),
            BIT => (type_code, (meta >> 8) as u32 * 8 + (meta & 0xff) as u32),
            NEWDECIMAL => (type_code, (meta >> 8) as u32),
            _ => (type_code, 0),
        };

        Column {
            ordinal,
            type_code,
            real_type,
            meta,
            nullable: false,
            unsigned: None,
            max_length,
            charset: None,
            charset_name: None,
            enum_values: None,
            set_values: None,
            geometry_type: None,
            primary_key: false,
            key_prefix: None,
            visible: None,
            name: None,
            comment: None,
            column_type: None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        use column_type::*;
        matches!(
            self.real_type,
            TINY | SHORT | INT24 | LONG | LONGLONG | NEWDECIMAL | FLOAT | DOUBLE | DECIMAL
        )
    }

    pub fn is_character(&self) -> bool {
        use column_type::*;
        matches!(
            self.real_type,
            STRING | VAR_STRING | VARCHAR | BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB
        )
    }

    pub fn is_enum_or_set(&self) -> bool {
        matches!(self.real_type, column_type::ENUM | column_type::SET)
    }

    pub fn is_unsigned(&self) -> bool {
        self.unsigned.unwrap_or(false)
    }

    fn apply_catalog(&mut self, info: &ColumnInfo) {
        self.name = Some(info.name.clone());
        self.comment = Some(info.comment.clone());
        self.column_type = Some(info.column_type.clone());
        if self.charset.is_none() && self.charset_name.is_none() {
            self.charset_name = info.character_set_name.clone();
        }
        if self.unsigned.is_none() && self.is_numeric() {
            self.unsigned = Some(info.is_unsigned());
        }
        if let Some(labels) = info.labels() {
            match self.real_type {
                column_type::ENUM if self.enum_values.is_none() => self.enum_values = Some(labels),
                column_type::SET if self.set_values.is_none() => self.set_values = Some(labels),
                _ => {}
            }
        }
        if info.is_primary_key() {
            self.primary_key = true;
        }
    }
}

/// 테이블 맵 (table id → 스키마, 테이블, 컬럼)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMap {
    pub table_id: u64,
    pub flags: u16,
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub name_source: ColumnNameSource,
}

impl TableMap {
    /// TABLE_MAP 이벤트 본문 디코딩 (헤더와 체크섬 제외)
    pub fn decode(body: &[u8], table_id_len: usize) -> Result<Self> {
        let mut reader = PacketReader::new(body);

        let table_id = reader.read_uint(table_id_len)?;
        let flags = reader.read_u16()?;

        let schema_len = reader.read_u8()? as usize;
        let schema = String::from_utf8_lossy(reader.read_bytes(schema_len)?).into_owned();
        reader.skip(1)?;
        let table_len = reader.read_u8()? as usize;
        let table = String::from_utf8_lossy(reader.read_bytes(table_len)?).into_owned();
        reader.skip(1)?;

        let column_count = to_usize(reader.read_lenenc()?)?;
        let types = reader.read_bytes(column_count)?;

        let meta_block = reader.read_lenenc_bytes()?;
        let mut meta_reader = PacketReader::new(meta_block);
        let mut columns = Vec::with_capacity(column_count);
        for (ordinal, &type_code) in types.iter().enumerate() {
            let meta = read_column_meta(type_code, &mut meta_reader)?;
            columns.push(Column::from_wire(ordinal, type_code, meta));
        }

        let null_bitmap = reader.read_bytes((column_count + 7) / 8)?;
        for column in columns.iter_mut() {
            column.nullable = bit_set(null_bitmap, column.ordinal);
        }

        while !reader.is_empty() {
            let tag = reader.read_u8()?;
            let block = reader.read_lenenc_bytes()?;
            apply_optional_metadata(tag, block, &mut columns)?;
        }

        let name_source = if columns.iter().all(|c| c.name.is_some()) {
            ColumnNameSource::Wire
        } else {
            ColumnNameSource::Placeholder
        };

        Ok(TableMap {
            table_id,
            flags,
            schema,
            table,
            columns,
            name_source,
        })
    }

    pub fn has_column_names(&self) -> bool {
        self.name_source != ColumnNameSource::Placeholder
    }

    /// 이름이 없으면 `UNKNOWN_COL{i}`
    pub fn column_name(&self, index: usize) -> String {
        self.columns
            .get(index)
            .and_then(|c| c.name.clone())
            .unwrap_or_else(|| format!("UNKNOWN_COL{}", index))
    }

    pub fn column_names(&self) -> Vec<String> {
        (0..self.columns.len()).map(|i| self.column_name(i)).collect()
    }

    /// 카탈로그 컬럼을 위치 기준으로 병합. 컬럼 수가 다르면 적용하지 않습니다.
    pub fn apply_catalog(&mut self, catalog: &[ColumnInfo]) -> bool {
        if catalog.len() != self.columns.len() {
            return false;
        }
        for (column, info) in self.columns.iter_mut().zip(catalog) {
            column.apply_catalog(info);
        }
        self.name_source = ColumnNameSource::Catalog;
        true
    }

    fn same_shape(&self, other: &TableMap) -> bool {
        self.schema == other.schema
            && self.table == other.table
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.type_code == b.type_code && a.meta == b.meta)
    }

    fn inherit_catalog(&mut self, previous: &TableMap) {
        for (column, old) in self.columns.iter_mut().zip(&previous.columns) {
            column.name = old.name.clone();
            column.comment = old.comment.clone();
            column.column_type = old.column_type.clone();
            column.charset_name = column.charset_name.take().or_else(|| old.charset_name.clone());
            column.unsigned = column.unsigned.or(old.unsigned);
            column.enum_values = column.enum_values.take().or_else(|| old.enum_values.clone());
            column.set_values = column.set_values.take().or_else(|| old.set_values.clone());
            column.primary_key |= old.primary_key;
        }
        self.name_source = ColumnNameSource::Catalog;
    }
}

fn read_column_meta(type_code: u8, reader: &mut PacketReader<'_>) -> Result<u16> {
    use column_type::*;

    Ok(match type_code {
        FLOAT | DOUBLE | BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | GEOMETRY | JSON | TIME2
        | DATETIME2 | TIMESTAMP2 => reader.read_u8()? as u16,
        VARCHAR | VAR_STRING | BIT => reader.read_u16()?,
        // (precision, scale), (real type, length): 상위 바이트가 먼저
        NEWDECIMAL | STRING | ENUM | SET => {
            let high = reader.read_u8()? as u16;
            let low = reader.read_u8()? as u16;
            high << 8 | low
        }
        _ => 0,
    })
}

fn read_lenenc_u32(reader: &mut PacketReader<'_>) -> Result<u32> {
    let value = reader.read_lenenc()?;
    u32::try_from(value)
        .map_err(|_| CdcError::ProtocolError(format!("metadata value {} out of range", value)))
}

fn read_lenenc_string(reader: &mut PacketReader<'_>) -> Result<String> {
    Ok(String::from_utf8_lossy(reader.read_lenenc_bytes()?).into_owned())
}

/// 조건에 맞는 컬럼들의 가변 참조 (서수 순서)
fn select<'c>(
    columns: &'c mut [Column],
    predicate: impl Fn(&Column) -> bool,
) -> Vec<&'c mut Column> {
    columns.iter_mut().filter(|c| predicate(c)).collect()
}

/// 기본 collation 뒤에 (n번째 컬럼, collation) 예외 쌍이 오는 블록
fn apply_default_charset(block: &mut PacketReader<'_>, targets: Vec<&mut Column>) -> Result<()> {
    let default = read_lenenc_u32(block)?;
    let mut overrides = HashMap::new();
    while !block.is_empty() {
        let index = to_usize(block.read_lenenc()?)?;
        overrides.insert(index, read_lenenc_u32(block)?);
    }
    for (i, column) in targets.into_iter().enumerate() {
        column.charset = Some(overrides.get(&i).copied().unwrap_or(default));
    }
    Ok(())
}

fn apply_column_charset(block: &mut PacketReader<'_>, targets: Vec<&mut Column>) -> Result<()> {
    for column in targets {
        if block.is_empty() {
            break;
        }
        column.charset = Some(read_lenenc_u32(block)?);
    }
    Ok(())
}

fn read_label_lists(block: &mut PacketReader<'_>, count: usize) -> Result<Vec<Vec<String>>> {
    let mut lists = Vec::with_capacity(count);
    for _ in 0..count {
        if block.is_empty() {
            break;
        }
        let labels = to_usize(block.read_lenenc()?)?;
        let mut list = Vec::new();
        for _ in 0..labels {
            list.push(read_lenenc_string(block)?);
        }
        lists.push(list);
    }
    Ok(lists)
}

fn apply_optional_metadata(tag: u8, data: &[u8], columns: &mut [Column]) -> Result<()> {
    use metadata_tag::*;

    let mut block = PacketReader::new(data);
    match tag {
        SIGNEDNESS => {
            for (i, column) in select(columns, Column::is_numeric).into_iter().enumerate() {
                column.unsigned = Some(bit_set_msb(data, i));
            }
        }
        DEFAULT_CHARSET => apply_default_charset(&mut block, select(columns, Column::is_character))?,
        COLUMN_CHARSET => apply_column_charset(&mut block, select(columns, Column::is_character))?,
        COLUMN_NAME => {
            for column in columns.iter_mut() {
                column.name = Some(read_lenenc_string(&mut block)?);
            }
        }
        SET_STR_VALUE | ENUM_STR_VALUE => {
            let real_type = if tag == SET_STR_VALUE {
                column_type::SET
            } else {
                column_type::ENUM
            };
            let targets = select(columns, |c| c.real_type == real_type);
            let lists = read_label_lists(&mut block, targets.len())?;
            for (column, labels) in targets.into_iter().zip(lists) {
                if real_type == column_type::SET {
                    column.set_values = Some(labels);
                } else {
                    column.enum_values = Some(labels);
                }
            }
        }
        GEOMETRY_TYPE => {
            for column in select(columns, |c| c.real_type == column_type::GEOMETRY) {
                column.geometry_type = Some(read_lenenc_u32(&mut block)?);
            }
        }
        SIMPLE_PRIMARY_KEY => {
            while !block.is_empty() {
                let index = to_usize(block.read_lenenc()?)?;
                if let Some(column) = columns.get_mut(index) {
                    column.primary_key = true;
                }
            }
        }
        PRIMARY_KEY_WITH_PREFIX => {
            while !block.is_empty() {
                let index = to_usize(block.read_lenenc()?)?;
                let prefix = read_lenenc_u32(&mut block)?;
                if let Some(column) = columns.get_mut(index) {
                    column.primary_key = true;
                    // 0은 컬럼 전체가 키
                    column.key_prefix = (prefix > 0).then_some(prefix);
                }
            }
        }
        ENUM_AND_SET_DEFAULT_CHARSET => {
            apply_default_charset(&mut block, select(columns, Column::is_enum_or_set))?
        }
        ENUM_AND_SET_COLUMN_CHARSET => {
            apply_column_charset(&mut block, select(columns, Column::is_enum_or_set))?
        }
        COLUMN_VISIBILITY => {
            for (i, column) in columns.iter_mut().enumerate() {
                column.visible = Some(bit_set_msb(data, i));
            }
        }
        other => debug!("Skipping unknown table map metadata tag {}", other),
    }
    Ok(())
}

/// 스트림 하나가 소유하는 table id → [`TableMap`] 캐시
#[derive(Debug, Default)]
pub struct TableMetadataCache {
    tables: HashMap<u64, Arc<TableMap>>,
    strict: bool,
}

impl TableMetadataCache {
    pub fn new(strict: bool) -> Self {
        TableMetadataCache {
            tables: HashMap::new(),
            strict,
        }
    }

    /// 새 정의를 등록합니다. 컬럼 이름이 없으면 카탈로그로 보강을 시도합니다.
    pub async fn install(
        &mut self,
        mut table: TableMap,
        catalog: Option<&mut (dyn CatalogConnection + '_)>,
    ) -> Arc<TableMap> {
        if !table.has_column_names() {
            let inherited = match self.tables.get(&table.table_id) {
                Some(previous)
                    if previous.name_source == ColumnNameSource::Catalog
                        && previous.same_shape(&table) =>
                {
                    table.inherit_catalog(previous);
                    true
                }
                _ => false,
            };

            if !inherited {
                if let Some(catalog) = catalog {
                    enrich_from_catalog(&mut table, catalog).await;
                }
            }

            if !table.has_column_names() {
                debug!(
                    "No column names for {}.{} (table_id={}), using positional names",
                    table.schema, table.table, table.table_id
                );
            }
        }

        let table = Arc::new(table);
        self.tables.insert(table.table_id, table.clone());
        table
    }

    pub fn get(&self, table_id: u64) -> Option<&Arc<TableMap>> {
        self.tables.get(&table_id)
    }

    /// 행 이벤트용 조회
    ///
    /// strict 모드에서는 정의가 없거나 컬럼 이름이 없으면 `TableMetadataUnavailable`,
    /// 그 외에는 알 수 없는 핸들에 대해 `None`을 반환합니다.
    pub fn resolve(&self, table_id: u64) -> Result<Option<Arc<TableMap>>> {
        match self.tables.get(&table_id) {
            Some(table) if self.strict && !table.has_column_names() => {
                Err(CdcError::TableMetadataUnavailable {
                    schema: table.schema.clone(),
                    table: table.table.clone(),
                })
            }
            Some(table) => Ok(Some(table.clone())),
            None if self.strict => Err(CdcError::TableMetadataUnavailable {
                schema: String::new(),
                table: format!("table_id {}", table_id),
            }),
            None => Ok(None),
        }
    }

    /// 로테이션 시 호출. table id는 서버 재시작 후 유지되지 않습니다.
    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

async fn enrich_from_catalog(table: &mut TableMap, catalog: &mut (dyn CatalogConnection + '_)) {
    match catalog.table_columns(&table.schema, &table.table).await {
        Ok(columns) => {
            if table.apply_catalog(&columns) {
                debug!(
                    "Enriched {}.{} with {} catalog columns",
                    table.schema,
                    table.table,
                    columns.len()
                );
            } else {
                warn!(
                    "Catalog has {} columns for {}.{} but table map has {}, ignoring catalog",
                    columns.len(),
                    table.schema,
                    table.table,
                    table.columns.len()
                );
            }
        }
        Err(e) => warn!(
            "Catalog lookup for {}.{} failed: {}",
            table.schema, table.table, e
        ),
    }
}
