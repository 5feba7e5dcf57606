//! 행 이미지 디코더
//!
//! 행 변경 이벤트의 row image를 [`TableMap`]의 컬럼 타입에 따라 값으로 풀어냅니다.

use crate::error::{CdcError, Result};
use crate::events::{CellValue, DecodedRow, MysqlTime, RowValues, RowsKind};
use crate::json_binary;
use crate::protocol::{to_usize, PacketReader};
use crate::table_map::{bit_set, column_type, Column, TableMap};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::trace;

const DIG_PER_DEC: usize = 9;
const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;
const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;

/// 디코딩 옵션
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// 잘못된 문자열 바이트를 에러 대신 손실 변환
    pub ignore_decode_errors: bool,
}

/// 문자 데이터 인코딩
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextEncoding {
    Utf8,
    Latin1,
    Binary,
}

impl TextEncoding {
    fn from_collation(id: u32) -> Self {
        match id {
            63 => TextEncoding::Binary,
            5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => TextEncoding::Latin1,
            _ => TextEncoding::Utf8,
        }
    }

    fn from_charset_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "binary" => TextEncoding::Binary,
            "latin1" => TextEncoding::Latin1,
            _ => TextEncoding::Utf8,
        }
    }

    fn of(column: &Column) -> Option<Self> {
        column
            .charset
            .map(TextEncoding::from_collation)
            .or_else(|| column.charset_name.as_deref().map(TextEncoding::from_charset_name))
    }
}

pub struct RowImageDecoder<'a> {
    table: &'a TableMap,
    options: DecodeOptions,
}

impl<'a> RowImageDecoder<'a> {
    pub fn new(table: &'a TableMap, options: DecodeOptions) -> Self {
        RowImageDecoder { table, options }
    }

    /// 이벤트 본문의 나머지(행 이미지들)를 모두 디코딩
    pub fn decode_rows(
        &self,
        kind: RowsKind,
        reader: &mut PacketReader<'_>,
        present: &[u8],
        present_after: Option<&[u8]>,
    ) -> Result<Vec<DecodedRow>> {
        let mut rows = Vec::new();
        while !reader.is_empty() {
            let remaining = reader.remaining();
            let row = match kind {
                RowsKind::Write | RowsKind::Delete => DecodedRow::Row {
                    values: self.decode_image(reader, present)?,
                },
                RowsKind::Update => {
                    let before_values = self.decode_image(reader, present)?;
                    let after_values = self.decode_image(reader, present_after.unwrap_or(present))?;
                    DecodedRow::Update {
                        before_values,
                        after_values,
                    }
                }
            };
            // 컬럼이 하나도 선택되지 않은 이미지는 바이트를 소비하지 않음
            if reader.remaining() == remaining {
                return Err(CdcError::ProtocolError(format!(
                    "row image for {}.{} selects no columns but {} bytes remain",
                    self.table.schema, self.table.table, remaining
                )));
            }
            rows.push(row);
        }
        trace!(
            "Decoded {} rows for {}.{}",
            rows.len(),
            self.table.schema,
            self.table.table
        );
        Ok(rows)
    }

    /// row image 하나. 이미지에 없는 컬럼은 `Null`로 채웁니다.
    pub fn decode_image(&self, reader: &mut PacketReader<'_>, present: &[u8]) -> Result<RowValues> {
        let columns = &self.table.columns;
        let present_count = (0..columns.len()).filter(|&i| bit_set(present, i)).count();
        let nulls = reader.read_bytes((present_count + 7) / 8)?;

        let mut values = RowValues::with_capacity(columns.len());
        // null 비트는 이미지에 포함된 컬럼에만 할당됨
        let mut null_index = 0;
        for (i, column) in columns.iter().enumerate() {
            let name = self.table.column_name(i);
            if !bit_set(present, i) {
                values.insert(name, CellValue::Null);
                continue;
            }
            let is_null = bit_set(nulls, null_index);
            null_index += 1;

            let value = if is_null {
                CellValue::Null
            } else {
                self.decode_value(column, &name, reader)?
            };
            values.insert(name, value);
        }
        Ok(values)
    }

    pub fn decode_value(
        &self,
        column: &Column,
        name: &str,
        reader: &mut PacketReader<'_>,
    ) -> Result<CellValue> {
        use column_type::*;

        let unsigned = column.is_unsigned();
        let meta = column.meta;

        let value = match column.real_type {
            NULL => CellValue::Null,
            TINY => {
                let v = reader.read_u8()?;
                if unsigned {
                    CellValue::UInt(v as u64)
                } else {
                    CellValue::Int(v as i8 as i64)
                }
            }
            SHORT => {
                let v = reader.read_u16()?;
                if unsigned {
                    CellValue::UInt(v as u64)
                } else {
                    CellValue::Int(v as i16 as i64)
                }
            }
            INT24 => {
                let v = reader.read_u24()?;
                if unsigned {
                    CellValue::UInt(v as u64)
                } else {
                    CellValue::Int(((v << 8) as i32 >> 8) as i64)
                }
            }
            LONG => {
                let v = reader.read_u32()?;
                if unsigned {
                    CellValue::UInt(v as u64)
                } else {
                    CellValue::Int(v as i32 as i64)
                }
            }
            LONGLONG => {
                let v = reader.read_u64()?;
                if unsigned {
                    CellValue::UInt(v)
                } else {
                    CellValue::Int(v as i64)
                }
            }
            YEAR => {
                let v = reader.read_u8()? as u16;
                CellValue::Year(if v == 0 { 0 } else { 1900 + v })
            }
            FLOAT => CellValue::Float(f32::from_bits(reader.read_u32()?)),
            DOUBLE => CellValue::Double(f64::from_bits(reader.read_u64()?)),
            NEWDECIMAL => {
                let precision = (meta >> 8) as usize;
                let scale = (meta & 0xff) as usize;
                CellValue::Decimal(decode_decimal(reader, precision, scale)?)
            }
            VARCHAR | VAR_STRING | STRING => {
                let width = if column.max_length > 255 { 2 } else { 1 };
                let bytes = reader.read_length_prefixed(width)?;
                self.decode_text(TextEncoding::of(column).unwrap_or(TextEncoding::Utf8), name, bytes)?
            }
            BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB => {
                let bytes = reader.read_length_prefixed(meta as usize)?;
                match TextEncoding::of(column) {
                    Some(encoding) => self.decode_text(encoding, name, bytes)?,
                    None => CellValue::Bytes(bytes.to_vec()),
                }
            }
            JSON => {
                let bytes = reader.read_length_prefixed(meta as usize)?;
                CellValue::Json(json_binary::decode(bytes)?)
            }
            GEOMETRY => CellValue::Bytes(reader.read_length_prefixed(meta as usize)?.to_vec()),
            ENUM => {
                let index = reader.read_uint((meta & 0xff) as usize)?;
                match &column.enum_values {
                    Some(labels) => CellValue::Enum(enum_label(labels, index)),
                    None => CellValue::UInt(index),
                }
            }
            SET => {
                let mask = reader.read_uint((meta & 0xff) as usize)?;
                match &column.set_values {
                    Some(labels) => CellValue::Set(
                        labels
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i < 64 && mask & (1 << i) != 0)
                            .map(|(_, label)| label.clone())
                            .collect(),
                    ),
                    None => CellValue::UInt(mask),
                }
            }
            BIT => {
                let bytes = (meta >> 8) as usize + usize::from(meta & 0xff > 0);
                CellValue::Bit(reader.read_uint_be(bytes)?)
            }
            DATE => decode_date(reader.read_u24()?),
            TIME => {
                let raw = reader.read_u24()?;
                let v = (raw << 8) as i32 >> 8;
                let abs = v.unsigned_abs();
                CellValue::Time(MysqlTime {
                    negative: v < 0,
                    hours: abs / 10000,
                    minutes: ((abs / 100) % 100) as u8,
                    seconds: (abs % 100) as u8,
                    microseconds: 0,
                })
            }
            DATETIME => decode_datetime(reader.read_u64()?),
            TIMESTAMP => match reader.read_u32()? {
                0 => CellValue::Null,
                secs => timestamp(secs as i64, 0),
            },
            TIMESTAMP2 => {
                let secs = reader.read_uint_be(4)?;
                let micros = read_fraction(reader, meta)?;
                if secs == 0 {
                    CellValue::Null
                } else {
                    timestamp(secs as i64, micros)
                }
            }
            DATETIME2 => decode_datetime2(reader, meta)?,
            TIME2 => decode_time2(reader, meta)?,
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "unsupported column type {} for column `{}`",
                    other, name
                )))
            }
        };
        Ok(value)
    }

    fn decode_text(&self, encoding: TextEncoding, name: &str, bytes: &[u8]) -> Result<CellValue> {
        match encoding {
            TextEncoding::Binary => Ok(CellValue::Bytes(bytes.to_vec())),
            TextEncoding::Latin1 => Ok(CellValue::String(bytes.iter().map(|&b| b as char).collect())),
            TextEncoding::Utf8 => match std::str::from_utf8(bytes) {
                Ok(text) => Ok(CellValue::String(text.to_string())),
                Err(_) if self.options.ignore_decode_errors => {
                    Ok(CellValue::String(String::from_utf8_lossy(bytes).into_owned()))
                }
                Err(e) => Err(CdcError::DecodingError {
                    column: name.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// 1부터 시작. 0은 빈 문자열(잘못된 값)
fn enum_label(labels: &[String], index: u64) -> String {
    match index {
        0 => String::new(),
        i => labels.get((i - 1) as usize).cloned().unwrap_or_default(),
    }
}

fn timestamp(secs: i64, micros: u32) -> CellValue {
    DateTime::from_timestamp(secs, micros * 1000)
        .map(CellValue::Timestamp)
        .unwrap_or(CellValue::Null)
}

fn datetime(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year as i32, month, day)?.and_hms_micro_opt(hour, minute, second, micros)
}

fn decode_date(v: u32) -> CellValue {
    if v == 0 {
        return CellValue::Null;
    }
    let day = v & 31;
    let month = (v >> 5) & 15;
    let year = v >> 9;
    NaiveDate::from_ymd_opt(year as i32, month, day)
        .map(CellValue::Date)
        .unwrap_or(CellValue::Null)
}

/// YYYYMMDDhhmmss 정수
fn decode_datetime(v: u64) -> CellValue {
    if v == 0 {
        return CellValue::Null;
    }
    let date = v / 1_000_000;
    let time = v % 1_000_000;
    datetime(
        (date / 10000) as u32,
        ((date / 100) % 100) as u32,
        (date % 100) as u32,
        (time / 10000) as u32,
        ((time / 100) % 100) as u32,
        (time % 100) as u32,
        0,
    )
    .map(CellValue::DateTime)
    .unwrap_or(CellValue::Null)
}

/// fsp(소수 초 자릿수)에 따른 소수부. 마이크로초로 환산
fn read_fraction(reader: &mut PacketReader<'_>, fsp: u16) -> Result<u32> {
    Ok(match fsp {
        1 | 2 => reader.read_uint_be(1)? as u32 * 10000,
        3 | 4 => reader.read_uint_be(2)? as u32 * 100,
        5 | 6 => reader.read_uint_be(3)? as u32,
        _ => 0,
    })
}

fn decode_datetime2(reader: &mut PacketReader<'_>, fsp: u16) -> Result<CellValue> {
    let packed = reader.read_uint_be(5)? as i64 - DATETIMEF_INT_OFS;
    let micros = read_fraction(reader, fsp)?;

    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed % (1 << 17);

    let value = datetime(
        (ym / 13) as u32,
        (ym % 13) as u32,
        (ymd % 32) as u32,
        (hms >> 12) as u32,
        ((hms >> 6) % 64) as u32,
        (hms % 64) as u32,
        micros,
    );
    Ok(value.map(CellValue::DateTime).unwrap_or(CellValue::Null))
}

fn decode_time2(reader: &mut PacketReader<'_>, fsp: u16) -> Result<CellValue> {
    let packed = match fsp {
        1 | 2 | 3 | 4 => {
            let mut int_part = reader.read_uint_be(3)? as i64 - TIMEF_INT_OFS;
            let (mut frac, overflow, scale) = if fsp <= 2 {
                (reader.read_uint_be(1)? as i64, 0x100, 10000)
            } else {
                (reader.read_uint_be(2)? as i64, 0x10000, 100)
            };
            // 음수 시간의 소수부는 보수로 저장됨
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= overflow;
            }
            (int_part << 24) + frac * scale
        }
        5 | 6 => reader.read_uint_be(6)? as i64 - TIMEF_OFS,
        _ => (reader.read_uint_be(3)? as i64 - TIMEF_INT_OFS) << 24,
    };

    let negative = packed < 0;
    let abs = packed.unsigned_abs();
    let hms = abs >> 24;
    Ok(CellValue::Time(MysqlTime {
        negative,
        hours: ((hms >> 12) % (1 << 10)) as u32,
        minutes: ((hms >> 6) % 64) as u8,
        seconds: (hms % 64) as u8,
        microseconds: (abs % (1 << 24)) as u32,
    }))
}

/// MySQL packed decimal → 정규화된 10진 문자열 (소수부는 scale 자릿수 유지)
pub(crate) fn decode_decimal(
    reader: &mut PacketReader<'_>,
    precision: usize,
    scale: usize,
) -> Result<String> {
    if scale > precision {
        return Err(CdcError::ProtocolError(format!(
            "decimal scale {} exceeds precision {}",
            scale, precision
        )));
    }
    let integral = precision - scale;
    let uncomp_integral = integral / DIG_PER_DEC;
    let comp_integral = integral % DIG_PER_DEC;
    let uncomp_fractional = scale / DIG_PER_DEC;
    let comp_fractional = scale % DIG_PER_DEC;

    let size = uncomp_integral * 4
        + DIG_TO_BYTES[comp_integral]
        + uncomp_fractional * 4
        + DIG_TO_BYTES[comp_fractional];
    if size == 0 {
        return Ok("0".to_string());
    }

    let mut buf = reader.read_bytes(size)?.to_vec();
    // 부호 비트가 0이면 음수
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        buf.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = PacketReader::new(&buf);
    let mut integer = String::new();
    if comp_integral > 0 {
        let v = digits.read_uint_be(DIG_TO_BYTES[comp_integral])?;
        integer.push_str(&format!("{:0width$}", v, width = comp_integral));
    }
    for _ in 0..uncomp_integral {
        integer.push_str(&format!("{:09}", digits.read_uint_be(4)?));
    }
    let integer = integer.trim_start_matches('0');

    let mut fraction = String::new();
    for _ in 0..uncomp_fractional {
        fraction.push_str(&format!("{:09}", digits.read_uint_be(4)?));
    }
    if comp_fractional > 0 {
        let v = digits.read_uint_be(DIG_TO_BYTES[comp_fractional])?;
        fraction.push_str(&format!("{:0width$}", v, width = comp_fractional));
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(if integer.is_empty() { "0" } else { integer });
    if !fraction.is_empty() {
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// 행 이벤트의 컬럼 수와 present 비트맵 길이
pub(crate) fn bitmap_len(column_count: u64) -> Result<usize> {
    Ok((to_usize(column_count)? + 7) / 8)
}
