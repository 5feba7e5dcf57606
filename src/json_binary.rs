//! MySQL 바이너리 JSON 포맷 디코더
//!
//! 컨테이너 안의 오프셋은 컨테이너 시작(원소 개수 필드) 기준입니다.

use crate::error::{CdcError, Result};
use crate::protocol::PacketReader;
use crate::row_decoder::decode_decimal;
use crate::table_map::column_type;
use serde_json::{Map, Number, Value};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// JSON 컬럼 값 디코딩. 빈 값은 JSON null
pub fn decode(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((&value_type, body)) => decode_value(value_type, body),
    }
}

fn slice_from(data: &[u8], offset: usize) -> Result<&[u8]> {
    data.get(offset..)
        .ok_or_else(|| CdcError::truncated("json value", offset, data.len()))
}

fn decode_value(value_type: u8, data: &[u8]) -> Result<Value> {
    let mut reader = PacketReader::new(data);
    match value_type {
        SMALL_OBJECT => decode_container(data, false, true),
        LARGE_OBJECT => decode_container(data, true, true),
        SMALL_ARRAY => decode_container(data, false, false),
        LARGE_ARRAY => decode_container(data, true, false),
        LITERAL => decode_literal(reader.read_u8()?),
        INT16 => Ok(Value::from(reader.read_u16()? as i16)),
        UINT16 => Ok(Value::from(reader.read_u16()?)),
        INT32 => Ok(Value::from(reader.read_u32()? as i32)),
        UINT32 => Ok(Value::from(reader.read_u32()?)),
        INT64 => Ok(Value::from(reader.read_u64()? as i64)),
        UINT64 => Ok(Value::from(reader.read_u64()?)),
        DOUBLE => {
            let v = f64::from_bits(reader.read_u64()?);
            Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
        }
        STRING => {
            let len = read_variable_length(&mut reader)?;
            Ok(Value::String(
                String::from_utf8_lossy(reader.read_bytes(len)?).into_owned(),
            ))
        }
        OPAQUE => decode_opaque(&mut reader),
        other => Err(CdcError::ProtocolError(format!(
            "unknown json value type 0x{:02x}",
            other
        ))),
    }
}

fn decode_literal(literal: u8) -> Result<Value> {
    match literal {
        LITERAL_NULL => Ok(Value::Null),
        LITERAL_TRUE => Ok(Value::Bool(true)),
        LITERAL_FALSE => Ok(Value::Bool(false)),
        other => Err(CdcError::ProtocolError(format!(
            "unknown json literal 0x{:02x}",
            other
        ))),
    }
}

/// 7비트씩 끊어 저장한 길이 (최대 5바이트)
fn read_variable_length(reader: &mut PacketReader<'_>) -> Result<usize> {
    let mut length = 0usize;
    for i in 0..5 {
        let byte = reader.read_u8()?;
        length |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(length);
        }
    }
    Err(CdcError::ProtocolError(
        "json variable length exceeds 5 bytes".to_string(),
    ))
}

fn is_inlined(value_type: u8, large: bool) -> bool {
    match value_type {
        LITERAL | INT16 | UINT16 => true,
        INT32 | UINT32 => large,
        _ => false,
    }
}

fn decode_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
    let mut reader = PacketReader::new(data);
    let offset_size = if large { 4 } else { 2 };
    let count = reader.read_uint(offset_size)? as usize;
    let _size = reader.read_uint(offset_size)?;

    let keys = if is_object {
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let key_offset = reader.read_uint(offset_size)? as usize;
            let key_len = reader.read_u16()? as usize;
            let key = slice_from(data, key_offset)?
                .get(..key_len)
                .ok_or_else(|| CdcError::truncated("json key", key_len, data.len()))?;
            keys.push(String::from_utf8_lossy(key).into_owned());
        }
        keys
    } else {
        Vec::new()
    };

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let value_type = reader.read_u8()?;
        let entry = reader.read_bytes(offset_size)?;
        let value = if is_inlined(value_type, large) {
            decode_value(value_type, entry)?
        } else {
            let offset = PacketReader::new(entry).read_uint(offset_size)? as usize;
            decode_value(value_type, slice_from(data, offset)?)?
        };
        values.push(value);
    }

    if is_object {
        let map: Map<String, Value> = keys.into_iter().zip(values).collect();
        Ok(Value::Object(map))
    } else {
        Ok(Value::Array(values))
    }
}

/// 바이너리 JSON 안의 MySQL 고유 타입. DECIMAL만 숫자로 풀고 나머지는 16진 문자열
fn decode_opaque(reader: &mut PacketReader<'_>) -> Result<Value> {
    let mysql_type = reader.read_u8()?;
    let len = read_variable_length(reader)?;
    let payload = reader.read_bytes(len)?;

    if mysql_type == column_type::NEWDECIMAL && payload.len() >= 2 {
        let mut decimal = PacketReader::new(&payload[2..]);
        let text = decode_decimal(&mut decimal, payload[0] as usize, payload[1] as usize)?;
        return Ok(text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)));
    }

    Ok(Value::String(
        payload.iter().map(|b| format!("{:02x}", b)).collect(),
    ))
}
