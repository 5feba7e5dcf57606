//! GTID (Global Transaction ID) 구간 대수
//!
//! 텍스트 형식: `SID:a-b:c`, 집합은 쉼표로 연결: "uuid1:1-100,uuid2:1-50"
//!
//! 내부적으로 구간은 반열린 `[start, stop)` 형태로 보관하며,
//! 바이너리 인코딩은 서버가 auto-positioning 요청에서 읽는 형식과 동일합니다.

use crate::error::{CdcError, Result};
use crate::protocol::PacketReader;
use bytes::BufMut;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// 반열린 GTID 구간 `[start, stop)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GtidInterval {
    pub start: u64,
    pub stop: u64,
}

impl GtidInterval {
    pub fn new(start: u64, stop: u64) -> Result<Self> {
        let interval = GtidInterval { start, stop };
        interval.validate()?;
        Ok(interval)
    }

    /// 트랜잭션 번호 하나만 담은 구간
    pub fn single(gno: u64) -> Result<Self> {
        let stop = gno
            .checked_add(1)
            .ok_or(CdcError::MalformedInterval { start: gno, stop: gno })?;
        Ok(GtidInterval { start: gno, stop })
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    fn validate(&self) -> Result<()> {
        if self.start > self.stop {
            return Err(CdcError::MalformedInterval {
                start: self.start,
                stop: self.stop,
            });
        }
        Ok(())
    }

    fn overlaps(&self, other: &GtidInterval) -> bool {
        self.start < other.stop && other.start < self.stop
    }

    fn covers(&self, other: &GtidInterval) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }
}

fn gtid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{8}(?:-[0-9a-fA-F]{4}){3}-[0-9a-fA-F]{12})((?::[0-9-]+)+)$")
            .expect("static GTID pattern")
    })
}

fn interval_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([0-9]+)(?:-([0-9]+))?$").expect("static interval pattern"))
}

/// 한 서버(SID)가 커밋한 트랜잭션 번호 구간들
///
/// 구간은 정렬되어 있고 서로 겹치지 않으며, 맞닿은 구간은 항상 하나로 합쳐집니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Gtid {
    sid: Uuid,
    intervals: Vec<GtidInterval>,
}

impl Gtid {
    /// 구간이 없는 GTID
    pub fn new(sid: Uuid) -> Self {
        Gtid {
            sid,
            intervals: Vec::new(),
        }
    }

    /// 트랜잭션 하나 `sid:gno`
    pub fn single(sid: Uuid, gno: u64) -> Result<Self> {
        let mut gtid = Gtid::new(sid);
        gtid.add_interval(GtidInterval::single(gno)?)?;
        Ok(gtid)
    }

    pub fn with_intervals<I>(sid: Uuid, intervals: I) -> Result<Self>
    where
        I: IntoIterator<Item = GtidInterval>,
    {
        let mut gtid = Gtid::new(sid);
        for interval in intervals {
            gtid.add_interval(interval)?;
        }
        Ok(gtid)
    }

    /// 텍스트 형식 파싱: `SID:1-5:7`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let captures = gtid_pattern()
            .captures(text)
            .ok_or_else(|| CdcError::ParseError(format!("GTID 형식이 아닙니다: {:?}", text)))?;

        let sid = Uuid::parse_str(&captures[1])
            .map_err(|e| CdcError::ParseError(format!("잘못된 SID {:?}: {}", &captures[1], e)))?;

        let mut gtid = Gtid::new(sid);
        for part in captures[2].split(':').skip(1) {
            gtid.add_interval(parse_interval(part)?)?;
        }
        Ok(gtid)
    }

    pub fn sid(&self) -> Uuid {
        self.sid
    }

    pub fn intervals(&self) -> &[GtidInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// 구간 추가. 맞닿은 구간은 합치고, 겹치는 구간은 에러입니다.
    pub fn add_interval(&mut self, interval: GtidInterval) -> Result<()> {
        interval.validate()?;
        if interval.is_empty() {
            return Ok(());
        }
        if self.intervals.iter().any(|existing| existing.overlaps(&interval)) {
            return Err(CdcError::OverlappingInterval {
                start: interval.start,
                stop: interval.stop,
            });
        }

        let mut merged = interval;
        self.intervals.retain(|existing| {
            if existing.stop == merged.start {
                merged.start = existing.start;
                false
            } else if existing.start == merged.stop {
                merged.stop = existing.stop;
                false
            } else {
                true
            }
        });

        let at = self.intervals.partition_point(|existing| existing.start < merged.start);
        self.intervals.insert(at, merged);
        Ok(())
    }

    /// 구간 제거. 부분적으로 겹치는 구간은 쪼개지고, 겹치지 않으면 변화가 없습니다.
    pub fn subtract_interval(&mut self, interval: GtidInterval) -> Result<()> {
        interval.validate()?;
        if interval.is_empty() {
            return Ok(());
        }

        let mut remaining = Vec::with_capacity(self.intervals.len() + 1);
        for existing in &self.intervals {
            if !existing.overlaps(&interval) {
                remaining.push(*existing);
                continue;
            }
            if existing.start < interval.start {
                remaining.push(GtidInterval {
                    start: existing.start,
                    stop: interval.start,
                });
            }
            if interval.stop < existing.stop {
                remaining.push(GtidInterval {
                    start: interval.stop,
                    stop: existing.stop,
                });
            }
        }
        self.intervals = remaining;
        Ok(())
    }

    /// 두 GTID의 합집합. SID가 다르면 에러입니다.
    pub fn union(&self, other: &Gtid) -> Result<Gtid> {
        if self.sid != other.sid {
            return Err(CdcError::SidMismatch {
                left: self.sid.to_string(),
                right: other.sid.to_string(),
            });
        }

        let mut result = self.clone();
        for interval in &other.intervals {
            result.subtract_interval(*interval)?;
            result.add_interval(*interval)?;
        }
        Ok(result)
    }

    /// `other`에 포함된 트랜잭션을 뺀 결과. SID가 다르면 그대로 복사합니다.
    pub fn difference(&self, other: &Gtid) -> Gtid {
        let mut result = self.clone();
        if self.sid != other.sid {
            return result;
        }
        for interval in &other.intervals {
            // 저장된 구간은 항상 유효하므로 실패하지 않음
            let _ = result.subtract_interval(*interval);
        }
        result
    }

    /// `other`의 모든 구간이 이 GTID의 어떤 구간에 포함되는지
    pub fn contains(&self, other: &Gtid) -> bool {
        self.sid == other.sid
            && other.intervals.iter().all(|needle| {
                self.intervals
                    .iter()
                    .any(|interval| interval.covers(needle))
            })
    }

    /// SID, 그다음 구간 목록의 사전식 순서
    pub fn compare(&self, other: &Gtid) -> Ordering {
        self.sid
            .cmp(&other.sid)
            .then_with(|| self.intervals.cmp(&other.intervals))
    }

    pub fn encoded_len(&self) -> usize {
        16 + 8 + self.intervals.len() * 16
    }

    /// `sid[16] + count[8] + (start[8], stop[8])*`, 모두 little-endian
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.sid.as_bytes());
        buf.put_u64_le(self.intervals.len() as u64);
        for interval in &self.intervals {
            buf.put_u64_le(interval.start);
            buf.put_u64_le(interval.stop);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(data);
        let gtid = Gtid::read_from(&mut reader)?;
        ensure_consumed(&reader)?;
        Ok(gtid)
    }

    pub(crate) fn read_from(reader: &mut PacketReader<'_>) -> Result<Self> {
        let sid = Uuid::from_slice(reader.read_bytes(16)?)
            .map_err(|e| CdcError::ProtocolError(format!("invalid SID bytes: {}", e)))?;
        let count = reader.read_u64()?;

        let mut gtid = Gtid::new(sid);
        for _ in 0..count {
            let start = reader.read_u64()?;
            let stop = reader.read_u64()?;
            gtid.add_interval(GtidInterval { start, stop })?;
        }
        Ok(gtid)
    }
}

fn parse_interval(text: &str) -> Result<GtidInterval> {
    let captures = interval_pattern()
        .captures(text)
        .ok_or_else(|| CdcError::ParseError(format!("GTID 구간 형식이 아닙니다: {:?}", text)))?;

    let parse_number = |s: &str| {
        s.parse::<u64>()
            .map_err(|e| CdcError::ParseError(format!("GTID 번호 {:?}: {}", s, e)))
    };

    let start = parse_number(&captures[1])?;
    let last = match captures.get(2) {
        Some(m) => parse_number(m.as_str())?,
        None => start,
    };
    let stop = last
        .checked_add(1)
        .ok_or_else(|| CdcError::ParseError(format!("GTID 번호가 너무 큽니다: {}", last)))?;
    GtidInterval::new(start, stop)
}

fn ensure_consumed(reader: &PacketReader<'_>) -> Result<()> {
    if !reader.is_empty() {
        return Err(CdcError::ProtocolError(format!(
            "{} trailing bytes after GTID data",
            reader.remaining()
        )));
    }
    Ok(())
}

impl PartialOrd for Gtid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Gtid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for interval in &self.intervals {
            if interval.stop - interval.start == 1 {
                write!(f, ":{}", interval.start)?;
            } else {
                write!(f, ":{}-{}", interval.start, interval.stop - 1)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Gtid {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Gtid::parse(s)
    }
}

impl TryFrom<String> for Gtid {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        Gtid::parse(&value)
    }
}

impl From<Gtid> for String {
    fn from(gtid: Gtid) -> Self {
        gtid.to_string()
    }
}

/// 여러 서버의 GTID 집합. SID마다 최대 하나의 [`Gtid`]를 가지며 삽입 순서를 유지합니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GtidSet {
    gtids: Vec<Gtid>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet { gtids: Vec::new() }
    }

    /// 쉼표로 구분된 텍스트 파싱. 공백과 줄바꿈은 무시합니다.
    pub fn parse(text: &str) -> Result<Self> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut set = GtidSet::new();
        if compact.is_empty() {
            return Ok(set);
        }
        for part in compact.split(',') {
            set.merge(Gtid::parse(part)?)?;
        }
        Ok(set)
    }

    pub fn from_gtids<I>(gtids: I) -> Result<Self>
    where
        I: IntoIterator<Item = Gtid>,
    {
        let mut set = GtidSet::new();
        for gtid in gtids {
            set.merge(gtid)?;
        }
        Ok(set)
    }

    /// 같은 SID 항목과 합치거나 새 항목으로 추가
    pub fn merge(&mut self, gtid: Gtid) -> Result<()> {
        match self.gtids.iter_mut().find(|existing| existing.sid == gtid.sid) {
            Some(existing) => *existing = existing.union(&gtid)?,
            None => self.gtids.push(gtid),
        }
        Ok(())
    }

    /// 새 집합을 반환합니다. 원본은 바뀌지 않습니다.
    pub fn union(&self, other: &GtidSet) -> Result<GtidSet> {
        let mut result = self.clone();
        for gtid in &other.gtids {
            result.merge(gtid.clone())?;
        }
        Ok(result)
    }

    pub fn union_gtid(&self, gtid: &Gtid) -> Result<GtidSet> {
        let mut result = self.clone();
        result.merge(gtid.clone())?;
        Ok(result)
    }

    /// `other`의 각 GTID가 같은 SID 항목에 포함되는지
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.gtids.iter().all(|gtid| {
            self.get(&gtid.sid)
                .map(|existing| existing.contains(gtid))
                .unwrap_or(false)
        })
    }

    pub fn contains_gtid(&self, gtid: &Gtid) -> bool {
        self.gtids.iter().any(|existing| existing.contains(gtid))
    }

    pub fn get(&self, sid: &Uuid) -> Option<&Gtid> {
        self.gtids.iter().find(|gtid| &gtid.sid == sid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.gtids.iter()
    }

    pub fn len(&self) -> usize {
        self.gtids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gtids.iter().all(Gtid::is_empty)
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.gtids.iter().map(Gtid::encoded_len).sum::<usize>()
    }

    /// `count[8]` 뒤에 각 GTID 인코딩
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.gtids.len() as u64);
        for gtid in &self.gtids {
            gtid.encode_into(buf);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(data);
        let set = GtidSet::read_from(&mut reader)?;
        ensure_consumed(&reader)?;
        Ok(set)
    }

    pub(crate) fn read_from(reader: &mut PacketReader<'_>) -> Result<Self> {
        let count = reader.read_u64()?;
        let mut set = GtidSet::new();
        for _ in 0..count {
            set.merge(Gtid::read_from(reader)?)?;
        }
        Ok(set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, gtid) in self.gtids.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", gtid)?;
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl TryFrom<String> for GtidSet {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        GtidSet::parse(&value)
    }
}

impl From<GtidSet> for String {
    fn from(set: GtidSet) -> Self {
        set.to_string()
    }
}

impl From<Gtid> for GtidSet {
    fn from(gtid: Gtid) -> Self {
        GtidSet { gtids: vec![gtid] }
    }
}
