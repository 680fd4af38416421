//! MSDP 編解碼
//!
//! 框架格式：`IAC SB MSDP (VAR name VAL value)* IAC SE`
//!
//! 值可以是純量、陣列 (`ARRAY_OPEN (VAL v)* ARRAY_CLOSE`) 或表格
//! (`TABLE_OPEN (VAR k VAL v)* TABLE_CLOSE`)。純量中的 IAC 以 `IAC IAC` 轉義。
//!
//! 注意：最上層的「只有一個項目的表格」與「單一 VAR/VAL 配對」編碼後相同，
//! 解碼時一律還原為配對，這是格式本身的限制。

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use crate::telnet::{TelnetCommand, TelnetOption, IAC};

pub const MSDP_VAR: u8 = 1;
pub const MSDP_VAL: u8 = 2;
pub const MSDP_TABLE_OPEN: u8 = 3;
pub const MSDP_TABLE_CLOSE: u8 = 4;
pub const MSDP_ARRAY_OPEN: u8 = 5;
pub const MSDP_ARRAY_CLOSE: u8 = 6;

/// 框架前導：`IAC SB MSDP`
pub const PROLOGUE: [u8; 3] = [IAC, TelnetCommand::Sb as u8, TelnetOption::MSDP_CODE];
/// 框架結尾：`IAC SE`
pub const EPILOGUE: [u8; 2] = [IAC, TelnetCommand::Se as u8];

/// MSDP 解碼錯誤
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsdpError {
    #[error("MSDP 框架缺少前導序列 (expecting prologue)")]
    MissingPrologue,

    #[error("MSDP 框架缺少結尾序列 (expecting epilogue)")]
    MissingEpilogue,

    #[error("MSDP 格式錯誤: 位置 {offset} 預期 {expected}")]
    Format {
        offset: usize,
        expected: &'static str,
    },
}

/// MSDP 值
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MsdpValue {
    /// 純量（原始位元組）
    Scalar(#[serde(serialize_with = "serialize_lossy")] Vec<u8>),
    /// 陣列
    Array(Vec<MsdpValue>),
    /// 表格
    Table(BTreeMap<String, MsdpValue>),
    /// 名稱／值配對，作為框架或列表的項目
    Var(Box<MsdpVar>),
}

fn serialize_lossy<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl MsdpValue {
    pub fn scalar(text: impl AsRef<[u8]>) -> Self {
        Self::Scalar(text.as_ref().to_vec())
    }

    pub fn array<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<MsdpValue>,
    {
        Self::Array(items.into_iter().map(Into::into).collect())
    }

    /// 以字串讀取純量（非 UTF-8 位元組以替代字元呈現）
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Scalar(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// 將純量或純量陣列攤平成字串列表
    pub fn to_names(&self) -> Vec<String> {
        match self {
            Self::Scalar(_) => self.as_text().into_iter().collect(),
            Self::Array(items) => items.iter().filter_map(MsdpValue::as_text).collect(),
            _ => Vec::new(),
        }
    }

    /// 值集合是否含有 `token`
    ///
    /// 陣列比對每個純量元素；純量則比對以空白分隔的每個字詞。
    pub fn contains_token(&self, token: &str) -> bool {
        match self {
            Self::Scalar(_) => self
                .as_text()
                .is_some_and(|text| text.split_whitespace().any(|t| t == token)),
            Self::Array(items) => items
                .iter()
                .any(|item| item.as_text().is_some_and(|text| text == token)),
            _ => false,
        }
    }
}

impl From<&str> for MsdpValue {
    fn from(text: &str) -> Self {
        Self::scalar(text)
    }
}

impl From<String> for MsdpValue {
    fn from(text: String) -> Self {
        Self::Scalar(text.into_bytes())
    }
}

impl From<MsdpVar> for MsdpValue {
    fn from(var: MsdpVar) -> Self {
        Self::Var(Box::new(var))
    }
}

/// 名稱／值配對
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MsdpVar {
    pub name: String,
    pub value: MsdpValue,
}

impl MsdpVar {
    pub fn new(name: impl Into<String>, value: impl Into<MsdpValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn put_escaped(buf: &mut BytesMut, bytes: &[u8]) {
    for &b in bytes {
        if b == IAC {
            buf.put_u8(IAC);
        }
        buf.put_u8(b);
    }
}

fn put_pair(buf: &mut BytesMut, name: &str, value: &MsdpValue) {
    buf.put_u8(MSDP_VAR);
    // UTF-8 名稱不會含有 0xFF，不需轉義
    buf.put_slice(name.as_bytes());
    buf.put_u8(MSDP_VAL);
    put_value(buf, value);
}

/// 編碼值位置上的 MSDP 值
fn put_value(buf: &mut BytesMut, value: &MsdpValue) {
    match value {
        MsdpValue::Scalar(bytes) => put_escaped(buf, bytes),
        MsdpValue::Array(items) => {
            buf.put_u8(MSDP_ARRAY_OPEN);
            for item in items {
                buf.put_u8(MSDP_VAL);
                put_value(buf, item);
            }
            buf.put_u8(MSDP_ARRAY_CLOSE);
        }
        MsdpValue::Table(entries) => {
            buf.put_u8(MSDP_TABLE_OPEN);
            for (key, item) in entries {
                put_pair(buf, key, item);
            }
            buf.put_u8(MSDP_TABLE_CLOSE);
        }
        MsdpValue::Var(var) => put_pair(buf, &var.name, &var.value),
    }
}

/// 編碼最上層的值
///
/// 陣列、表格與配對會包上完整框架（表格的項目成為框架中的配對）；
/// 純量只做 IAC 轉義。
pub fn encode(value: &MsdpValue) -> Bytes {
    let mut buf = BytesMut::new();
    match value {
        MsdpValue::Scalar(_) => put_value(&mut buf, value),
        MsdpValue::Array(items) => {
            buf.put_slice(&PROLOGUE);
            for item in items {
                put_value(&mut buf, item);
            }
            buf.put_slice(&EPILOGUE);
        }
        MsdpValue::Table(entries) => {
            buf.put_slice(&PROLOGUE);
            for (key, item) in entries {
                put_pair(&mut buf, key, item);
            }
            buf.put_slice(&EPILOGUE);
        }
        MsdpValue::Var(var) => {
            buf.put_slice(&PROLOGUE);
            put_pair(&mut buf, &var.name, &var.value);
            buf.put_slice(&EPILOGUE);
        }
    }
    buf.freeze()
}

/// 將配對列表編碼為一個框架
pub fn encode_frame(vars: &[MsdpVar]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&PROLOGUE);
    for var in vars {
        put_pair(&mut buf, &var.name, &var.value);
    }
    buf.put_slice(&EPILOGUE);
    buf.freeze()
}

/// 解碼一個完整框架
pub fn decode(frame: &[u8]) -> Result<Vec<MsdpVar>, MsdpError> {
    if !frame.starts_with(&PROLOGUE) {
        return Err(MsdpError::MissingPrologue);
    }

    let mut reader = Reader {
        data: frame,
        pos: PROLOGUE.len(),
    };
    let mut vars = Vec::new();

    while reader.peek() == Some(MSDP_VAR) {
        reader.pos += 1;
        let name = reader.read_name()?;
        let value = reader.read_value()?;
        vars.push(MsdpVar { name, value });
    }

    if &frame[reader.pos..] != EPILOGUE.as_slice() {
        return Err(MsdpError::MissingEpilogue);
    }

    Ok(vars)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), MsdpError> {
        if self.peek() != Some(byte) {
            return Err(MsdpError::Format {
                offset: self.pos,
                expected,
            });
        }
        self.pos += 1;
        Ok(())
    }

    /// 讀取名稱直到 VAL，並跳過 VAL
    fn read_name(&mut self) -> Result<String, MsdpError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == MSDP_VAL {
                let name = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(name);
            }
            self.pos += 1;
        }
        Err(MsdpError::Format {
            offset: self.pos,
            expected: "MSDP_VAL",
        })
    }

    fn read_value(&mut self) -> Result<MsdpValue, MsdpError> {
        match self.peek() {
            Some(MSDP_TABLE_OPEN) => {
                self.pos += 1;
                let table = self.read_table()?;
                self.expect(MSDP_TABLE_CLOSE, "MSDP_TABLE_CLOSE")?;
                Ok(MsdpValue::Table(table))
            }
            Some(MSDP_ARRAY_OPEN) => {
                self.pos += 1;
                let items = self.read_array()?;
                self.expect(MSDP_ARRAY_CLOSE, "MSDP_ARRAY_CLOSE")?;
                Ok(MsdpValue::Array(items))
            }
            _ => Ok(MsdpValue::Scalar(self.read_scalar())),
        }
    }

    fn read_table(&mut self) -> Result<BTreeMap<String, MsdpValue>, MsdpError> {
        let mut table = BTreeMap::new();
        while let Some(b) = self.peek() {
            if b == MSDP_TABLE_CLOSE {
                break;
            }
            self.expect(MSDP_VAR, "MSDP_VAR")?;
            let key = self.read_name()?;
            let value = self.read_value()?;
            table.insert(key, value);
        }
        Ok(table)
    }

    fn read_array(&mut self) -> Result<Vec<MsdpValue>, MsdpError> {
        let mut items = Vec::new();
        while let Some(b) = self.peek() {
            if b == MSDP_ARRAY_CLOSE {
                break;
            }
            self.expect(MSDP_VAL, "MSDP_VAL")?;
            items.push(self.read_value()?);
        }
        Ok(items)
    }

    /// 讀取純量直到標記位元組或未轉義的 IAC
    fn read_scalar(&mut self) -> Vec<u8> {
        let mut scalar = Vec::new();
        while let Some(b) = self.peek() {
            if b <= MSDP_ARRAY_CLOSE {
                break;
            }
            if b == IAC {
                if self.data.get(self.pos + 1) == Some(&IAC) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            scalar.push(b);
            self.pos += 1;
        }
        scalar
    }
}
