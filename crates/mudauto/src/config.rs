//! 引擎設定
//!
//! 以 JSON 儲存，所有欄位皆有預設值，缺少的欄位會自動補上。

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 設定檔錯誤
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("讀取設定檔失敗: {0}")]
    Io(#[from] io::Error),

    #[error("設定檔格式錯誤: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 引擎設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 命令前綴字元
    pub command_char: char,
    /// 命令分隔字元
    pub command_separator: char,
    /// `%a` 中用來取代命令分隔字元的字元
    pub separator_replacement: char,
    /// 動作的預設優先級
    pub default_priority: i32,
    /// 動作模組掛在 mud_filter 上的優先級
    pub action_hook_priority: i32,
    /// MSDP 模組掛在 telnet_option 上的優先級
    pub msdp_hook_priority: i32,
    /// 單一觸發器編譯後的大小上限（位元組）
    pub regex_size_limit: usize,
    /// 未結束的 sub-negotiation 最多暫存的位元組數，超過即捨棄
    pub max_subnegotiation_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_char: '#',
            command_separator: ';',
            separator_replacement: '_',
            default_priority: 5,
            action_hook_priority: 75,
            msdp_hook_priority: 50,
            regex_size_limit: 1 << 20,
            max_subnegotiation_len: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// 從 JSON 字串解析
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// 載入設定檔，檔案不存在時使用預設值
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// 儲存設定檔
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
