//! MUD Automation Core
//!
//! 提供 MUD 客戶端的自動化與協定擴充核心：
//! - `hooks`: 擴充點分派器（依優先級串接、可中止）
//! - `action`: 動作（觸發器）引擎
//! - `variables`: 變數展開
//! - `msdp`: MSDP 編解碼與協商
//! - `telnet`: Telnet 協定解析與選項路由
//! - `session`: 每個連線的狀態與管理
//! - `commands`: `#action` 等用戶端命令
//! - `config`: 引擎設定

pub mod action;
pub mod commands;
pub mod config;
pub mod hooks;
pub mod msdp;
pub mod session;
pub mod telnet;
pub mod variables;

pub use action::{Action, ActionError, ActionModule, ActionReport, ActionSettings, ActionStore};
pub use commands::CommandError;
pub use config::{ConfigError, EngineConfig};
pub use hooks::{Dispatcher, FanoutHook, FilterHook, HookFlow, HookId};
pub use msdp::{MsdpError, MsdpModule, MsdpNegotiator, MsdpState, MsdpValue, MsdpVar};
pub use session::{CommandSink, Session, SessionCommand, SessionId, SessionRegistry, SubmitError};
pub use telnet::route_incoming;
pub use variables::{ExpandError, VariableExpander, VariableTable};
