//! Session 模組
//!
//! 每個 Session 代表一個獨立的 MUD 連線，擁有：
//! - 獨立的動作儲存區與變數表
//! - 獨立的 MSDP 協商狀態
//! - 送往伺服器的位元組佇列與送往命令層的命令出口
//!
//! SessionRegistry 管理所有 Session 的生命週期。

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::action::{ActionError, ActionReport, ActionSettings, ActionStore};
use crate::config::EngineConfig;
use crate::hooks::{Dispatcher, VariableChange};
use crate::msdp::{MsdpNegotiator, MsdpState};
use crate::variables::VariableTable;

// ============================================================================
// SessionId
// ============================================================================

/// Session 唯一識別碼
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// 產生新的 SessionId
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// 取得內部 ID 值
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// 命令出口
// ============================================================================

/// 送往命令層的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub session: SessionId,
    pub text: String,
    /// 由動作等內部來源產生（非使用者輸入）
    pub internal: bool,
}

impl SessionCommand {
    pub fn internal(session: SessionId, text: impl Into<String>) -> Self {
        Self {
            session,
            text: text.into(),
            internal: true,
        }
    }

    pub fn user(session: SessionId, text: impl Into<String>) -> Self {
        Self {
            session,
            text: text.into(),
            internal: false,
        }
    }
}

/// 命令送出錯誤
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("命令佇列已關閉")]
    Closed,

    #[error("命令被拒絕: {0}")]
    Rejected(String),
}

/// 命令出口
///
/// 送出後立即返回，不保證命令已被執行。
pub trait CommandSink {
    fn submit(&mut self, command: SessionCommand) -> Result<(), SubmitError>;
}

impl CommandSink for mpsc::UnboundedSender<SessionCommand> {
    fn submit(&mut self, command: SessionCommand) -> Result<(), SubmitError> {
        self.send(command).map_err(|_| SubmitError::Closed)
    }
}

impl CommandSink for mpsc::Sender<SessionCommand> {
    fn submit(&mut self, command: SessionCommand) -> Result<(), SubmitError> {
        self.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(cmd) => {
                SubmitError::Rejected(format!("佇列已滿，捨棄 {:?}", cmd.text))
            }
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

// ============================================================================
// Session
// ============================================================================

/// 單一連線的狀態
pub struct Session {
    id: SessionId,
    name: String,
    config: Rc<EngineConfig>,
    /// 動作儲存區
    pub actions: ActionStore,
    /// Session 變數
    pub variables: VariableTable,
    /// 暫停動作比對
    pub ignore_actions: bool,
    msdp: Option<MsdpNegotiator>,
    commands: Box<dyn CommandSink>,
    outbound: Vec<Bytes>,
    telnet_buffer: Vec<u8>,
    messages: Vec<String>,
}

impl Session {
    /// 以預設設定建立 Session
    pub fn new(name: impl Into<String>, sink: impl CommandSink + 'static) -> Self {
        let config = Rc::new(EngineConfig::default());
        Self {
            id: SessionId::new(),
            name: name.into(),
            actions: ActionStore::new(ActionSettings::from(config.as_ref())),
            config,
            variables: VariableTable::new(),
            ignore_actions: false,
            msdp: None,
            commands: Box::new(sink),
            outbound: Vec::new(),
            telnet_buffer: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// 套用設定（會重建空的動作儲存區，需在新增動作前呼叫）
    pub fn with_config(mut self, config: Rc<EngineConfig>) -> Self {
        self.actions = ActionStore::new(ActionSettings::from(config.as_ref()));
        self.config = config;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---------- 動作 ----------

    /// 新增動作，觸發器中的 session 變數會先展開
    pub fn add_action(
        &mut self,
        trigger: impl Into<String>,
        response: impl Into<String>,
        priority: i32,
        onetime: bool,
    ) -> Result<(), ActionError> {
        self.actions
            .add_action(trigger, response, priority, onetime, &self.variables)
    }

    pub fn remove_actions(&mut self, selector: &str) -> Vec<(String, String)> {
        self.actions.remove_actions(selector)
    }

    pub fn clear_actions(&mut self) {
        self.actions.clear();
    }

    /// 以目前變數重新編譯所有觸發器
    pub fn recompile_actions(&mut self) -> usize {
        self.actions.recompile(&self.variables)
    }

    /// 比對一行 MUD 文字，失敗訊息會加入 session 訊息
    pub fn check_actions(&mut self, line: &str) -> ActionReport {
        let report = self.actions.check_actions(
            line,
            &self.variables,
            &mut *self.commands,
            self.id,
        );

        for message in &report.errors {
            error!(session = %self.id, "{}", message);
            self.messages.push(message.clone());
        }
        report
    }

    // ---------- 變數 ----------

    /// 設定變數並發出 `variable_change` 通知
    pub fn set_variable(
        &mut self,
        dispatcher: &Dispatcher,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let name = name.into();
        let value = value.into();
        self.variables.set(name.clone(), value.clone());
        dispatcher.notify_variable_change(
            self,
            &mut VariableChange {
                name,
                value: Some(value),
            },
        );
    }

    /// 移除變數，變數存在時發出 `variable_change` 通知
    pub fn unset_variable(&mut self, dispatcher: &Dispatcher, name: &str) -> Option<String> {
        let old = self.variables.remove(name)?;
        dispatcher.notify_variable_change(
            self,
            &mut VariableChange {
                name: name.to_string(),
                value: None,
            },
        );
        Some(old)
    }

    // ---------- 輸出 ----------

    /// 送出命令到命令層
    pub fn submit_command(&mut self, text: impl Into<String>) -> Result<(), SubmitError> {
        let command = SessionCommand::user(self.id, text);
        self.commands.submit(command)
    }

    /// 排入送往伺服器的原始位元組
    pub fn send_raw(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if !data.is_empty() {
            self.outbound.push(data);
        }
    }

    /// 取出所有待送位元組
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    /// 加入顯示給使用者的系統訊息
    pub fn system_message(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }

    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    // ---------- Telnet / MSDP ----------

    pub(crate) fn take_telnet_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.telnet_buffer)
    }

    pub(crate) fn restore_telnet_buffer(&mut self, buffer: Vec<u8>) {
        self.telnet_buffer = buffer;
    }

    /// 目前的 MSDP 協商狀態（尚未偵測到 MSDP 時為 Idle）
    pub fn msdp_state(&self) -> MsdpState {
        self.msdp
            .as_ref()
            .map_or(MsdpState::Idle, MsdpNegotiator::state)
    }

    pub fn msdp(&self) -> Option<&MsdpNegotiator> {
        self.msdp.as_ref()
    }

    /// 取得 MSDP 協商器，第一次使用時建立
    pub(crate) fn msdp_mut(&mut self) -> &mut MsdpNegotiator {
        self.msdp.get_or_insert_with(MsdpNegotiator::new)
    }

    pub(crate) fn drop_msdp(&mut self) {
        self.msdp = None;
    }

    /// 連線結束：丟棄協商狀態與未完成的 Telnet 序列
    pub fn teardown(&mut self) {
        self.msdp = None;
        self.telnet_buffer.clear();
        self.outbound.clear();
        info!(session = %self.id, name = %self.name, "Session 連線結束");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("actions", &self.actions.count())
            .field("variables", &self.variables.len())
            .field("ignore_actions", &self.ignore_actions)
            .field("msdp", &self.msdp_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Session 管理器
///
/// 以 id 操作動作時，不存在的 session 一律視為空的 session。
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    config: Rc<EngineConfig>,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            config: Rc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 建立新的 Session
    pub fn create(
        &mut self,
        name: impl Into<String>,
        sink: impl CommandSink + 'static,
    ) -> SessionId {
        let session = Session::new(name, sink).with_config(Rc::clone(&self.config));
        let id = session.id();
        info!(session = %id, name = session.name(), "建立 Session");
        self.sessions.insert(id, session);
        id
    }

    /// 以既有 Session 為基礎建立新 Session
    ///
    /// 複製變數，並對每個動作重新執行新增（各自編譯，不共用）。
    pub fn derive(
        &mut self,
        base: SessionId,
        name: impl Into<String>,
        sink: impl CommandSink + 'static,
    ) -> SessionId {
        let id = self.create(name, sink);

        let Some(base_session) = self.sessions.get(&base) else {
            return id;
        };
        let variables = base_session.variables.clone();
        let actions: Vec<(String, String, i32, bool)> = base_session
            .actions
            .sorted()
            .into_iter()
            .map(|a| {
                (
                    a.trigger().to_string(),
                    a.response().to_string(),
                    a.priority(),
                    a.onetime(),
                )
            })
            .collect();

        if let Some(session) = self.sessions.get_mut(&id) {
            session.variables = variables;
            for (trigger, response, priority, onetime) in actions {
                if let Err(e) = session.add_action(trigger, response, priority, onetime) {
                    warn!(session = %id, error = %e, "複製動作失敗");
                }
            }
        }
        id
    }

    /// 移除 Session（會先結束連線狀態）
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.teardown();
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// 所有 Session id（已排序）
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ---------- 以 id 操作動作 ----------

    /// 新增動作；session 不存在時回傳 `Ok(false)`
    pub fn add_action(
        &mut self,
        id: SessionId,
        trigger: impl Into<String>,
        response: impl Into<String>,
        priority: i32,
        onetime: bool,
    ) -> Result<bool, ActionError> {
        match self.sessions.get_mut(&id) {
            Some(session) => session
                .add_action(trigger, response, priority, onetime)
                .map(|_| true),
            None => Ok(false),
        }
    }

    pub fn remove_actions(&mut self, id: SessionId, selector: &str) -> Vec<(String, String)> {
        self.sessions
            .get_mut(&id)
            .map(|s| s.remove_actions(selector))
            .unwrap_or_default()
    }

    pub fn clear_actions(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.clear_actions();
        }
    }

    pub fn recompile_actions(&mut self, id: SessionId) -> usize {
        self.sessions
            .get_mut(&id)
            .map_or(0, Session::recompile_actions)
    }

    pub fn check_actions(&mut self, id: SessionId, line: &str) -> ActionReport {
        self.sessions
            .get_mut(&id)
            .map(|s| s.check_actions(line))
            .unwrap_or_default()
    }

    pub fn action_triggers(&self, id: SessionId) -> Vec<String> {
        self.get(id).map(|s| s.actions.triggers()).unwrap_or_default()
    }

    pub fn action_info(&self, id: SessionId, selector: &str) -> String {
        self.get(id)
            .map(|s| s.actions.info(selector))
            .unwrap_or_default()
    }

    pub fn action_status(&self, id: SessionId) -> String {
        self.get(id)
            .map_or_else(|| "0 action(s).".to_string(), |s| s.actions.status())
    }

    pub fn action_count(&self, id: SessionId) -> usize {
        self.get(id).map_or(0, |s| s.actions.count())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action;
    use tokio_test::assert_ok;

    fn channel() -> (
        mpsc::UnboundedSender<SessionCommand>,
        mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_session_id_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_check_actions_submits_internal_command() {
        let (tx, mut rx) = channel();
        let mut session = Session::new("test", tx);
        assert_ok!(session.add_action("hungry", "eat bread", 5, false));

        session.check_actions("You are hungry");
        let cmd = rx.try_recv().unwrap();
        assert_eq!(cmd.session, session.id());
        assert_eq!(cmd.text, "eat bread");
        assert!(cmd.internal);
    }

    #[test]
    fn test_submit_failure_becomes_message() {
        let (tx, rx) = channel();
        drop(rx);
        let mut session = Session::new("test", tx);
        session.add_action("x", "y", 5, false).unwrap();

        let report = session.check_actions("x");
        assert_eq!(report.errors.len(), 1);
        assert_eq!(session.take_messages().len(), 1);
    }

    #[test]
    fn test_bounded_sink_full() {
        let (tx, _rx) = mpsc::channel::<SessionCommand>(1);
        let mut session = Session::new("bounded", tx);
        assert_ok!(session.submit_command("one"));
        assert!(matches!(
            session.submit_command("two"),
            Err(SubmitError::Rejected(_))
        ));
    }

    #[test]
    fn test_set_variable_recompiles_through_dispatcher() {
        let dispatcher = Dispatcher::new();
        let module = action::load(&dispatcher, &EngineConfig::default());
        let (tx, mut rx) = channel();
        let mut session = Session::new("test", tx);

        session.set_variable(&dispatcher, "target", "kobold");
        session.add_action("$target arrives", "kill %a", 5, false).unwrap();
        session.set_variable(&dispatcher, "target", "orc");

        let line = dispatcher.filter_mud_line(&mut session, "orc arrives".to_string());
        assert_eq!(line, "orc arrives");
        assert_eq!(rx.try_recv().unwrap().text, "kill orc arrives");

        module.unload(&dispatcher);
        assert!(dispatcher.mud_filter.is_empty());
        assert!(dispatcher.variable_change.is_empty());
    }

    #[test]
    fn test_ignore_actions() {
        let dispatcher = Dispatcher::new();
        let _module = action::load(&dispatcher, &EngineConfig::default());
        let (tx, mut rx) = channel();
        let mut session = Session::new("test", tx);
        session.add_action("hello", "wave", 5, false).unwrap();

        session.ignore_actions = true;
        dispatcher.filter_mud_line(&mut session, "hello".to_string());
        assert!(rx.try_recv().is_err());

        session.ignore_actions = false;
        dispatcher.filter_mud_line(&mut session, "hello".to_string());
        assert_eq!(rx.try_recv().unwrap().text, "wave");
    }

    #[test]
    fn test_registry_unknown_session_is_noop() {
        let mut registry = SessionRegistry::default();
        let ghost = SessionId::new();

        assert_eq!(registry.add_action(ghost, "a", "b", 5, false).unwrap(), false);
        assert!(registry.remove_actions(ghost, "*").is_empty());
        assert_eq!(registry.check_actions(ghost, "a"), ActionReport::default());
        assert_eq!(registry.action_status(ghost), "0 action(s).");
        assert_eq!(registry.action_count(ghost), 0);
        assert_eq!(registry.action_info(ghost, ""), "");
        assert_eq!(registry.recompile_actions(ghost), 0);
        registry.clear_actions(ghost);
        assert!(registry.remove(ghost).is_none());
    }

    #[test]
    fn test_registry_derive_copies_actions() {
        let mut registry = SessionRegistry::default();
        let (tx, _rx) = channel();
        let base = registry.create("base", tx);
        registry.get_mut(base).unwrap().variables.set("food", "bread");
        registry.add_action(base, "hungry", "eat $food", 2, true).unwrap();
        registry.add_action(base, "thirsty", "drink", 5, false).unwrap();

        let (tx2, mut rx2) = channel();
        let derived = registry.derive(base, "copy", tx2);
        assert_eq!(registry.action_count(derived), 2);
        assert_eq!(registry.action_info(derived, ""), registry.action_info(base, ""));
        assert_eq!(
            registry.get(derived).unwrap().variables.get("food"),
            Some("bread")
        );

        // 各自獨立：衍生 session 觸發一次性動作不影響原本的
        registry.check_actions(derived, "hungry");
        assert_eq!(rx2.try_recv().unwrap().session, derived);
        assert_eq!(registry.action_count(derived), 1);
        assert_eq!(registry.action_count(base), 2);
    }

    #[test]
    fn test_registry_remove_tears_down() {
        let mut registry = SessionRegistry::default();
        let (tx, _rx) = channel();
        let id = registry.create("gone", tx);
        registry.get_mut(id).unwrap().msdp_mut();
        assert_eq!(registry.ids(), vec![id]);

        let session = registry.remove(id).unwrap();
        assert!(session.msdp().is_none());
        assert!(registry.is_empty());
    }
}
