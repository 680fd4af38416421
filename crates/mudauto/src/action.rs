//! Action（動作）模組
//!
//! 比對 MUD 傳來的每一行文字，符合觸發器時將展開後的回應送出成為新命令。
//!
//! 觸發器語法：
//! - `%N` 捕獲任意字元、`%_N` 捕獲非空白字元（皆取最短，位於結尾時取到底）
//! - 開頭的 `^` 與結尾的 `$` 為行首／行尾錨點，其餘字元皆為字面
//! - `r[...]` 為正則表達式，`r[...]i` 額外忽略大小寫
//!
//! 觸發器文字中的 session 變數會先展開再編譯；變數變更時整批重新編譯。

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::commands::escape;
use crate::config::EngineConfig;
use crate::hooks::{Dispatcher, HookFlow, HookId};
use crate::session::{CommandSink, SessionCommand, SessionId, SubmitError};
use crate::variables::{ExpandError, VariableExpander};

/// 動作的預設優先級
pub const DEFAULT_PRIORITY: i32 = 5;

/// 代表整行文字的綁定變數（回應中寫作 `%a`）
pub const WHOLE_LINE_VAR: &str = "a";

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"%(_?)(\d+)").unwrap();
}

/// 動作錯誤
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("觸發器 {trigger:?} 編譯失敗: {source}")]
    Compile {
        trigger: String,
        #[source]
        source: regex::Error,
    },

    #[error("觸發器 {0:?} 的 r[ ] 分隔符號不成對")]
    UnbalancedRegex(String),

    #[error("觸發器變數展開失敗: {0}")]
    Expand(#[from] ExpandError),
}

/// 觸發後送出回應時的錯誤
#[derive(Debug, Error)]
enum FireError {
    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// 動作儲存區的設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSettings {
    pub command_char: char,
    pub separator: char,
    pub separator_replacement: char,
    pub regex_size_limit: usize,
}

impl From<&EngineConfig> for ActionSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            command_char: config.command_char,
            separator: config.command_separator,
            separator_replacement: config.separator_replacement,
            regex_size_limit: config.regex_size_limit,
        }
    }
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// 同一次展開所產生的文字與正則
#[derive(Debug, Clone)]
struct Matcher {
    expansion: String,
    regex: Regex,
}

/// 動作定義
#[derive(Debug, Clone)]
pub struct Action {
    trigger: String,
    matcher: Matcher,
    /// 依出現順序排列的 placeholder 名稱（由原始觸發器文字取得）
    placeholders: Vec<String>,
    response: String,
    priority: i32,
    onetime: bool,
}

impl Action {
    /// 原始（未展開）觸發器文字
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// 編譯時使用的展開後文字
    pub fn expansion(&self) -> &str {
        &self.matcher.expansion
    }

    /// 編譯後的正則
    pub fn pattern(&self) -> &str {
        self.matcher.regex.as_str()
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn onetime(&self) -> bool {
        self.onetime
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.matcher.regex.is_match(line)
    }

    /// 嘗試匹配，返回 placeholder 名稱到捕獲文字的對應
    pub fn bindings(&self, line: &str) -> Option<HashMap<String, String>> {
        let captures = self.matcher.regex.captures(line)?;
        let mut bindings = HashMap::with_capacity(self.placeholders.len() + 1);
        for (i, name) in self.placeholders.iter().enumerate() {
            let value = captures.get(i + 1).map_or("", |m| m.as_str());
            bindings.insert(name.clone(), value.to_string());
        }
        Some(bindings)
    }
}

/// 取出觸發器文字中依序出現的 placeholder 名稱（保留重複）
pub fn ordered_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| caps[2].to_string())
        .collect()
}

/// 解析 `r[...]` / `r[...]i`，回傳 (正則內容, 是否忽略大小寫)
fn explicit_pattern(text: &str) -> Result<Option<(&str, bool)>, ActionError> {
    let Some(rest) = text.strip_prefix("r[") else {
        return Ok(None);
    };
    if let Some(body) = rest.strip_suffix("]i").or_else(|| rest.strip_suffix("]I")) {
        return Ok(Some((body, true)));
    }
    if let Some(body) = rest.strip_suffix(']') {
        return Ok(Some((body, false)));
    }
    Err(ActionError::UnbalancedRegex(text.to_string()))
}

/// 將觸發器簡寫轉成正則
fn shorthand_to_regex(text: &str) -> String {
    let (start_anchor, body) = match text.strip_prefix('^') {
        Some(rest) => ("^", rest),
        None => ("", text),
    };
    let (body, end_anchor) = match body.strip_suffix('$') {
        Some(rest) => (rest, "$"),
        None => (body, ""),
    };

    let mut pattern = String::from(start_anchor);
    let mut last = 0;
    for m in PLACEHOLDER_RE.find_iter(body) {
        pattern.push_str(&regex::escape(&body[last..m.start()]));
        let word = m.as_str().starts_with("%_");
        let trailing = m.end() == body.len();
        pattern.push_str(match (word, trailing) {
            (true, false) => r"(\S+?)",
            (true, true) => r"(\S+)",
            (false, false) => "(.+?)",
            (false, true) => "(.+)",
        });
        last = m.end();
    }
    pattern.push_str(&regex::escape(&body[last..]));
    pattern.push_str(end_anchor);
    pattern
}

/// 編譯（已展開變數的）觸發器文字
pub fn compile_trigger(text: &str, size_limit: usize) -> Result<Regex, ActionError> {
    let (pattern, ignore_case) = match explicit_pattern(text)? {
        Some((body, ignore_case)) => {
            let pattern = PLACEHOLDER_RE.replace_all(body, |caps: &regex::Captures| {
                if caps[1].is_empty() {
                    "(.+?)"
                } else {
                    r"(\S+?)"
                }
            });
            (pattern.into_owned(), ignore_case)
        }
        None => (shorthand_to_regex(text), false),
    };

    RegexBuilder::new(&pattern)
        .case_insensitive(ignore_case)
        .size_limit(size_limit)
        .build()
        .map_err(|source| ActionError::Compile {
            trigger: text.to_string(),
            source,
        })
}

fn compile_matcher(
    trigger: &str,
    expander: &dyn VariableExpander,
    size_limit: usize,
) -> Result<Matcher, ActionError> {
    let expansion = expander.expand_session_vars(trigger)?;
    let expansion = if expansion.is_empty() {
        trigger.to_string()
    } else {
        expansion
    };
    let regex = compile_trigger(&expansion, size_limit)?;
    Ok(Matcher { expansion, regex })
}

/// 將 glob 選擇器（`*`、`?`）轉為正則
pub fn glob_to_regex(selector: &str) -> Option<Regex> {
    let mut pattern = String::from("(?s)^");
    for c in selector.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            _ => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// 以選擇器挑出觸發器文字（已排序）；空選擇器不選任何項目
fn select<'a>(selector: &str, keys: impl Iterator<Item = &'a String>) -> Vec<String> {
    if selector.is_empty() {
        return Vec::new();
    }

    let mut selected: Vec<String> = if selector.contains(['*', '?']) {
        match glob_to_regex(selector) {
            Some(re) => keys.filter(|k| re.is_match(k)).cloned().collect(),
            None => Vec::new(),
        }
    } else {
        keys.filter(|k| k.as_str() == selector).cloned().collect()
    };
    selected.sort();
    selected
}

/// 一次比對的結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionReport {
    /// 已觸發的觸發器（依執行順序）
    pub fired: Vec<String>,
    /// 回應展開或送出失敗的訊息
    pub errors: Vec<String>,
}

/// 單一 session 的動作儲存區
#[derive(Debug, Clone, Default)]
pub struct ActionStore {
    actions: HashMap<String, Action>,
    settings: ActionSettings,
}

impl ActionStore {
    pub fn new(settings: ActionSettings) -> Self {
        Self {
            actions: HashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> ActionSettings {
        self.settings
    }

    /// 新增或覆蓋動作；編譯失敗時不改變儲存區
    pub fn add_action(
        &mut self,
        trigger: impl Into<String>,
        response: impl Into<String>,
        priority: i32,
        onetime: bool,
        expander: &dyn VariableExpander,
    ) -> Result<(), ActionError> {
        let trigger = trigger.into();
        let matcher = compile_matcher(&trigger, expander, self.settings.regex_size_limit)?;
        let placeholders = ordered_placeholders(&trigger);

        debug!(
            trigger = %trigger,
            pattern = matcher.regex.as_str(),
            priority,
            onetime,
            "已新增動作"
        );

        self.actions.insert(
            trigger.clone(),
            Action {
                trigger,
                matcher,
                placeholders,
                response: response.into(),
                priority,
                onetime,
            },
        );
        Ok(())
    }

    /// 以目前的變數重新編譯所有觸發器，回傳成功的數量
    ///
    /// 個別觸發器失敗時保留舊的編譯結果並繼續。
    pub fn recompile(&mut self, expander: &dyn VariableExpander) -> usize {
        let size_limit = self.settings.regex_size_limit;
        let mut recompiled = 0;

        for action in self.actions.values_mut() {
            match compile_matcher(&action.trigger, expander, size_limit) {
                Ok(matcher) => {
                    action.matcher = matcher;
                    recompiled += 1;
                }
                Err(e) => {
                    warn!(trigger = %action.trigger, error = %e, "重新編譯失敗，保留原本的觸發器");
                }
            }
        }

        recompiled
    }

    /// 移除符合選擇器的動作，回傳 (觸發器, 回應) 列表
    pub fn remove_actions(&mut self, selector: &str) -> Vec<(String, String)> {
        select(selector, self.actions.keys())
            .into_iter()
            .filter_map(|key| self.actions.remove(&key))
            .map(|action| (action.trigger, action.response))
            .collect()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn get(&self, trigger: &str) -> Option<&Action> {
        self.actions.get(trigger)
    }

    /// 所有觸發器文字（已排序）
    pub fn triggers(&self) -> Vec<String> {
        let mut triggers: Vec<String> = self.actions.keys().cloned().collect();
        triggers.sort();
        triggers
    }

    /// 依 (優先級, 觸發器文字) 排序的動作
    pub fn sorted(&self) -> Vec<&Action> {
        let mut list: Vec<&Action> = self.actions.values().collect();
        list.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.trigger.cmp(&b.trigger))
        });
        list
    }

    /// 檢查一行文字並觸發所有符合的動作
    ///
    /// 以呼叫當下的快照依優先級比對；一次性動作觸發後立即從儲存區移除，
    /// 不影響同一輪中其他動作的比對。
    pub fn check_actions(
        &mut self,
        line: &str,
        expander: &dyn VariableExpander,
        sink: &mut dyn CommandSink,
        session: SessionId,
    ) -> ActionReport {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let snapshot: Vec<Action> = self.sorted().into_iter().cloned().collect();
        let whole_line = line.replace(
            self.settings.separator,
            self.settings.separator_replacement.encode_utf8(&mut [0; 4]),
        );
        let mut report = ActionReport::default();

        for action in snapshot {
            let Some(mut bindings) = action.bindings(line) else {
                continue;
            };
            bindings.insert(WHOLE_LINE_VAR.to_string(), whole_line.clone());

            match fire(&action, &bindings, expander, sink, session) {
                Ok(command) => {
                    debug!(trigger = %action.trigger, command = %command, "動作已觸發");
                    report.fired.push(action.trigger.clone());
                }
                Err(e) => {
                    warn!(trigger = %action.trigger, error = %e, "動作回應失敗");
                    report
                        .errors
                        .push(format!("action: {{{}}} 回應失敗: {}", action.trigger, e));
                }
            }

            if action.onetime {
                self.actions.remove(&action.trigger);
            }
        }

        report
    }

    /// 以設定檔格式列出動作（依觸發器排序）；選擇器為空時列出全部
    pub fn info(&self, selector: &str) -> String {
        let listing = if selector.is_empty() {
            self.triggers()
        } else {
            select(selector, self.actions.keys())
        };

        listing
            .iter()
            .filter_map(|key| self.actions.get(key))
            .map(|action| self.format_action(action))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn format_action(&self, action: &Action) -> String {
        format!(
            "{}action {{{}}} {{{}}} priority={{{}}} onetime={{{}}}",
            self.settings.command_char,
            escape(&action.trigger),
            escape(&action.response),
            action.priority,
            action.onetime
        )
    }

    /// 產生可重新載入的設定內容；`quiet` 時每行加上 ` quiet={true}`
    pub fn persist(&self, quiet: bool) -> String {
        let data = self.info("");
        if data.is_empty() {
            return data;
        }

        let mut out = String::with_capacity(data.len() + 16);
        for line in data.lines() {
            out.push_str(line);
            if quiet {
                out.push_str(" quiet={true}");
            }
            out.push('\n');
        }
        out
    }

    pub fn status(&self) -> String {
        format!("{} action(s).", self.actions.len())
    }

    pub fn count(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn fire(
    action: &Action,
    bindings: &HashMap<String, String>,
    expander: &dyn VariableExpander,
    sink: &mut dyn CommandSink,
    session: SessionId,
) -> Result<String, FireError> {
    let command = expander.expand_vars(&action.response, bindings)?;
    sink.submit(SessionCommand::internal(session, command.clone()))?;
    Ok(command)
}

/// 動作模組在 [`Dispatcher`] 上的註冊
#[derive(Debug)]
pub struct ActionModule {
    filter: HookId,
    variable_change: HookId,
}

/// 啟用動作模組：檢查 MUD 文字，並在變數變更時重新編譯
pub fn load(dispatcher: &Dispatcher, config: &EngineConfig) -> ActionModule {
    let filter = dispatcher.mud_filter.register(
        |_, session, line| {
            if !session.ignore_actions {
                session.check_actions(&line);
            }
            line
        },
        config.action_hook_priority,
    );

    let variable_change = dispatcher.variable_change.register(
        |_, session, change| {
            debug!(variable = %change.name, "變數變更，重新編譯觸發器");
            session.recompile_actions();
            HookFlow::Continue
        },
        config.action_hook_priority,
    );

    info!("動作模組已載入");
    ActionModule {
        filter,
        variable_change,
    }
}

impl ActionModule {
    pub fn unload(self, dispatcher: &Dispatcher) {
        dispatcher.mud_filter.unregister(self.filter);
        dispatcher.variable_change.unregister(self.variable_change);
        info!("動作模組已卸載");
    }
}
