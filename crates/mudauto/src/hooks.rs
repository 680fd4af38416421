//! Hook（擴充點）分派模組
//!
//! 每個擴充點維護一份依優先級（數字小者先）排序的回呼列表，分兩種：
//! - [`FanoutHook`]: 依序呼叫所有回呼，任一回呼回傳 [`HookFlow::Stop`] 即中止本次分派
//! - [`FilterHook`]: 管線模式，每個回呼接收目前的值並回傳新值，交給下一個回呼
//!
//! 分派時會先取得列表快照，回呼內可以再分派其他擴充點，或註冊／移除回呼。

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::msdp::MsdpVar;
use crate::session::Session;
use crate::telnet::{TelnetCommand, TelnetOption};

/// 回呼的分派控制結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    /// 繼續呼叫後續回呼
    Continue,
    /// 已處理，停止本次分派
    Stop,
}

/// 註冊回呼後取得的識別碼，用於移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct HookEntry<F: ?Sized> {
    id: HookId,
    priority: i32,
    callback: Rc<F>,
}

/// 依優先級排序的回呼表
struct HookList<F: ?Sized> {
    name: &'static str,
    entries: RefCell<Vec<HookEntry<F>>>,
}

impl<F: ?Sized> HookList<F> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RefCell::new(Vec::new()),
        }
    }

    fn register(&self, callback: Rc<F>, priority: i32) -> HookId {
        let id = HookId::next();
        let mut entries = self.entries.borrow_mut();
        // 相同優先級維持註冊順序
        let pos = entries.partition_point(|e| e.priority <= priority);
        entries.insert(
            pos,
            HookEntry {
                id,
                priority,
                callback,
            },
        );
        debug!(hook = self.name, priority, "已註冊回呼");
        id
    }

    fn unregister(&self, id: HookId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before != entries.len()
    }

    fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries
            .borrow()
            .iter()
            .map(|e| Rc::clone(&e.callback))
            .collect()
    }

    fn priorities(&self) -> Vec<i32> {
        self.entries.borrow().iter().map(|e| e.priority).collect()
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

/// Fan-out 回呼型別
pub type FanoutFn<P> = dyn Fn(&Dispatcher, &mut Session, &mut P) -> HookFlow;

/// Filter 回呼型別
pub type FilterFn<T> = dyn Fn(&Dispatcher, &mut Session, T) -> T;

/// 可短路的廣播擴充點
pub struct FanoutHook<P: 'static> {
    list: HookList<FanoutFn<P>>,
}

impl<P: 'static> FanoutHook<P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            list: HookList::new(name),
        }
    }

    /// 擴充點名稱
    pub fn name(&self) -> &'static str {
        self.list.name
    }

    pub fn register<F>(&self, callback: F, priority: i32) -> HookId
    where
        F: Fn(&Dispatcher, &mut Session, &mut P) -> HookFlow + 'static,
    {
        let callback: Rc<FanoutFn<P>> = Rc::new(callback);
        self.list.register(callback, priority)
    }

    /// 移除回呼，不存在時回傳 false
    pub fn unregister(&self, id: HookId) -> bool {
        self.list.unregister(id)
    }

    /// 依優先級呼叫回呼；若有回呼要求停止則回傳 [`HookFlow::Stop`]
    pub fn dispatch(
        &self,
        dispatcher: &Dispatcher,
        session: &mut Session,
        payload: &mut P,
    ) -> HookFlow {
        for callback in self.list.snapshot() {
            if callback(dispatcher, session, payload) == HookFlow::Stop {
                debug!(hook = self.list.name, "分派已被回呼中止");
                return HookFlow::Stop;
            }
        }
        HookFlow::Continue
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: 'static> fmt::Debug for FanoutHook<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutHook")
            .field("name", &self.list.name)
            .field("priorities", &self.list.priorities())
            .finish()
    }
}

/// 轉換管線擴充點
pub struct FilterHook<T: 'static> {
    list: HookList<FilterFn<T>>,
}

impl<T: 'static> FilterHook<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            list: HookList::new(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.list.name
    }

    pub fn register<F>(&self, callback: F, priority: i32) -> HookId
    where
        F: Fn(&Dispatcher, &mut Session, T) -> T + 'static,
    {
        let callback: Rc<FilterFn<T>> = Rc::new(callback);
        self.list.register(callback, priority)
    }

    pub fn unregister(&self, id: HookId) -> bool {
        self.list.unregister(id)
    }

    /// 依序將值交給每個回呼，回傳最後的結果
    pub fn filter(&self, dispatcher: &Dispatcher, session: &mut Session, value: T) -> T {
        self.list
            .snapshot()
            .into_iter()
            .fold(value, |current, callback| {
                callback(dispatcher, session, current)
            })
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> fmt::Debug for FilterHook<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHook")
            .field("name", &self.list.name)
            .field("priorities", &self.list.priorities())
            .finish()
    }
}

/// Telnet 選項序列（`IAC WILL x`、`IAC SB x ... IAC SE` 等）
#[derive(Debug, Clone, PartialEq)]
pub struct TelnetOptionArgs {
    pub command: TelnetCommand,
    pub option: TelnetOption,
    /// 完整的原始序列位元組（含 IAC 前綴）
    pub data: Vec<u8>,
}

/// Session 變數變更通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableChange {
    pub name: String,
    /// `None` 代表變數被移除
    pub value: Option<String>,
}

/// 伺服器回報可訂閱的 MSDP 變數
///
/// 回呼將想要訂閱的名稱加入 `requested`。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportableVariables {
    pub available: Vec<String>,
    pub requested: Vec<String>,
}

/// 收到的 MSDP 資料
#[derive(Debug, Clone, PartialEq)]
pub struct MsdpData {
    pub vars: Vec<MsdpVar>,
}

/// 所有擴充點
#[derive(Debug)]
pub struct Dispatcher {
    /// Telnet 選項協商（各協定模組認領自己的選項）
    pub telnet_option: FanoutHook<TelnetOptionArgs>,
    /// MUD 傳來的每一行文字
    pub mud_filter: FilterHook<String>,
    pub variable_change: FanoutHook<VariableChange>,
    pub msdp_reportable_variables: FanoutHook<ReportableVariables>,
    pub msdp_data: FanoutHook<MsdpData>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            telnet_option: FanoutHook::new("telnet_option"),
            mud_filter: FilterHook::new("mud_filter"),
            variable_change: FanoutHook::new("variable_change"),
            msdp_reportable_variables: FanoutHook::new("msdp_reportable_variables"),
            msdp_data: FanoutHook::new("msdp_data"),
        }
    }

    pub fn dispatch_telnet_option(
        &self,
        session: &mut Session,
        args: &mut TelnetOptionArgs,
    ) -> HookFlow {
        self.telnet_option.dispatch(self, session, args)
    }

    pub fn filter_mud_line(&self, session: &mut Session, line: String) -> String {
        self.mud_filter.filter(self, session, line)
    }

    pub fn notify_variable_change(&self, session: &mut Session, change: &mut VariableChange) {
        self.variable_change.dispatch(self, session, change);
    }

    pub fn publish_reportable_variables(
        &self,
        session: &mut Session,
        args: &mut ReportableVariables,
    ) {
        self.msdp_reportable_variables.dispatch(self, session, args);
    }

    pub fn publish_msdp_data(&self, session: &mut Session, data: &mut MsdpData) {
        self.msdp_data.dispatch(self, session, data);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
