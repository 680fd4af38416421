//! MSDP (MUD Server Data Protocol) 模組
//!
//! 掛在 `telnet_option` 擴充點上認領選項 69 的所有序列，
//! 完成協商後將伺服器資料發佈到 `msdp_data`。
//!
//! 其他模組可在 `msdp_reportable_variables` 將想訂閱的變數名稱加入
//! `requested`，或監聽 `msdp_data` 取得解碼後的資料。

pub mod codec;
pub mod negotiation;

pub use codec::{decode, encode, encode_frame, MsdpError, MsdpValue, MsdpVar};
pub use negotiation::{list_request, report_request, FrameOutcome, MsdpNegotiator, MsdpState};

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::hooks::{
    Dispatcher, HookFlow, HookId, MsdpData, ReportableVariables, TelnetOptionArgs,
};
use crate::session::Session;
use crate::telnet::{generate_refusal, TelnetCommand, TelnetOption};

/// MSDP 模組在 [`Dispatcher`] 上的註冊
#[derive(Debug)]
pub struct MsdpModule {
    telnet_option: HookId,
}

/// 啟用 MSDP 支援
pub fn load(dispatcher: &Dispatcher, config: &EngineConfig) -> MsdpModule {
    let telnet_option = dispatcher
        .telnet_option
        .register(handle_telnet_option, config.msdp_hook_priority);
    info!("MSDP 模組已載入");
    MsdpModule { telnet_option }
}

impl MsdpModule {
    pub fn unload(self, dispatcher: &Dispatcher) {
        dispatcher.telnet_option.unregister(self.telnet_option);
        info!("MSDP 模組已卸載");
    }
}

fn handle_telnet_option(
    dispatcher: &Dispatcher,
    session: &mut Session,
    args: &mut TelnetOptionArgs,
) -> HookFlow {
    if args.option != TelnetOption::Msdp {
        return HookFlow::Continue;
    }

    match args.command {
        TelnetCommand::Will => {
            for request in session.msdp_mut().on_will() {
                session.send_raw(request);
            }
        }
        TelnetCommand::Wont => session.drop_msdp(),
        TelnetCommand::Do | TelnetCommand::Dont => {
            session.send_raw(generate_refusal(args.command, args.option));
        }
        TelnetCommand::Sb => handle_frame(dispatcher, session, &args.data),
        _ => {}
    }

    HookFlow::Stop
}

fn handle_frame(dispatcher: &Dispatcher, session: &mut Session, frame: &[u8]) {
    let outcome = match session.msdp_mut().on_frame(frame) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(session = %session.id(), error = %e, len = frame.len(), "MSDP 框架解碼失敗");
            session.system_message(&format!("msdp: 無法解碼 MSDP 框架: {}", e));
            return;
        }
    };

    // 每個解碼成功的框架都會發佈，協商步驟也不例外
    let vars = match outcome {
        FrameOutcome::Request { request, vars } => {
            session.send_raw(request);
            vars
        }
        FrameOutcome::Reportable { available, vars } => {
            let mut args = ReportableVariables {
                available,
                requested: Vec::new(),
            };
            dispatcher.publish_reportable_variables(session, &mut args);

            info!(requested = ?args.requested, "訂閱 MSDP 變數");
            for name in &args.requested {
                session.send_raw(report_request(name));
            }
            vars
        }
        FrameOutcome::Data(vars) => vars,
    };
    dispatcher.publish_msdp_data(session, &mut MsdpData { vars });
}
