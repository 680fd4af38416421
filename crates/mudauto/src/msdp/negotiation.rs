//! MSDP 協商狀態機
//!
//! 協商流程：
//! 1. 伺服器 `WILL MSDP` → 回覆 `DO MSDP` 並送出 `LIST COMMANDS`
//! 2. `COMMANDS` 含有 `REPORT` → 送出 `LIST REPORTABLE_VARIABLES`
//! 3. 收到 `REPORTABLE_VARIABLES` → 由外部決定要訂閱的變數，逐一送出 `REPORT`
//! 4. 之後的框架皆為一般資料
//!
//! 狀態機本身不做 I/O，只回傳要送出的位元組或要發佈的內容。

use bytes::Bytes;
use tracing::{debug, info};

use super::codec::{decode, encode_frame, MsdpError, MsdpVar};
use crate::telnet::{negotiation, TelnetCommand, TelnetOption};

/// 協商狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsdpState {
    #[default]
    Idle,
    /// 已回覆 DO，準備送出 LIST COMMANDS
    Announced,
    AwaitingCommands,
    AwaitingReportable,
    Subscribed,
}

/// 處理一個框架的結果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// 協商步驟：需送出此請求
    Request { request: Bytes, vars: Vec<MsdpVar> },
    /// 伺服器列出可回報的變數（已進入 Subscribed）
    Reportable {
        available: Vec<String>,
        vars: Vec<MsdpVar>,
    },
    /// 一般資料
    Data(Vec<MsdpVar>),
}

/// `LIST <what>` 請求框架
pub fn list_request(what: &str) -> Bytes {
    encode_frame(&[MsdpVar::new("LIST", what)])
}

/// `REPORT <name>` 請求框架
pub fn report_request(name: &str) -> Bytes {
    encode_frame(&[MsdpVar::new("REPORT", name)])
}

/// 單一連線的 MSDP 協商器
#[derive(Debug, Clone, Default)]
pub struct MsdpNegotiator {
    state: MsdpState,
}

impl MsdpNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MsdpState {
        self.state
    }

    /// 伺服器宣告支援 MSDP；任何狀態下都會重新開始協商
    pub fn on_will(&mut self) -> Vec<Bytes> {
        if self.state != MsdpState::Idle {
            info!(from = ?self.state, "伺服器重新宣告 MSDP，重新協商");
        }

        self.state = MsdpState::Announced;
        let mut out = vec![Bytes::from(negotiation(TelnetCommand::Do, TelnetOption::Msdp))];

        out.push(list_request("COMMANDS"));
        self.state = MsdpState::AwaitingCommands;
        info!("MSDP 協商開始，已請求命令列表");
        out
    }

    /// 伺服器停用 MSDP
    pub fn on_wont(&mut self) {
        info!(from = ?self.state, "伺服器停用 MSDP");
        self.state = MsdpState::Idle;
    }

    /// 處理一個完整的 SB 框架
    ///
    /// 解碼失敗時回傳錯誤，狀態不變。
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<FrameOutcome, MsdpError> {
        let vars = decode(frame)?;
        debug!(state = ?self.state, vars = vars.len(), "收到 MSDP 框架");

        let Some(first) = vars.first() else {
            return Ok(FrameOutcome::Data(vars));
        };

        match self.state {
            MsdpState::AwaitingCommands if first.name == "COMMANDS" => {
                if first.value.contains_token("REPORT") {
                    self.state = MsdpState::AwaitingReportable;
                    info!("伺服器支援 REPORT，請求可回報變數列表");
                    return Ok(FrameOutcome::Request {
                        request: list_request("REPORTABLE_VARIABLES"),
                        vars,
                    });
                }
                info!("伺服器不支援 REPORT，協商停在命令列表");
            }
            MsdpState::AwaitingReportable if first.name == "REPORTABLE_VARIABLES" => {
                self.state = MsdpState::Subscribed;
                let available = first.value.to_names();
                info!(count = available.len(), "MSDP 協商完成");
                return Ok(FrameOutcome::Reportable { available, vars });
            }
            _ => {}
        }

        Ok(FrameOutcome::Data(vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msdp::codec::{MsdpValue, EPILOGUE, PROLOGUE};
    use tokio_test::{assert_err, assert_ok};

    fn frame(vars: &[MsdpVar]) -> Vec<u8> {
        encode_frame(vars).to_vec()
    }

    fn subscribed() -> MsdpNegotiator {
        let mut negotiator = MsdpNegotiator::new();
        negotiator.on_will();
        negotiator
            .on_frame(&frame(&[MsdpVar::new(
                "COMMANDS",
                MsdpValue::array(["LIST", "REPORT", "SEND"]),
            )]))
            .unwrap();
        negotiator
            .on_frame(&frame(&[MsdpVar::new(
                "REPORTABLE_VARIABLES",
                MsdpValue::array(["HEALTH", "ROOM"]),
            )]))
            .unwrap();
        negotiator
    }

    #[test]
    fn test_will_starts_handshake() {
        let mut negotiator = MsdpNegotiator::new();
        let out = negotiator.on_will();

        assert_eq!(out[0].as_ref(), &[255, TelnetCommand::Do as u8, 69]);
        let mut expected = PROLOGUE.to_vec();
        expected.extend_from_slice(b"\x01LIST\x02COMMANDS");
        expected.extend_from_slice(&EPILOGUE);
        assert_eq!(out[1].as_ref(), expected.as_slice());
        assert_eq!(negotiator.state(), MsdpState::AwaitingCommands);
    }

    #[test]
    fn test_full_handshake() {
        let mut negotiator = MsdpNegotiator::new();
        negotiator.on_will();

        let commands = vec![MsdpVar::new(
            "COMMANDS",
            MsdpValue::array(["LIST", "REPORT", "SEND"]),
        )];
        let outcome = assert_ok!(negotiator.on_frame(&frame(&commands)));
        assert_eq!(
            outcome,
            FrameOutcome::Request {
                request: list_request("REPORTABLE_VARIABLES"),
                vars: commands,
            }
        );
        assert_eq!(negotiator.state(), MsdpState::AwaitingReportable);

        let reportable = vec![MsdpVar::new(
            "REPORTABLE_VARIABLES",
            MsdpValue::array(["HEALTH", "ROOM"]),
        )];
        let outcome = assert_ok!(negotiator.on_frame(&frame(&reportable)));
        assert_eq!(
            outcome,
            FrameOutcome::Reportable {
                available: vec!["HEALTH".to_string(), "ROOM".to_string()],
                vars: reportable,
            }
        );
        assert_eq!(negotiator.state(), MsdpState::Subscribed);
    }

    #[test]
    fn test_commands_as_scalar_list() {
        let mut negotiator = MsdpNegotiator::new();
        negotiator.on_will();
        negotiator
            .on_frame(&frame(&[MsdpVar::new("COMMANDS", "LIST REPORT SEND")]))
            .unwrap();
        assert_eq!(negotiator.state(), MsdpState::AwaitingReportable);
    }

    #[test]
    fn test_commands_without_report_stalls() {
        let mut negotiator = MsdpNegotiator::new();
        negotiator.on_will();

        let vars = vec![MsdpVar::new("COMMANDS", MsdpValue::array(["LIST", "SEND"]))];
        let outcome = negotiator.on_frame(&frame(&vars)).unwrap();
        assert_eq!(outcome, FrameOutcome::Data(vars));
        assert_eq!(negotiator.state(), MsdpState::AwaitingCommands);
    }

    #[test]
    fn test_subscribed_frames_are_data() {
        let mut negotiator = subscribed();
        let vars = vec![MsdpVar::new("HEALTH", "100")];
        assert_eq!(
            negotiator.on_frame(&frame(&vars)).unwrap(),
            FrameOutcome::Data(vars)
        );

        // 協商完成後再收到 COMMANDS 也只是資料
        let vars = vec![MsdpVar::new("COMMANDS", MsdpValue::array(["REPORT"]))];
        assert_eq!(
            negotiator.on_frame(&frame(&vars)).unwrap(),
            FrameOutcome::Data(vars)
        );
        assert_eq!(negotiator.state(), MsdpState::Subscribed);
    }

    #[test]
    fn test_missing_epilogue_keeps_state() {
        let mut negotiator = MsdpNegotiator::new();
        negotiator.on_will();

        let mut broken = frame(&[MsdpVar::new("COMMANDS", MsdpValue::array(["REPORT"]))]);
        broken.truncate(broken.len() - 2);
        let err = assert_err!(negotiator.on_frame(&broken));
        assert_eq!(err, MsdpError::MissingEpilogue);
        assert_eq!(negotiator.state(), MsdpState::AwaitingCommands);

        // 下一個正確的框架仍可推進
        negotiator
            .on_frame(&frame(&[MsdpVar::new("COMMANDS", MsdpValue::array(["REPORT"]))]))
            .unwrap();
        assert_eq!(negotiator.state(), MsdpState::AwaitingReportable);
    }

    #[test]
    fn test_will_restarts_and_wont_resets() {
        let mut negotiator = subscribed();
        negotiator.on_will();
        assert_eq!(negotiator.state(), MsdpState::AwaitingCommands);

        negotiator.on_wont();
        assert_eq!(negotiator.state(), MsdpState::Idle);
    }

    #[test]
    fn test_report_request() {
        let mut expected = PROLOGUE.to_vec();
        expected.extend_from_slice(b"\x01REPORT\x02HEALTH");
        expected.extend_from_slice(&EPILOGUE);
        assert_eq!(report_request("HEALTH").as_ref(), expected.as_slice());
    }
}
