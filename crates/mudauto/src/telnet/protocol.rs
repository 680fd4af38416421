//! Telnet 協定常數和解析
//!
//! 實作 RFC 854 Telnet 協定的基本命令，以及選項序列的切割

/// Telnet IAC (Interpret As Command) - 0xFF
pub const IAC: u8 = 255;

/// 協商相關的 Telnet 命令；其餘命令在解析時直接略過
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TelnetCommand {
    Se = 240,
    Sb = 250,
    Will = 251,
    Wont = 252,
    Do = 253,
    Dont = 254,
}

impl TelnetCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            240 => Self::Se,
            250 => Self::Sb,
            251 => Self::Will,
            252 => Self::Wont,
            253 => Self::Do,
            254 => Self::Dont,
            _ => return None,
        })
    }
}

/// 引擎認得的 Telnet 選項
///
/// ECHO 與 SGA 會被接受，MSDP 由 [`crate::msdp`] 處理，其他選項一律拒絕。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetOption {
    Echo,
    SuppressGoAhead,
    Msdp,
    Mccp2,
    Gmcp,
    Other(u8),
}

impl TelnetOption {
    /// MSDP 的選項代碼
    pub const MSDP_CODE: u8 = 69;

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Echo,
            3 => Self::SuppressGoAhead,
            Self::MSDP_CODE => Self::Msdp,
            86 => Self::Mccp2,
            201 => Self::Gmcp,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Echo => 1,
            Self::SuppressGoAhead => 3,
            Self::Msdp => Self::MSDP_CODE,
            Self::Mccp2 => 86,
            Self::Gmcp => 201,
            Self::Other(b) => *b,
        }
    }
}

/// Telnet 資料解析結果
#[derive(Debug, Clone, PartialEq)]
pub enum TelnetEvent {
    /// 選項協商（WILL, WONT, DO, DONT）
    Negotiation(TelnetCommand, TelnetOption),
    /// Sub-negotiation，保留完整的原始框架（`IAC SB opt ... IAC SE`）
    Subnegotiation(TelnetOption, Vec<u8>),
}

impl TelnetEvent {
    /// 事件的命令、選項與原始位元組
    pub fn into_parts(self) -> (TelnetCommand, TelnetOption, Vec<u8>) {
        match self {
            Self::Negotiation(cmd, option) => (cmd, option, negotiation(cmd, option)),
            Self::Subnegotiation(option, frame) => (TelnetCommand::Sb, option, frame),
        }
    }
}

/// 組出 `IAC <cmd> <option>`
pub fn negotiation(cmd: TelnetCommand, option: TelnetOption) -> Vec<u8> {
    vec![IAC, cmd as u8, option.as_byte()]
}

/// 從 `start`（指向 `IAC SB`）尋找 sub-negotiation 結束位置（`IAC SE` 之後）
fn find_subnegotiation_end(input: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 3;
    while j + 1 < input.len() {
        if input[j] == IAC {
            if input[j + 1] == TelnetCommand::Se as u8 {
                return Some(j + 2);
            }
            // IAC IAC 為轉義的 0xFF，不可視為結尾
            j += 2;
            continue;
        }
        j += 1;
    }
    None
}

/// 解析 Telnet 資料流，分離出文字和命令
///
/// 回傳 (文字位元組, 事件, 已消耗的位元組數)。結尾不完整的序列不會被消耗，
/// 呼叫端應保留到下次讀取時再合併解析。
pub fn parse_telnet_data(input: &[u8]) -> (Vec<u8>, Vec<TelnetEvent>, usize) {
    let mut data = Vec::new();
    let mut events = Vec::new();
    let mut i = 0;

    while i < input.len() {
        if input[i] != IAC {
            data.push(input[i]);
            i += 1;
            continue;
        }

        let Some(&next) = input.get(i + 1) else {
            break; // 不完整的 IAC 序列
        };

        if next == IAC {
            // IAC IAC = 轉義的 0xFF
            data.push(IAC);
            i += 2;
            continue;
        }

        match TelnetCommand::from_byte(next) {
            Some(
                cmd @ (TelnetCommand::Will
                | TelnetCommand::Wont
                | TelnetCommand::Do
                | TelnetCommand::Dont),
            ) => {
                let Some(&option) = input.get(i + 2) else {
                    break;
                };
                events.push(TelnetEvent::Negotiation(cmd, TelnetOption::from_byte(option)));
                i += 3;
            }
            Some(TelnetCommand::Sb) => {
                let (Some(&option), Some(end)) =
                    (input.get(i + 2), find_subnegotiation_end(input, i))
                else {
                    break;
                };
                events.push(TelnetEvent::Subnegotiation(
                    TelnetOption::from_byte(option),
                    input[i..end].to_vec(),
                ));
                i = end;
            }
            _ => {
                // NOP、GA 等其他命令，跳過
                i += 2;
            }
        }
    }

    (data, events, i)
}

/// 生成 Telnet 拒絕回應（對 ECHO/SGA 接受，其餘回應 WONT/DONT）
pub fn generate_refusal(cmd: TelnetCommand, option: TelnetOption) -> Vec<u8> {
    let response_cmd = match (cmd, option) {
        (TelnetCommand::Wont | TelnetCommand::Dont, _) => return vec![], // 不需要回應
        (TelnetCommand::Will, TelnetOption::Echo | TelnetOption::SuppressGoAhead) => {
            TelnetCommand::Do
        }
        (TelnetCommand::Do, TelnetOption::Echo | TelnetOption::SuppressGoAhead) => {
            TelnetCommand::Will
        }
        (TelnetCommand::Will, _) => TelnetCommand::Dont,
        (TelnetCommand::Do, _) => TelnetCommand::Wont,
        _ => return vec![],
    };

    negotiation(response_cmd, option)
}
