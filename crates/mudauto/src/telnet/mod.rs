//! Telnet 協定模組
//!
//! 解析傳入的位元組流，將選項序列交給 [`Dispatcher`] 的 `telnet_option` 擴充點，
//! 沒有模組認領的選項以標準拒絕回應。

mod protocol;

pub use protocol::{
    generate_refusal, negotiation, parse_telnet_data, TelnetCommand, TelnetEvent, TelnetOption,
    IAC,
};

use tracing::{debug, warn};

use crate::hooks::{Dispatcher, HookFlow, TelnetOptionArgs};
use crate::session::Session;

/// 處理傳入的原始位元組，回傳其中的文字部分
///
/// 不完整的 Telnet 序列暫存在 session 中，下次呼叫時接續解析。
/// 暫存超過 `max_subnegotiation_len` 時，未結束的 sub-negotiation 會被捨棄到下一個換行為止。
pub fn route_incoming(dispatcher: &Dispatcher, session: &mut Session, input: &[u8]) -> Vec<u8> {
    let mut buffer = session.take_telnet_buffer();
    buffer.extend_from_slice(input);

    // 其他不完整序列最多三個位元組，超過上限的只會是 sub-negotiation
    let limit = session.config().max_subnegotiation_len.max(3);
    let mut text = Vec::new();
    let mut events = Vec::new();
    loop {
        let (data, parsed, consumed) = parse_telnet_data(&buffer);
        text.extend_from_slice(&data);
        events.extend(parsed);
        buffer.drain(..consumed);

        if buffer.len() <= limit {
            break;
        }

        let skip = buffer
            .iter()
            .position(|&b| b == b'\n')
            .map_or(buffer.len(), |i| i + 1);
        warn!(
            session = %session.id(),
            pending = buffer.len(),
            dropped = skip,
            "sub-negotiation 未結束且超過上限，捨棄"
        );
        session.system_message(&format!(
            "telnet: 捨棄未結束的 sub-negotiation（{} 位元組）",
            skip
        ));
        buffer.drain(..skip);
    }
    session.restore_telnet_buffer(buffer);

    for event in events {
        let (command, option, data) = event.into_parts();
        let mut args = TelnetOptionArgs {
            command,
            option,
            data,
        };

        if dispatcher.dispatch_telnet_option(session, &mut args) == HookFlow::Continue {
            let reply = generate_refusal(args.command, args.option);
            if !reply.is_empty() {
                debug!(command = ?args.command, option = ?args.option, "未處理的選項，送出拒絕回應");
                session.send_raw(reply);
            }
        }
    }

    text
}
