//! CLI 應用程式狀態
//!
//! 輸入格式（每行一筆）：
//! - `< text`：模擬 MUD 傳來的一行文字
//! - `<< ff fb 45`：模擬 MUD 傳來的原始位元組（十六進位）
//! - 以命令字元開頭：用戶端命令
//! - 其他：送往 MUD 的命令

use std::rc::Rc;

use mudauto::commands;
use mudauto::{
    action, msdp, route_incoming, ActionModule, Dispatcher, EngineConfig, HookFlow, HookId,
    MsdpModule, Session, SessionCommand,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// 單次輸入最多連鎖執行的命令數
const MAX_CASCADE: usize = 100;

pub struct App {
    dispatcher: Dispatcher,
    session: Session,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    modules: Option<(ActionModule, MsdpModule, HookId)>,
    /// 尚未收到換行的文字
    partial: Vec<u8>,
    output: Vec<String>,
}

impl App {
    pub fn new(config: EngineConfig) -> Self {
        let config = Rc::new(config);
        let dispatcher = Dispatcher::new();
        let actions = action::load(&dispatcher, &config);
        let msdp = msdp::load(&dispatcher, &config);
        let ansi = crate::ansi::load(&dispatcher);

        // MSDP 資料只記錄下來
        dispatcher.msdp_data.register(
            |_, session, data| {
                for var in &data.vars {
                    match serde_json::to_string(&var.value) {
                        Ok(json) => session.system_message(&format!("msdp: {} = {}", var.name, json)),
                        Err(e) => warn!("MSDP 資料無法轉為 JSON: {}", e),
                    }
                }
                HookFlow::Continue
            },
            100,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new("cli", tx).with_config(config);

        Self {
            dispatcher,
            session,
            commands: rx,
            modules: Some((actions, msdp, ansi)),
            partial: Vec::new(),
            output: Vec::new(),
        }
    }

    /// 處理一行輸入
    pub fn handle_line(&mut self, line: &str) {
        if let Some(hex) = line.strip_prefix("<<") {
            match parse_hex(hex) {
                Some(bytes) => self.receive(&bytes),
                None => self.output.push(format!("無效的十六進位資料: {}", hex.trim())),
            }
        } else if let Some(text) = line.strip_prefix('<') {
            let mut bytes = text.strip_prefix(' ').unwrap_or(text).as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            self.receive(&bytes);
        } else if let Err(e) = self.session.submit_command(line) {
            error!("無法送出命令: {}", e);
        }

        self.drain_commands();
        self.collect_messages();
    }

    /// 處理 MUD 傳來的位元組，只有完整的行會經過 mud_filter
    fn receive(&mut self, bytes: &[u8]) {
        let text = route_incoming(&self.dispatcher, &mut self.session, bytes);
        self.partial.extend_from_slice(&text);

        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            self.filter_line(line.trim_end_matches(['\r', '\n']));
        }
        self.flush_outbound();
    }

    fn filter_line(&mut self, line: &str) {
        let line = self
            .dispatcher
            .filter_mud_line(&mut self.session, line.to_string());
        self.output.push(line);
    }

    /// 執行命令佇列中的命令（包含動作觸發的命令）
    fn drain_commands(&mut self) {
        let mut executed = 0;
        while let Ok(command) = self.commands.try_recv() {
            executed += 1;
            if executed > MAX_CASCADE {
                warn!("命令連鎖超過 {} 筆，捨棄剩餘命令", MAX_CASCADE);
                while self.commands.try_recv().is_ok() {}
                break;
            }

            debug!(internal = command.internal, text = %command.text, "執行命令");
            for part in split_commands(&command.text, self.session.config().command_separator) {
                self.run(part);
            }
        }
        self.flush_outbound();
    }

    fn run(&mut self, text: &str) {
        if commands::is_command(&self.session, text) {
            if let Err(e) = commands::execute(&self.dispatcher, &mut self.session, text) {
                self.output.push(format!("錯誤: {}", e));
            }
        } else {
            let mut bytes = text.as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            self.session.send_raw(bytes);
        }
    }

    fn flush_outbound(&mut self) {
        for chunk in self.session.take_outbound() {
            match std::str::from_utf8(&chunk) {
                Ok(text) if !chunk.contains(&mudauto::telnet::IAC) => {
                    self.output.push(format!("> {}", text.trim_end()));
                }
                _ => self.output.push(format!("> [{}]", to_hex(&chunk))),
            }
        }
    }

    fn collect_messages(&mut self) {
        self.output.extend(self.session.take_messages());
    }

    /// 取出待顯示的輸出
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// 結束連線並卸載模組
    pub fn shutdown(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.filter_line(&String::from_utf8_lossy(&line));
            self.drain_commands();
        }
        self.session.teardown();
        if let Some((actions, msdp, ansi)) = self.modules.take() {
            actions.unload(&self.dispatcher);
            msdp.unload(&self.dispatcher);
            self.dispatcher.mud_filter.unregister(ansi);
        }
    }
}

/// 以分隔字元切開命令（大括號內與轉義的分隔字元不切）
fn split_commands(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    text.split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).ok())
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_fires_and_sends() {
        let mut app = App::new(EngineConfig::default());
        app.handle_line("#action {%0 gives you %5} {say thanks for the %5, %0!} quiet=true");
        assert!(app.take_output().is_empty());

        app.handle_line("< \x1b[33mBob\x1b[0m gives you a sword");
        assert_eq!(
            app.take_output(),
            vec!["Bob gives you a sword", "> say thanks for the a sword, Bob!"]
        );
    }

    #[test]
    fn test_response_with_command_and_separator() {
        let mut app = App::new(EngineConfig::default());
        app.handle_line("#action {^You are hungry} {eat bread;#unaction {^You are hungry}} quiet=true");
        app.handle_line("< You are hungry");
        assert_eq!(
            app.take_output(),
            vec![
                "You are hungry",
                "> eat bread",
                "unaction: {^You are hungry} {eat bread;#unaction {^You are hungry}} removed."
            ]
        );
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut app = App::new(EngineConfig::default());
        app.handle_line("#action {^Bob gives you %1} {say thanks} quiet=true");

        app.handle_line("<< 42 6f 62 20");
        assert!(app.take_output().is_empty());

        app.handle_line("< gives you a sword");
        assert_eq!(app.take_output(), vec!["Bob gives you a sword", "> say thanks"]);

        app.handle_line("<< 3e 20");
        app.shutdown();
        assert_eq!(app.take_output(), vec!["> "]);
    }

    #[test]
    fn test_msdp_handshake_from_hex() {
        let mut app = App::new(EngineConfig::default());
        app.handle_line("<< ff fb 45");
        let output = app.take_output();
        assert_eq!(output[0], "> [ff fd 45]");
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn test_split_commands() {
        assert_eq!(
            split_commands("eat bread; #action {a;b} {c;d} ;drink", ';'),
            vec!["eat bread", "#action {a;b} {c;d}", "drink"]
        );
        assert_eq!(split_commands(r"say a\;b", ';'), vec![r"say a\;b"]);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex(" ff 01 "), Some(vec![0xff, 0x01]));
        assert_eq!(parse_hex("zz"), None);
    }
}
