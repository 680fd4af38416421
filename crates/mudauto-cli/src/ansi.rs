//! ANSI 轉義碼處理
//!
//! 在動作比對之前移除 MUD 文字中的顏色碼。

use mudauto::{Dispatcher, HookId};

/// 掛在 mud_filter 上的優先級（早於動作模組）
pub const STRIP_PRIORITY: i32 = 10;

/// 移除 ANSI 轉義碼
pub fn strip_ansi(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // 跳過 CSI 序列
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(ch) = chars.next() {
                    if ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// 註冊 ANSI 過濾器
pub fn load(dispatcher: &Dispatcher) -> HookId {
    dispatcher
        .mud_filter
        .register(|_, _, line| strip_ansi(&line), STRIP_PRIORITY)
}
