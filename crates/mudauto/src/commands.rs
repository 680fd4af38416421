//! 用戶端命令
//!
//! 支援的命令（以設定中的命令字元開頭，預設 `#`）：
//! - `#action [{trigger} [{response}]] [priority=N] [onetime=bool] [quiet=bool]`
//! - `#unaction <selector> [quiet=bool]`
//! - `#variable [{name} [{value}]]`、`#unvariable <name>`
//!
//! 參數可用 `{...}` 包住（可巢狀，`\{`、`\}`、`\\` 為轉義），
//! 或是不含空白的單字；`key=value` / `key={value}` 為選項。

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::action::ActionError;
use crate::hooks::Dispatcher;
use crate::session::Session;

/// 命令錯誤
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("不是命令: {0}")]
    NotACommand(String),

    #[error("未知的命令: {0}")]
    UnknownCommand(String),

    #[error("大括號不成對: {0}")]
    UnbalancedBraces(String),

    #[error("選項 {key} 的值無效: {value}")]
    InvalidOption { key: String, value: String },

    #[error("未知的選項: {0}")]
    UnknownOption(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Action(#[from] ActionError),
}

/// 轉義文字，讓它能放進 `{...}` 中並還原成原文
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '{' | '}') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// 解析後的命令參數
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    pub positional: Vec<String>,
    pub options: HashMap<String, String>,
}

impl Args {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    fn check_options(&self, allowed: &[&str]) -> Result<(), CommandError> {
        match self.options.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(key) => Err(CommandError::UnknownOption(key.clone())),
            None => Ok(()),
        }
    }

    fn int(&self, key: &str, default: i32) -> Result<i32, CommandError> {
        match self.options.get(key) {
            Some(value) => value.trim().parse().map_err(|_| CommandError::InvalidOption {
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, CommandError> {
        let Some(value) = self.options.get(key) else {
            return Ok(default);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            _ => Err(CommandError::InvalidOption {
                key: key.to_string(),
                value: value.clone(),
            }),
        }
    }
}

struct ArgParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ArgParser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        self.pos = self.input.len() - self.rest().trim_start().len();
    }

    /// 讀取 `{...}` 群組（目前位置為 `{`）
    fn read_group(&mut self) -> Result<String, CommandError> {
        let body = &self.rest()[1..];
        let mut out = String::new();
        let mut depth = 0usize;
        let mut chars = body.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.peek() {
                    Some(&(_, next @ ('\\' | '{' | '}'))) => {
                        out.push(next);
                        chars.next();
                    }
                    _ => out.push('\\'),
                },
                '{' => {
                    depth += 1;
                    out.push(c);
                }
                '}' if depth == 0 => {
                    self.pos += 1 + i + 1;
                    return Ok(out);
                }
                '}' => {
                    depth -= 1;
                    out.push(c);
                }
                _ => out.push(c),
            }
        }

        Err(CommandError::UnbalancedBraces(self.input.to_string()))
    }

    fn read_word(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn read_value(&mut self) -> Result<String, CommandError> {
        if self.rest().starts_with('{') {
            self.read_group()
        } else {
            Ok(self.read_word().to_string())
        }
    }

    /// `key=` 前綴（只接受英文字母組成的鍵）
    fn option_key(&self) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        (len > 0 && rest[len..].starts_with('=')).then(|| &rest[..len])
    }
}

/// 解析命令參數
pub fn parse_args(input: &str) -> Result<Args, CommandError> {
    let mut parser = ArgParser { input, pos: 0 };
    let mut args = Args::default();

    loop {
        parser.skip_whitespace();
        if parser.rest().is_empty() {
            break;
        }

        if let Some(key) = parser.option_key() {
            parser.pos += key.len() + 1;
            let value = parser.read_value()?;
            args.options.insert(key.to_ascii_lowercase(), value);
        } else {
            let value = parser.read_value()?;
            args.positional.push(value);
        }
    }

    Ok(args)
}

/// 輸入是否為用戶端命令
pub fn is_command(session: &Session, input: &str) -> bool {
    input.trim_start().starts_with(session.config().command_char)
}

/// 執行一行用戶端命令，結果以系統訊息寫入 session
pub fn execute(
    dispatcher: &Dispatcher,
    session: &mut Session,
    input: &str,
) -> Result<(), CommandError> {
    let command_char = session.config().command_char;
    let Some(line) = input.trim().strip_prefix(command_char) else {
        return Err(CommandError::NotACommand(input.to_string()));
    };

    let (name, rest) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    let args = parse_args(rest)?;
    debug!(command = name, ?args, "執行命令");

    match name.to_ascii_lowercase().as_str() {
        "action" => action_cmd(session, &args),
        "unaction" => unaction_cmd(session, &args),
        "variable" | "var" => variable_cmd(dispatcher, session, &args),
        "unvariable" | "unvar" => unvariable_cmd(dispatcher, session, &args),
        _ => Err(CommandError::UnknownCommand(name.to_string())),
    }
}

fn action_cmd(session: &mut Session, args: &Args) -> Result<(), CommandError> {
    args.check_options(&["priority", "onetime", "quiet"])?;
    let priority = match args.get(2) {
        Some(value) => value.trim().parse().map_err(|_| CommandError::InvalidOption {
            key: "priority".to_string(),
            value: value.to_string(),
        })?,
        None => args.int("priority", session.config().default_priority)?,
    };
    let onetime = args.flag("onetime", false)?;
    let quiet = args.flag("quiet", false)?;

    let (trigger, response) = match (args.get(0), args.get(1)) {
        (Some(trigger), Some(response)) => (trigger, response),
        (selector, _) => {
            let data = session.actions.info(selector.unwrap_or(""));
            let message = if data.is_empty() {
                "action: no actions defined.".to_string()
            } else {
                format!("actions:\n{}", data)
            };
            session.system_message(&message);
            return Ok(());
        }
    };

    session.add_action(trigger, response, priority, onetime)?;
    if !quiet {
        session.system_message(&format!(
            "action: {{{}}} {{{}}} {{{}}} added.",
            trigger, response, priority
        ));
    }
    Ok(())
}

fn unaction_cmd(session: &mut Session, args: &Args) -> Result<(), CommandError> {
    args.check_options(&["quiet"])?;
    let quiet = args.flag("quiet", false)?;
    let Some(selector) = args.get(0) else {
        return Err(CommandError::Usage("#unaction <selector> [quiet=bool]"));
    };

    let removed = session.remove_actions(selector);
    if quiet {
        return Ok(());
    }

    let message = if removed.is_empty() {
        "unaction: No actions removed.".to_string()
    } else {
        removed
            .iter()
            .map(|(trigger, response)| format!("unaction: {{{}}} {{{}}} removed.", trigger, response))
            .collect::<Vec<_>>()
            .join("\n")
    };
    session.system_message(&message);
    Ok(())
}

fn variable_cmd(
    dispatcher: &Dispatcher,
    session: &mut Session,
    args: &Args,
) -> Result<(), CommandError> {
    args.check_options(&["quiet"])?;
    let quiet = args.flag("quiet", false)?;

    match (args.get(0), args.get(1)) {
        (Some(name), Some(value)) => {
            session.set_variable(dispatcher, name, value);
            if !quiet {
                session.system_message(&format!("variable: {{{}}}={{{}}} set.", name, value));
            }
        }
        (Some(name), None) => {
            let message = match session.variables.get(name) {
                Some(value) => format!("variable: {{{}}}={{{}}}", name, value),
                None => format!("variable: {{{}}} is not defined.", name),
            };
            session.system_message(&message);
        }
        (None, _) => {
            let mut vars: Vec<(&String, &String)> = session.variables.iter().collect();
            vars.sort();
            let message = if vars.is_empty() {
                "variable: no variables defined.".to_string()
            } else {
                let lines: Vec<String> = vars
                    .iter()
                    .map(|(name, value)| format!("{{{}}}={{{}}}", name, value))
                    .collect();
                format!("variables:\n{}", lines.join("\n"))
            };
            session.system_message(&message);
        }
    }
    Ok(())
}

fn unvariable_cmd(
    dispatcher: &Dispatcher,
    session: &mut Session,
    args: &Args,
) -> Result<(), CommandError> {
    args.check_options(&["quiet"])?;
    let quiet = args.flag("quiet", false)?;
    let Some(name) = args.get(0) else {
        return Err(CommandError::Usage("#unvariable <name> [quiet=bool]"));
    };

    let removed = session.unset_variable(dispatcher, name);
    if !quiet {
        let message = match removed {
            Some(_) => format!("unvariable: {{{}}} removed.", name),
            None => "unvariable: No variables removed.".to_string(),
        };
        session.system_message(&message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action;
    use crate::config::EngineConfig;
    use crate::session::SessionCommand;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn session() -> (Session, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new("cmd", tx), rx)
    }

    #[test]
    fn test_parse_args() {
        let args = assert_ok!(parse_args(
            "{%0 gives you %5} {say thanks for the %5, %0!} priority={3} onetime=true"
        ));
        assert_eq!(args.positional, vec!["%0 gives you %5", "say thanks for the %5, %0!"]);
        assert_eq!(args.options["priority"], "3");
        assert_eq!(args.options["onetime"], "true");
    }

    #[test]
    fn test_parse_nested_and_escaped() {
        let args = parse_args(r"{a {b} c} {x \{y\} \\z \s} dd*").unwrap();
        assert_eq!(args.positional, vec!["a {b} c", r"x {y} \z \s", "dd*"]);
    }

    #[test]
    fn test_parse_unbalanced() {
        assert!(matches!(
            parse_args("{never closed"),
            Err(CommandError::UnbalancedBraces(_))
        ));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r"say {hi} \s"), r"say \{hi\} \\s");
    }

    #[test]
    fn test_action_add_and_list() {
        let dispatcher = Dispatcher::new();
        let (mut session, _rx) = session();

        assert_ok!(execute(&dispatcher, &mut session, "#action"));
        assert_eq!(session.take_messages(), vec!["action: no actions defined."]);

        assert_ok!(execute(
            &dispatcher,
            &mut session,
            "#action {^You are hungry} {get bread bag;eat bread} priority=3"
        ));
        assert_eq!(
            session.take_messages(),
            vec!["action: {^You are hungry} {get bread bag;eat bread} {3} added."]
        );

        assert_ok!(execute(&dispatcher, &mut session, "#action ^You*"));
        assert_eq!(
            session.take_messages(),
            vec![
                "actions:\n#action {^You are hungry} {get bread bag;eat bread} priority={3} onetime={false}"
            ]
        );

        assert_ok!(execute(&dispatcher, &mut session, "#action {x} {y} quiet=true"));
        assert!(session.take_messages().is_empty());
        assert_eq!(session.actions.count(), 2);
    }

    #[test]
    fn test_action_compile_error() {
        let dispatcher = Dispatcher::new();
        let (mut session, _rx) = session();
        let err = assert_err!(execute(&dispatcher, &mut session, "#action {r[(]} {x}"));
        assert!(matches!(err, CommandError::Action(ActionError::Compile { .. })));
        assert!(session.actions.is_empty());

        let err = assert_err!(execute(&dispatcher, &mut session, "#action {a} {b} priority=high"));
        assert!(matches!(err, CommandError::InvalidOption { .. }));
        let err = assert_err!(execute(&dispatcher, &mut session, "#action {a} {b} color=red"));
        assert!(matches!(err, CommandError::UnknownOption(_)));
    }

    #[test]
    fn test_action_positional_priority() {
        let dispatcher = Dispatcher::new();
        let (mut session, _rx) = session();
        assert_ok!(execute(&dispatcher, &mut session, "#action {a} {b} 3 quiet=true"));
        assert_eq!(session.actions.get("a").unwrap().priority(), 3);

        let err = assert_err!(execute(&dispatcher, &mut session, "#action {c} {d} soon"));
        assert!(matches!(err, CommandError::InvalidOption { .. }));
        assert!(session.actions.get("c").is_none());
    }

    #[test]
    fn test_unaction() {
        let dispatcher = Dispatcher::new();
        let (mut session, _rx) = session();
        session.add_action("missed you.", "grin", 5, false).unwrap();
        session.add_action("miss", "x", 5, false).unwrap();

        assert_ok!(execute(&dispatcher, &mut session, "#unaction {missed you.}"));
        assert_eq!(
            session.take_messages(),
            vec!["unaction: {missed you.} {grin} removed."]
        );

        assert_ok!(execute(&dispatcher, &mut session, "#unaction nothing*"));
        assert_eq!(session.take_messages(), vec!["unaction: No actions removed."]);

        assert!(matches!(
            execute(&dispatcher, &mut session, "#unaction"),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn test_listing_reparses_to_same_actions() {
        let dispatcher = Dispatcher::new();
        let (mut original, _rx) = session();
        original
            .add_action(r"r[^%_1 tells\s+you %2$]", "say %1 just told me %2", 5, false)
            .unwrap();
        original.add_action("{odd} trigger", r"say \{x\}", 2, true).unwrap();
        original.add_action("%0 gives you %5", "say thanks for the %5, %0!", 5, false).unwrap();

        let (mut restored, _rx2) = session();
        for line in original.actions.persist(true).lines() {
            assert_ok!(execute(&dispatcher, &mut restored, line));
        }

        assert!(restored.take_messages().is_empty());
        assert_eq!(restored.actions.info(""), original.actions.info(""));
    }

    #[test]
    fn test_variable_command_recompiles_actions() {
        let dispatcher = Dispatcher::new();
        let _actions = action::load(&dispatcher, &EngineConfig::default());
        let (mut session, mut rx) = session();

        assert_ok!(execute(&dispatcher, &mut session, "#variable {target} {kobold}"));
        assert_ok!(execute(&dispatcher, &mut session, "#action {$target arrives} {kill %a}"));
        assert_ok!(execute(&dispatcher, &mut session, "#var target orc quiet=on"));
        session.take_messages();

        dispatcher.filter_mud_line(&mut session, "orc arrives".to_string());
        assert_eq!(rx.try_recv().unwrap().text, "kill orc arrives");

        assert_ok!(execute(&dispatcher, &mut session, "#variable"));
        assert_eq!(session.take_messages(), vec!["variables:\n{target}={orc}"]);

        assert_ok!(execute(&dispatcher, &mut session, "#unvariable target"));
        assert_eq!(session.take_messages(), vec!["unvariable: {target} removed."]);
        assert!(session.variables.is_empty());
    }

    #[test]
    fn test_unknown_and_non_command() {
        let dispatcher = Dispatcher::new();
        let (mut session, _rx) = session();
        assert!(is_command(&session, "  #action"));
        assert!(!is_command(&session, "say hi"));
        assert!(matches!(
            execute(&dispatcher, &mut session, "#frobnicate"),
            Err(CommandError::UnknownCommand(_))
        ));
        assert!(matches!(
            execute(&dispatcher, &mut session, "say hi"),
            Err(CommandError::NotACommand(_))
        ));
    }
}
