//! 變數展開模組
//!
//! 動作引擎只依賴 [`VariableExpander`] 的呼叫約定；
//! [`VariableTable`] 是 session 內建的最小實作：
//! - `$name` / `${name}`: 展開 session 變數，`$$` 為字面上的 `$`
//! - `%name`: 展開觸發時綁定的變數（`%0`、`%_1` 的捕獲值、`%a` 整行文字）

use std::collections::HashMap;

use thiserror::Error;

/// 變數展開錯誤
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("變數名稱未結束: {0}")]
    UnterminatedName(String),
}

/// 變數展開約定
pub trait VariableExpander {
    /// 以 session 變數展開文字，結果為空時呼叫端會改用原文
    fn expand_session_vars(&self, text: &str) -> Result<String, ExpandError>;

    /// 以觸發時綁定的變數展開回應模板
    fn expand_vars(
        &self,
        template: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<String, ExpandError>;
}

/// Session 變數表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableTable {
    vars: HashMap<String, String>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定變數，回傳舊值
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl VariableExpander for VariableTable {
    fn expand_session_vars(&self, text: &str) -> Result<String, ExpandError> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find('$') {
            result.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(stripped) = after.strip_prefix('$') {
                result.push('$');
                rest = stripped;
            } else if let Some(braced) = after.strip_prefix('{') {
                let end = braced
                    .find('}')
                    .ok_or_else(|| ExpandError::UnterminatedName(rest[pos..].to_string()))?;
                let name = &braced[..end];
                match self.get(name) {
                    Some(value) => result.push_str(value),
                    None => result.push_str(&rest[pos..pos + end + 3]),
                }
                rest = &braced[end + 1..];
            } else {
                let len = after
                    .char_indices()
                    .find(|&(_, c)| !is_name_char(c))
                    .map_or(after.len(), |(i, _)| i);
                let name = &after[..len];
                match self.get(name) {
                    Some(value) if !name.is_empty() => result.push_str(value),
                    // 未定義的變數與行尾錨點 `$` 原樣保留
                    _ => {
                        result.push('$');
                        result.push_str(name);
                    }
                }
                rest = &after[len..];
            }
        }

        result.push_str(rest);
        Ok(result)
    }

    fn expand_vars(
        &self,
        template: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<String, ExpandError> {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('%') {
            result.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let run = after
                .char_indices()
                .find(|&(_, c)| !is_name_char(c))
                .map_or(after.len(), |(i, _)| i);

            // 取最長的已綁定前綴，例如 %10 優先於 %1
            let bound = after[..run]
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .rev()
                .find_map(|len| bindings.get(&after[..len]).map(|v| (len, v)));

            match bound {
                Some((len, value)) => {
                    result.push_str(value);
                    rest = &after[len..];
                }
                None => {
                    result.push('%');
                    rest = after;
                }
            }
        }

        result.push_str(rest);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_session_vars() {
        let mut vars = VariableTable::new();
        vars.set("target", "kobold");
        assert_eq!(vars.expand_session_vars("kill $target").unwrap(), "kill kobold");
        assert_eq!(vars.expand_session_vars("kill ${target}s").unwrap(), "kill kobolds");
        assert_eq!(vars.expand_session_vars("cost $$5").unwrap(), "cost $5");
    }

    #[test]
    fn test_unknown_and_anchor_kept() {
        let vars = VariableTable::new();
        assert_eq!(vars.expand_session_vars("^You are hungry$").unwrap(), "^You are hungry$");
        assert_eq!(vars.expand_session_vars("$missing here").unwrap(), "$missing here");
        assert_eq!(vars.expand_session_vars("${missing}").unwrap(), "${missing}");
    }

    #[test]
    fn test_unterminated_brace() {
        let vars = VariableTable::new();
        assert_eq!(
            vars.expand_session_vars("a ${oops"),
            Err(ExpandError::UnterminatedName("${oops".to_string()))
        );
    }

    #[test]
    fn test_expand_bindings() {
        let vars = VariableTable::new();
        let b = bindings(&[("0", "Bob"), ("5", "a sword")]);
        assert_eq!(
            vars.expand_vars("say thanks for the %5, %0!", &b).unwrap(),
            "say thanks for the a sword, Bob!"
        );
    }

    #[test]
    fn test_expand_longest_binding() {
        let vars = VariableTable::new();
        let b = bindings(&[("1", "one"), ("10", "ten")]);
        assert_eq!(vars.expand_vars("%10 %1 %1x %9", &b).unwrap(), "ten one onex %9");
    }

    #[test]
    fn test_expand_unicode_text() {
        let vars = VariableTable::new();
        let b = bindings(&[("a", "你獲得金幣")]);
        assert_eq!(vars.expand_vars("記錄：%a。", &b).unwrap(), "記錄：你獲得金幣。");
    }
}
