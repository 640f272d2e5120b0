//! 分词：中英文混合指令 → 小写词元
//!
//! 含 CJK 字符时用 jieba（搜索引擎模式），否则按非字母数字字符切分。
//! 供哈希嵌入提取特征。

use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some(c), None) => is_cjk(c) || c.is_ascii_digit(),
        (Some(_), Some(_)) => token.chars().any(char::is_alphanumeric),
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(str::to_lowercase)
            .filter(|s| keep(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("Open Notepad, then type 'hello'!");
        assert_eq!(tokens, vec!["open", "notepad", "then", "type", "hello"]);
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("打开记事本然后输入你好");
        assert!(tokens.iter().any(|t| t.contains("记事本") || t.contains("打开")));
    }

    #[test]
    fn test_single_letters_dropped() {
        assert_eq!(tokenize("open a file"), vec!["open", "file"]);
        assert_eq!(tokenize("wait 5 seconds"), vec!["wait", "5", "seconds"]);
    }
}
