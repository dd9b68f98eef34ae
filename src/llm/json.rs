//! 从 LLM 文本中提取 JSON
//!
//! 模型常把 JSON 包在 ```json 代码块里，或在前后夹杂解释文字。

use serde_json::Value;

/// 去掉 Markdown 代码块围栏（```json / ```sql / ```）
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let rest = &trimmed[start + 3..];
    // 跳过语言标记所在行
    let body = match rest.find('\n') {
        Some(nl) if !rest[..nl].contains(char::is_whitespace) => &rest[nl + 1..],
        _ => rest,
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// 提取文本中的第一个完整 JSON 对象
pub fn extract_json_object(text: &str) -> Option<Value> {
    let candidates = [text.trim(), strip_code_fence(text)];
    for candidate in candidates {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = matching_brace(&text[start..])?;
    match serde_json::from_str::<Value>(&text[start..start + end + 1]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// 返回与开头 '{' 匹配的 '}' 的字节偏移（跳过字符串内的括号）
fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
