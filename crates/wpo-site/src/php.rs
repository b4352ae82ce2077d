//! PHP literal encoding for values handed to `wp eval`.

use serde_json::Value;

/// Render `value` as a PHP expression. Objects become associative
/// arrays with keys in sorted order.
pub fn phpize(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => double_quoted(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(phpize).collect();
            format!("array({})", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{} => {}", double_quoted(k), phpize(v)))
                .collect();
            format!("array({})", items.join(", "))
        }
    }
}

/// A PHP double-quoted string literal. Control and non-ASCII characters
/// are written as `\xNN` escapes of their UTF-8 bytes.
pub fn double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0B}' => out.push_str("\\v"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 32 || (c as u32) >= 127 => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// PHP statement setting one WordPress option.
pub fn update_option(name: &str, value: &Value) -> String {
    format!("update_option({}, {}); \n", double_quoted(name), phpize(value))
}
