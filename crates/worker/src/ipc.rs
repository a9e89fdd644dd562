//! # IPC行协议
//!
//! 子进程stdout的每一行: 如果能解析为带 `ipc: true` 标记的JSON对象，
//! 则视为IPC消息；data类型消息的payload归一化为对象列表后作为抓取
//! 记录上行。其余行一律按日志处理。

use serde::Deserialize;
use serde_json::Value;

/// IPC消息
#[derive(Debug, Clone, Deserialize)]
pub struct IpcMessage {
    #[serde(default)]
    pub ipc: bool,
    #[serde(default, rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl IpcMessage {
    /// 是否为抓取数据消息（type为空或"data"）
    pub fn is_data(&self) -> bool {
        self.msg_type.is_empty() || self.msg_type == "data"
    }
}

/// 尝试把一行解析为IPC消息
///
/// 非JSON、非对象或缺少 `ipc: true` 标记的行都返回None（按日志处理）。
pub fn parse_ipc_line(line: &str) -> Option<IpcMessage> {
    let msg: IpcMessage = serde_json::from_str(line).ok()?;
    if msg.ipc {
        Some(msg)
    } else {
        None
    }
}

/// 把payload归一化为对象列表
///
/// 接受对象数组或单个对象；数组里的非对象元素被丢弃。
pub fn normalize_payload(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.into_iter().filter(|v| v.is_object()).collect(),
        obj @ Value::Object(_) => vec![obj],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_message() {
        let msg = parse_ipc_line(r#"{"ipc": true, "type": "data", "payload": [{"a": 1}]}"#)
            .expect("应解析为IPC消息");
        assert!(msg.is_data());
        assert_eq!(normalize_payload(msg.payload).len(), 1);
    }

    #[test]
    fn test_missing_type_defaults_to_data() {
        let msg = parse_ipc_line(r#"{"ipc": true, "payload": {"a": 1}}"#).unwrap();
        assert!(msg.is_data());
    }

    #[test]
    fn test_plain_lines_are_not_ipc() {
        assert!(parse_ipc_line("hello world").is_none());
        assert!(parse_ipc_line(r#"{"level": "info", "msg": "x"}"#).is_none());
        assert!(parse_ipc_line(r#"{"ipc": false, "payload": {}}"#).is_none());
        // JSON数组不是IPC消息
        assert!(parse_ipc_line(r#"[1, 2, 3]"#).is_none());
    }

    #[test]
    fn test_normalize_single_object() {
        let records = normalize_payload(serde_json::json!({"title": "a"}));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_normalize_filters_non_objects() {
        let records = normalize_payload(serde_json::json!([{"a": 1}, 42, "x", {"b": 2}]));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_normalize_scalar_is_empty() {
        assert!(normalize_payload(serde_json::json!(42)).is_empty());
        assert!(normalize_payload(Value::Null).is_empty());
    }
}
