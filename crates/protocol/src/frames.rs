//! # 协议帧定义

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crawler_errors::{CrawlerError, CrawlerResult};

/// 消息码以字符串上线；未识别的值解析为Unknown而不报错（向前兼容）
macro_rules! string_code_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok(<$ty>::parse(&s))
            }
        }
    };
}

/// RPC动词
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RpcVerb {
    /// 节点注册（幂等）
    RegisterNode,
    /// 节点心跳
    SendHeartbeat,
    /// 节点管理消息流（主→从）
    NodeSubscribe,
    /// 领取待执行任务
    FetchTask,
    /// 任务上行流: 抓取记录与日志（从→主）
    TaskConnect,
    /// 任务下行流: 取消信号（主→从）
    TaskSubscribe,
    /// 连接健康探测
    Ping,
}

/// 连接首帧
///
/// 每个连接的第一帧，携带动词、节点标识与共享密钥。一元动词的请求
/// 参数直接放在 `payload` 中。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub verb: RpcVerb,
    pub node_key: String,
    pub auth_token: String,
    #[serde(default)]
    pub payload: Value,
}

/// 服务端应答帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default)]
    pub error_kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

impl Reply {
    pub fn ok(payload: Value) -> Self {
        Self {
            ok: true,
            error_kind: String::new(),
            message: String::new(),
            payload,
        }
    }

    pub fn err(e: &CrawlerError) -> Self {
        Self {
            ok: false,
            error_kind: e.wire_kind().to_string(),
            message: e.to_string(),
            payload: Value::Null,
        }
    }

    /// 将应答还原为结果
    pub fn into_result(self) -> CrawlerResult<Value> {
        if self.ok {
            Ok(self.payload)
        } else {
            Err(CrawlerError::from_wire(&self.error_kind, &self.message))
        }
    }
}

/// 任务上行流消息码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    /// 抓取记录落库，data为JSON对象数组
    InsertData,
    /// 日志写入，data为字符串数组
    InsertLogs,
    /// 流健康探测，无副作用
    TaskPing,
    /// 未知消息码（向前兼容: 记录日志后忽略）
    Unknown,
}

impl ConnectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectCode::InsertData => "insert_data",
            ConnectCode::InsertLogs => "insert_logs",
            ConnectCode::TaskPing => "task_ping",
            ConnectCode::Unknown => "unknown",
        }
    }

    /// 未识别的消息码落到Unknown，保证向前兼容
    pub fn parse(s: &str) -> ConnectCode {
        match s {
            "insert_data" => ConnectCode::InsertData,
            "insert_logs" => ConnectCode::InsertLogs,
            "task_ping" => ConnectCode::TaskPing,
            _ => ConnectCode::Unknown,
        }
    }
}

string_code_serde!(ConnectCode);

/// 任务上行流帧（从→主）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectFrame {
    pub task_id: String,
    pub code: ConnectCode,
    #[serde(default)]
    pub data: Value,
}

/// 任务下行流消息码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeCode {
    Cancel,
    Unknown,
}

impl SubscribeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscribeCode::Cancel => "cancel",
            SubscribeCode::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> SubscribeCode {
        match s {
            "cancel" => SubscribeCode::Cancel,
            _ => SubscribeCode::Unknown,
        }
    }
}

string_code_serde!(SubscribeCode);

/// 任务下行流帧（主→从），当前仅取消信号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeFrame {
    pub code: SubscribeCode,
    pub task_id: String,
    #[serde(default)]
    pub force: bool,
}

/// 节点管理流消息码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSubscribeCode {
    ConnectPing,
    Unknown,
}

impl NodeSubscribeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSubscribeCode::ConnectPing => "connect_ping",
            NodeSubscribeCode::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> NodeSubscribeCode {
        match s {
            "connect_ping" => NodeSubscribeCode::ConnectPing,
            _ => NodeSubscribeCode::Unknown,
        }
    }
}

string_code_serde!(NodeSubscribeCode);

/// 节点管理流帧（主→从）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSubscribeFrame {
    pub code: NodeSubscribeCode,
}

// ============================================================================
// 一元动词请求/应答载荷
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_key: String,
    pub node_name: String,
    pub max_runners: i32,
    #[serde(default)]
    pub is_master: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTaskRequest {
    pub node_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTaskResponse {
    /// 空字符串表示当前无可领取任务
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubscribeRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSubscribeRequest {
    pub node_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_wire_values() {
        let v = serde_json::to_string(&RpcVerb::FetchTask).unwrap();
        assert_eq!(v, "\"fetch_task\"");
        let v: RpcVerb = serde_json::from_str("\"task_subscribe\"").unwrap();
        assert_eq!(v, RpcVerb::TaskSubscribe);
    }

    #[test]
    fn test_unknown_connect_code_is_tolerated() {
        // 未来新增的消息码解析为Unknown而不报错
        let frame: ConnectFrame = serde_json::from_str(
            r#"{"task_id":"abc","code":"insert_metrics","data":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(frame.code, ConnectCode::Unknown);
    }

    #[test]
    fn test_reply_into_result() {
        let reply = Reply::ok(serde_json::json!({"task_id": "x"}));
        assert_eq!(reply.into_result().unwrap()["task_id"], "x");

        let reply = Reply::err(&CrawlerError::Unauthorized);
        let err = reply.into_result().unwrap_err();
        assert!(matches!(err, CrawlerError::Unauthorized));
    }

    #[test]
    fn test_subscribe_frame_defaults() {
        let frame: SubscribeFrame =
            serde_json::from_str(r#"{"code":"cancel","task_id":"t1"}"#).unwrap();
        assert_eq!(frame.code, SubscribeCode::Cancel);
        assert!(!frame.force);
    }
}
