//! # 主从RPC协议
//!
//! 工作节点与主节点之间面向消息的流式协议。每个连接以 [`Hello`] 帧开始，
//! 服务端以 [`Reply`] 应答；流式动词随后在同一连接上持续收发帧。
//! 帧格式为4字节大端长度前缀 + JSON文档，单帧上限4 MiB。

pub mod codec;
pub mod frames;

pub use codec::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use frames::*;
