//! # 共享类型定义

use chrono::{DateTime, Utc};

/// 实体ID类型（12字节标识符的24位十六进制表示）
pub type Id = String;

/// 时间戳类型
pub type Timestamp = DateTime<Utc>;
