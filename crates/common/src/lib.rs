//! # 共享基础库
//!
//! 包含系统各组件共用的类型别名、常量和工具函数。

pub mod constants;
pub mod fs;
pub mod types;
pub mod utils;

pub use constants::*;
pub use types::*;
pub use utils::{oid, split_command};
