//! # 通用工具函数

use std::fmt::Write as _;

use chrono::Utc;
use rand::RngCore;

/// 生成一个新的实体ID
///
/// ID为12字节: 前4字节是Unix秒级时间戳（大端序），后8字节为随机数，
/// 以24位十六进制字符串表示。时间戳前缀保证同一秒内生成的ID按插入
/// 顺序大致有序。
pub fn oid() -> String {
    let ts = Utc::now().timestamp() as u32;
    let mut rand_bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rand_bytes);

    let mut s = String::with_capacity(24);
    for b in ts.to_be_bytes() {
        let _ = write!(s, "{b:02x}");
    }
    for b in rand_bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// 校验ID格式是否合法
pub fn is_valid_oid(id: &str) -> bool {
    id.len() == 24 && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// 按Shell风格切分命令行字符串
///
/// 支持单引号和双引号包裹的参数，引号内的空白不作为分隔符。
pub fn split_command(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_oid_format() {
        let id = oid();
        assert_eq!(id.len(), 24);
        assert!(is_valid_oid(&id));
    }

    #[test]
    fn test_oid_uniqueness() {
        let ids: HashSet<String> = (0..1000).map(|_| oid()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_split_command_simple() {
        assert_eq!(split_command("echo hi"), vec!["echo", "hi"]);
        assert_eq!(
            split_command("python spider.py --depth 3"),
            vec!["python", "spider.py", "--depth", "3"]
        );
    }

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command(r#"sh -c "echo hello world""#),
            vec!["sh", "-c", "echo hello world"]
        );
        assert_eq!(
            split_command("python -c 'print(1) '"),
            vec!["python", "-c", "print(1) "]
        );
    }

    #[test]
    fn test_split_command_empty() {
        assert!(split_command("").is_empty());
        assert!(split_command("   ").is_empty());
        // 空引号产生一个空参数
        assert_eq!(split_command(r#"cmd """#), vec!["cmd", ""]);
    }
}
