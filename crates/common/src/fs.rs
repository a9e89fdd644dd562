//! # 文件扫描工具
//!
//! 主从节点之间的文件同步依赖目录扫描结果: 以相对路径为键的文件信息表，
//! 文件内容哈希用于增量比对。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crawler_errors::{CrawlerError, CrawlerResult};

/// 文件信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsFileInfo {
    /// 文件名
    pub name: String,
    /// 相对扫描根目录的路径
    pub path: String,
    /// 是否为目录
    pub is_dir: bool,
    /// 文件大小（字节）
    pub size: u64,
    /// 文件权限位
    pub mode: u32,
    /// 文件内容的SHA-256哈希（目录为空字符串）
    pub hash: String,
    /// 最后修改时间
    pub mod_time: DateTime<Utc>,
}

/// 以相对路径为键的文件信息表
pub type FsFileInfoMap = HashMap<String, FsFileInfo>;

/// 递归扫描目录，返回文件信息表
///
/// 目录不存在时返回空表（同步双方都可能尚未创建工作目录）。
pub fn scan_directory<P: AsRef<Path>>(root: P) -> CrawlerResult<FsFileInfoMap> {
    let root = root.as_ref();
    let mut files = FsFileInfoMap::new();
    if !root.exists() {
        return Ok(files);
    }
    scan_recursive(root, root, &mut files)?;
    Ok(files)
}

fn scan_recursive(root: &Path, dir: &Path, files: &mut FsFileInfoMap) -> CrawlerResult<()> {
    for entry in std::fs::read_dir(dir)
        .map_err(|e| CrawlerError::Internal(format!("读取目录失败 {}: {e}", dir.display())))?
    {
        let entry = entry.map_err(|e| CrawlerError::Internal(e.to_string()))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|e| CrawlerError::Internal(e.to_string()))?;
        let rel_path = relative_path(root, &path);

        let mod_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        if meta.is_dir() {
            files.insert(
                rel_path.clone(),
                FsFileInfo {
                    name: file_name(&path),
                    path: rel_path,
                    is_dir: true,
                    size: 0,
                    mode: file_mode(&meta),
                    hash: String::new(),
                    mod_time,
                },
            );
            scan_recursive(root, &path, files)?;
        } else {
            files.insert(
                rel_path.clone(),
                FsFileInfo {
                    name: file_name(&path),
                    path: rel_path,
                    is_dir: false,
                    size: meta.len(),
                    mode: file_mode(&meta),
                    hash: hash_file(&path)?,
                    mod_time,
                },
            );
        }
    }
    Ok(())
}

/// 计算文件内容的SHA-256哈希
pub fn hash_file(path: &Path) -> CrawlerResult<String> {
    let content = std::fs::read(path)
        .map_err(|e| CrawlerError::Internal(format!("读取文件失败 {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    let digest = hasher.finalize();
    let mut s = String::with_capacity(64);
    use std::fmt::Write as _;
    for b in digest {
        let _ = write!(s, "{b:02x}");
    }
    Ok(s)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

/// 拼接相对路径到根目录，拒绝越界路径
pub fn join_under(root: &Path, rel: &str) -> CrawlerResult<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CrawlerError::invalid_input(format!("非法路径: {rel}")));
    }
    Ok(root.join(rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), b"print(1)").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib").join("b.py"), b"print(2)").unwrap();

        let files = scan_directory(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files["a.py"].hash.len() == 64);
        assert!(files["lib"].is_dir);
        assert!(files.contains_key("lib/b.py"));
    }

    #[test]
    fn test_scan_missing_directory() {
        let files = scan_directory("/nonexistent/path/for/test").unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"v1").unwrap();
        let h1 = hash_file(&path).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let h2 = hash_file(&path).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_join_under_rejects_parent() {
        let root = Path::new("/tmp/ws");
        assert!(join_under(root, "../etc/passwd").is_err());
        assert!(join_under(root, "spider/main.py").is_ok());
    }
}
