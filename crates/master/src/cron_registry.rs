//! # cron注册表
//!
//! 显式的条目表: `entry_id → (schedule_id, 解析后的cron, 下次触发时间)`，
//! 由调度服务的秒级时钟驱动。条目句柄单调递增，-1保留表示"未注册"。

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crawler_errors::{CrawlerError, CrawlerResult};

struct CronEntry {
    schedule_id: String,
    schedule: CronSchedule,
    next: Option<DateTime<Utc>>,
}

pub struct CronRegistry {
    entries: Mutex<HashMap<i64, CronEntry>>,
    next_entry_id: AtomicI64,
}

impl Default for CronRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CronRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_entry_id: AtomicI64::new(1),
        }
    }

    /// 解析cron表达式
    ///
    /// 接受标准5字段表达式（自动补秒字段）与带秒的6/7字段表达式。
    pub fn parse(expr: &str) -> CrawlerResult<CronSchedule> {
        let normalized = normalize_expr(expr);
        CronSchedule::from_str(&normalized).map_err(|e| CrawlerError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })
    }

    /// 注册一个条目，返回条目句柄
    pub fn add(&self, expr: &str, schedule_id: &str) -> CrawlerResult<i64> {
        let schedule = Self::parse(expr)?;
        let now = Utc::now();
        let entry_id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let next = schedule.after(&now).next();

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            entry_id,
            CronEntry {
                schedule_id: schedule_id.to_string(),
                schedule,
                next,
            },
        );
        Ok(entry_id)
    }

    pub fn remove(&self, entry_id: i64) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&entry_id);
    }

    pub fn contains(&self, entry_id: i64) -> bool {
        self.entries.lock().unwrap().contains_key(&entry_id)
    }

    pub fn entry_ids(&self) -> HashSet<i64> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 收集到期的条目并推进其下次触发时间
    pub fn due(&self, now: DateTime<Utc>) -> Vec<(i64, String)> {
        let mut fired = Vec::new();
        let mut entries = self.entries.lock().unwrap();
        for (entry_id, entry) in entries.iter_mut() {
            if let Some(next) = entry.next {
                if next <= now {
                    fired.push((*entry_id, entry.schedule_id.clone()));
                    entry.next = entry.schedule.after(&now).next();
                }
            }
        }
        fired
    }
}

/// 5字段表达式补齐秒字段
fn normalize_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_five_field() {
        assert!(CronRegistry::parse("0 0 * * *").is_ok());
        assert!(CronRegistry::parse("*/5 * * * *").is_ok());
    }

    #[test]
    fn test_parse_with_seconds() {
        assert!(CronRegistry::parse("30 0 0 * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid() {
        let err = CronRegistry::parse("not a cron").unwrap_err();
        assert!(matches!(err, CrawlerError::InvalidCron { .. }));
        assert!(CronRegistry::parse("99 * * * *").is_err());
    }

    #[test]
    fn test_add_remove_entries() {
        let registry = CronRegistry::new();
        let e1 = registry.add("* * * * *", "s1").unwrap();
        let e2 = registry.add("* * * * *", "s2").unwrap();
        assert_ne!(e1, e2);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(e1));

        registry.remove(e1);
        assert!(!registry.contains(e1));
        assert_eq!(registry.entry_ids(), [e2].into_iter().collect());
    }

    #[test]
    fn test_due_fires_and_advances() {
        let registry = CronRegistry::new();
        registry.add("* * * * *", "s1").unwrap();

        // 下一分钟边界之后必然到期一次
        let future = Utc::now() + chrono::Duration::seconds(61);
        let fired = registry.due(future);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "s1");

        // 同一时刻不会重复触发
        assert!(registry.due(future).is_empty());
    }
}
