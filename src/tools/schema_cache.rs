//! Schema 缓存：按 TTL 缓存表清单与表结构，避免每轮迭代重复查询数据库

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::memory::ColumnDetail;

#[derive(Default)]
struct Entries {
    tables: Option<(Instant, Vec<String>)>,
    columns: HashMap<String, (Instant, Vec<ColumnDetail>)>,
}

pub struct SchemaCache {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn fresh(&self, at: Instant) -> bool {
        at.elapsed() < self.ttl
    }

    pub fn tables(&self) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .tables
            .as_ref()
            .filter(|(at, _)| self.fresh(*at))
            .map(|(_, t)| t.clone())
    }

    pub fn put_tables(&self, tables: Vec<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.tables = Some((Instant::now(), tables));
    }

    pub fn columns(&self, table: &str) -> Option<Vec<ColumnDetail>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .columns
            .get(&table.to_lowercase())
            .filter(|(at, _)| self.fresh(*at))
            .map(|(_, c)| c.clone())
    }

    pub fn put_columns(&self, table: &str, columns: Vec<ColumnDetail>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .columns
            .insert(table.to_lowercase(), (Instant::now(), columns));
    }

    pub fn invalidate(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        *entries = Entries::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_invalidate() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        assert!(cache.tables().is_none());
        cache.put_tables(vec!["sales".into()]);
        cache.put_columns("Sales", vec![ColumnDetail::new("amount")]);
        assert_eq!(cache.tables(), Some(vec!["sales".to_string()]));
        assert_eq!(cache.columns("sales").unwrap().len(), 1);
        cache.invalidate();
        assert!(cache.columns("sales").is_none());
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = SchemaCache::new(Duration::ZERO);
        cache.put_tables(vec!["sales".into()]);
        assert!(cache.tables().is_none());
    }
}
