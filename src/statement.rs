//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side prepared statement
//! - `StatementCache`: bounded per-connection cache that evicts the entry
//!   executed longest ago

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::protocol::FieldDescription;
use crate::types::Oid;

/// Shared column descriptions - wrapped in Arc to avoid cloning on every query.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been parsed by PostgreSQL.
///
/// Prepared statements are created via the Parse message and can be
/// executed multiple times with different parameters via Bind + Execute.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Per-connection id; the server-side name is derived from it.
    pub statement_id: u32,
    /// Server-side name for this statement (e.g., "__pgkit_1")
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Number of `$n` placeholders in the query text.
    pub param_count: usize,
    /// Whether the server acknowledged the Parse.
    pub prepared: bool,
    pub last_executed: Option<DateTime<Utc>>,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result column descriptions (from RowDescription)
    pub columns: SharedColumns,
}

impl PreparedStatement {
    /// Create a statement that has not been sent to the server yet.
    pub fn new(statement_id: u32, query: String) -> Self {
        Self {
            statement_id,
            name: format!("__pgkit_{}", statement_id),
            param_count: count_placeholders(&query),
            query,
            prepared: false,
            last_executed: None,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    /// Set the parameter types after receiving ParameterDescription.
    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    /// Set the column descriptions after receiving RowDescription.
    pub fn set_columns(&mut self, columns: Vec<FieldDescription>) {
        self.columns = Arc::new(columns);
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Highest `$n` placeholder referenced by `query`.
///
/// Placeholders inside string literals, quoted identifiers, comments and
/// dollar-quoted bodies are ignored.
pub fn count_placeholders(query: &str) -> usize {
    let bytes = query.as_bytes();
    let mut max = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                if digits > 0 {
                    let n = query[i + 1..i + 1 + digits].parse::<usize>().unwrap_or(0);
                    max = max.max(n);
                    i += 1 + digits;
                } else if let Some(end) = dollar_tag_end(bytes, i) {
                    i = skip_dollar_quoted(bytes, i, end);
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    max
}

/// Index just past the closing quote; a doubled quote is an escape.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// If a dollar-quote tag (`$$` or `$tag$`) starts at `start`, the index just past it.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => return Some(i + 1),
            b if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 => i += 1,
            _ => return None,
        }
    }
    None
}

fn skip_dollar_quoted(bytes: &[u8], start: usize, tag_end: usize) -> usize {
    let tag = &bytes[start..tag_end];
    bytes[tag_end..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| tag_end + p + tag.len())
}

// ============================================================================
// Statement Cache
// ============================================================================

/// Bounded cache of prepared statements keyed by query text.
///
/// When an insertion would exceed the capacity, the statement with the
/// oldest `last_executed` is evicted. Statements that never ran go first;
/// ties are broken by least recent use.
pub struct StatementCache {
    /// query text → statement, in recency order
    cache: LruCache<String, Arc<PreparedStatement>>,
    capacity: usize,
    next_id: u32,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(query).map(Arc::clone)
    }

    /// Look up a statement without touching the recency order.
    pub fn peek(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(query).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, query: &str) -> bool {
        self.cache.contains(query)
    }

    /// Insert a statement, returning the one evicted to make room.
    ///
    /// Replacing an existing entry for the same query never evicts.
    pub fn insert(&mut self, statement: PreparedStatement) -> Option<Arc<PreparedStatement>> {
        let evicted = if self.cache.len() >= self.capacity && !self.cache.contains(&statement.query)
        {
            self.victim().and_then(|query| self.cache.pop(&query))
        } else {
            None
        };

        self.cache
            .put(statement.query.clone(), Arc::new(statement));
        evicted
    }

    /// Key of the statement executed longest ago.
    fn victim(&self) -> Option<String> {
        // `iter().rev()` walks from least to most recently used, and
        // `min_by_key` keeps the first minimum, so ties go to the LRU entry.
        self.cache
            .iter()
            .rev()
            .min_by_key(|(_, stmt)| stmt.last_executed)
            .map(|(query, _)| query.clone())
    }

    /// Record a successful execution.
    pub fn mark_executed(&mut self, query: &str, at: DateTime<Utc>) {
        if let Some(stmt) = self.cache.peek_mut(query) {
            let stmt = Arc::make_mut(stmt);
            stmt.prepared = true;
            stmt.last_executed = Some(at);
        }
    }

    /// Remove a statement from the cache.
    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(query)
    }

    /// Allocate the next statement id for this connection.
    pub fn next_statement_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget every statement without closing it on the server.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stmt(cache: &mut StatementCache, query: &str) -> PreparedStatement {
        PreparedStatement::new(cache.next_statement_id(), query.to_string())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_prepared_statement_creation() {
        let mut stmt = PreparedStatement::new(7, "SELECT $1, $2".to_string());
        assert_eq!(stmt.name, "__pgkit_7");
        assert_eq!(stmt.param_count, 2);
        assert!(!stmt.prepared);
        assert!(stmt.last_executed.is_none());
        assert!(!stmt.returns_rows());

        stmt.set_param_types(vec![Oid::INT4, Oid::TEXT]);
        assert_eq!(stmt.param_types, vec![Oid::INT4, Oid::TEXT]);
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("SELECT 1"), 0);
        assert_eq!(count_placeholders("SELECT $1, $3, $2"), 3);
        assert_eq!(count_placeholders("SELECT '$1', $1"), 1);
        assert_eq!(count_placeholders("SELECT 'it''s $4', $2"), 2);
        assert_eq!(count_placeholders(r#"SELECT "col$5" FROM t WHERE a = $1"#), 1);
        assert_eq!(count_placeholders("SELECT $1 -- $9\n, $2"), 2);
        assert_eq!(count_placeholders("SELECT /* $9 /* $8 */ */ $1"), 1);
        assert_eq!(count_placeholders("SELECT $$ $7 $$, $body$ $6 $body$, $2"), 2);
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        let s = stmt(&mut cache, "SELECT 1");
        assert!(cache.insert(s).is_none());
        assert_eq!(cache.len(), 1);

        let found = cache.get("SELECT 1").unwrap();
        assert_eq!(found.name, "__pgkit_0");
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn test_eviction_prefers_never_executed() {
        let mut cache = StatementCache::new(2);
        let q1 = stmt(&mut cache, "q1");
        let q2 = stmt(&mut cache, "q2");
        cache.insert(q1);
        cache.insert(q2);

        cache.mark_executed("q1", at(100));

        let q3 = stmt(&mut cache, "q3");
        let evicted = cache.insert(q3).unwrap();
        assert_eq!(evicted.query, "q2");
        assert!(cache.contains("q1"));
        assert!(cache.contains("q3"));
    }

    #[test]
    fn test_eviction_by_oldest_execution() {
        let mut cache = StatementCache::new(2);
        let q1 = stmt(&mut cache, "q1");
        let q2 = stmt(&mut cache, "q2");
        cache.insert(q1);
        cache.insert(q2);

        cache.mark_executed("q1", at(200));
        cache.mark_executed("q2", at(100));
        // Recency does not protect an entry that ran longer ago
        cache.get("q2");

        let q3 = stmt(&mut cache, "q3");
        assert_eq!(cache.insert(q3).unwrap().query, "q2");
    }

    #[test]
    fn test_ties_go_to_least_recently_used() {
        let mut cache = StatementCache::new(2);
        let q1 = stmt(&mut cache, "q1");
        let q2 = stmt(&mut cache, "q2");
        cache.insert(q1);
        cache.insert(q2);
        cache.get("q1");

        let q3 = stmt(&mut cache, "q3");
        assert_eq!(cache.insert(q3).unwrap().query, "q2");
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut cache = StatementCache::new(1);
        let first = stmt(&mut cache, "q1");
        cache.insert(first);
        let again = stmt(&mut cache, "q1");
        assert!(cache.insert(again).is_none());
        assert_eq!(cache.peek("q1").unwrap().statement_id, 1);
    }

    #[test]
    fn test_mark_executed() {
        let mut cache = StatementCache::new(4);
        let s = stmt(&mut cache, "q1");
        cache.insert(s);
        let held = cache.peek("q1").unwrap();

        cache.mark_executed("q1", at(5));
        let updated = cache.peek("q1").unwrap();
        assert!(updated.prepared);
        assert_eq!(updated.last_executed, Some(at(5)));
        // Outstanding handles keep their snapshot
        assert!(held.last_executed.is_none());
    }

    #[test]
    fn test_unique_statement_ids() {
        let mut cache = StatementCache::new(10);
        let ids: Vec<u32> = (0..10).map(|_| cache.next_statement_id()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 10);
    }
}
