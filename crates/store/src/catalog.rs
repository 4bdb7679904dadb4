//! Product catalog — the upstream `{id, title}` read path.
//!
//! The engine only needs titles in one batched read; missing ids render as
//! `"Product <id>"` placeholders at the call site.

use std::collections::HashMap;
use std::sync::Arc;

use ps_domain::error::Result;

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Titles for the given ids. Ids without a row are simply absent from
    /// the returned map.
    async fn titles(&self, ids: &[i64]) -> Result<HashMap<i64, String>>;
}

/// Title for `id`, or the placeholder for products the catalog is missing.
pub fn title_or_placeholder(titles: &HashMap<i64, String>, id: i64) -> String {
    match titles.get(&id) {
        Some(t) if !t.is_empty() => t.clone(),
        _ => format!("Product {id}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteProductCatalog {
    db: Arc<Database>,
}

impl SqliteProductCatalog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Seed helper for tests and local imports.
    pub fn insert_products(&self, products: &[(i64, &str)]) -> Result<()> {
        self.db.with_mut(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO products (id, title) VALUES (?1, ?2) \
                     ON CONFLICT (id) DO UPDATE SET title = excluded.title",
                )?;
                for (id, title) in products {
                    stmt.execute(rusqlite::params![id, title])?;
                }
            }
            tx.commit()
        })
    }
}

#[async_trait::async_trait]
impl ProductCatalog for SqliteProductCatalog {
    async fn titles(&self, ids: &[i64]) -> Result<HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.db.with(|c| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql =
                format!("SELECT id, title FROM products WHERE id IN ({placeholders})");
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect()
        })
    }
}
