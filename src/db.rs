use std::sync::Arc;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use serde_json::Value;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::error::{LibError, Result};
use crate::store::{DeleteAck, DocFilter, DocPatch, DocumentStore, Namespace, UpdateAck};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_document_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct DocumentRow {
    doc: Value,
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

/// Appends `filter` as a boolean SQL expression over the `doc` column.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &DocFilter) {
    match filter {
        DocFilter::All => {
            builder.push("TRUE");
        }
        DocFilter::Contains(pattern) => {
            builder.push("doc @> ");
            builder.push_bind(pattern.clone());
            builder.push("::jsonb");
        }
        DocFilter::And(filters) | DocFilter::Or(filters) if filters.is_empty() => {
            builder.push(if matches!(filter, DocFilter::And(_)) {
                "TRUE"
            } else {
                "FALSE"
            });
        }
        DocFilter::And(filters) | DocFilter::Or(filters) => {
            let joiner = if matches!(filter, DocFilter::And(_)) {
                " AND "
            } else {
                " OR "
            };
            builder.push("(");
            for (position, inner) in filters.iter().enumerate() {
                if position > 0 {
                    builder.push(joiner);
                }
                push_filter(builder, inner);
            }
            builder.push(")");
        }
    }
}

/// Selects the id of the first matching document, locking it for the enclosing statement.
fn push_first_match(builder: &mut QueryBuilder<'_, Postgres>, namespace: Namespace, filter: &DocFilter) {
    builder.push("(SELECT id FROM elab.documents WHERE namespace = ");
    builder.push_bind(namespace.as_str());
    builder.push(" AND ");
    push_filter(builder, filter);
    builder.push(" ORDER BY id ASC LIMIT 1 FOR UPDATE)");
}

/// Documents stored as JSONB rows, one table for every namespace.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Arc<PgPool>,
}

impl PgDocumentStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn from_pool(pool: &PgPool) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
        }
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    fn select(namespace: Namespace, filter: &DocFilter) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT doc FROM elab.documents WHERE namespace = ");
        builder.push_bind(namespace.as_str());
        builder.push(" AND ");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id ASC");
        builder
    }
}

impl DocumentStore for PgDocumentStore {
    async fn find_one(&self, namespace: Namespace, filter: &DocFilter) -> Result<Option<Value>> {
        let mut builder = Self::select(namespace, filter);
        builder.push(" LIMIT 1");
        let row = builder
            .build_query_as::<DocumentRow>()
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|err| db_err("Failed to query documents", err))?;
        Ok(row.map(|row| row.doc))
    }

    async fn find(&self, namespace: Namespace, filter: &DocFilter) -> Result<Vec<Value>> {
        let mut builder = Self::select(namespace, filter);
        let rows = builder
            .build_query_as::<DocumentRow>()
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|err| db_err("Failed to query documents", err))?;
        Ok(rows.into_iter().map(|row| row.doc).collect())
    }

    async fn insert_one(&self, namespace: Namespace, document: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO elab.documents (namespace, doc)
            VALUES ($1, $2)
            "#,
        )
        .bind(namespace.as_str())
        .bind(document)
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to insert document", err))?;
        Ok(())
    }

    async fn update_one(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
        patch: &DocPatch,
    ) -> Result<UpdateAck> {
        if patch.is_empty() {
            return Err(LibError::invalid(
                "Update contains no fields",
                anyhow!("empty patch for {}", namespace.as_str()),
            ));
        }

        let mut builder = QueryBuilder::new("UPDATE elab.documents SET doc = doc || ");
        builder.push_bind(Value::Object(patch.fields().clone()));
        builder.push("::jsonb, updated_at = CURRENT_TIMESTAMP WHERE id = ");
        push_first_match(&mut builder, namespace, filter);

        let result = builder
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(|err| db_err("Failed to update document", err))?;
        Ok(UpdateAck {
            matched: result.rows_affected(),
        })
    }

    async fn delete_one(&self, namespace: Namespace, filter: &DocFilter) -> Result<DeleteAck> {
        let mut builder = QueryBuilder::new("DELETE FROM elab.documents WHERE id = ");
        push_first_match(&mut builder, namespace, filter);

        let result = builder
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(|err| db_err("Failed to delete document", err))?;
        Ok(DeleteAck {
            deleted: result.rows_affected(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn render(filter: &DocFilter) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_filter(&mut builder, filter);
        builder.sql().to_string()
    }

    #[test]
    fn filters_render_as_containment() {
        assert_eq!(render(&DocFilter::All), "TRUE");
        assert_eq!(render(&DocFilter::Or(Vec::new())), "FALSE");
        assert_eq!(
            render(&DocFilter::field_eq("item_id", "a").and(DocFilter::Or(vec![
                DocFilter::array_contains("creator_ids", json!("u")),
                DocFilter::array_contains("group_ids", json!("g")),
            ]))),
            "(doc @> $1::jsonb AND (doc @> $2::jsonb OR doc @> $3::jsonb))"
        );
    }

    #[test]
    fn first_match_is_locked_and_ordered() {
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM elab.documents WHERE id = ");
        push_first_match(&mut builder, Namespace::Items, &DocFilter::All);
        assert_eq!(
            builder.sql(),
            "DELETE FROM elab.documents WHERE id = (SELECT id FROM elab.documents \
             WHERE namespace = $1 AND TRUE ORDER BY id ASC LIMIT 1 FOR UPDATE)"
        );
    }
}
