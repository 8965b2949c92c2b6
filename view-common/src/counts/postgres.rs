use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::{CountStore, CountStoreError};
use crate::event::EntityType;

/// Where each entity type keeps its view count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountTables {
    pub series_table: String,
    pub chapters_table: String,
    pub id_column: String,
    /// Postgres type the entity id parameter is cast to, e.g. `text`, `uuid` or `bigint`.
    pub id_type: String,
    pub count_column: String,
}

impl Default for CountTables {
    fn default() -> Self {
        Self {
            series_table: "series".to_owned(),
            chapters_table: "chapters".to_owned(),
            id_column: "id".to_owned(),
            id_type: "text".to_owned(),
            count_column: "view_count".to_owned(),
        }
    }
}

impl CountTables {
    fn table(&self, entity_type: EntityType) -> &str {
        match entity_type {
            EntityType::Series => &self.series_table,
            EntityType::Chapter => &self.chapters_table,
        }
    }

    /// Names are interpolated into queries, so only plain identifiers are allowed.
    fn validate(&self) -> Result<(), CountStoreError> {
        for name in [
            &self.series_table,
            &self.chapters_table,
            &self.id_column,
            &self.id_type,
            &self.count_column,
        ] {
            let valid = !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(CountStoreError::InvalidIdentifier(name.to_owned()));
            }
        }
        Ok(())
    }

    fn add_views_query(&self, entity_type: EntityType) -> String {
        format!(
            r#"
UPDATE
    "{table}"
SET
    "{count}" = "{count}" + $1
WHERE
    "{id}" = CAST($2 AS {id_type})
            "#,
            table = self.table(entity_type),
            count = self.count_column,
            id = self.id_column,
            id_type = self.id_type,
        )
    }
}

/// SQLSTATEs raised when the id parameter cannot be cast to the id column's type:
/// invalid_text_representation and numeric_value_out_of_range.
const INVALID_ID_SQLSTATES: [&str; 2] = ["22P02", "22003"];

fn is_invalid_id(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|error| error.code())
        .is_some_and(|code| INVALID_ID_SQLSTATES.contains(&&*code))
}

/// A `CountStore` writing to the relational tables that own series and chapters.
#[derive(Clone)]
pub struct PgCountStore {
    pool: PgPool,
    tables: CountTables,
}

impl PgCountStore {
    pub fn new_from_pool(pool: PgPool, tables: CountTables) -> Result<Self, CountStoreError> {
        tables.validate()?;

        Ok(Self { pool, tables })
    }
}

#[async_trait]
impl CountStore for PgCountStore {
    async fn add_views(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        delta: i64,
    ) -> Result<(), CountStoreError> {
        let query = self.tables.add_views_query(entity_type);

        let result = sqlx::query(&query)
            .bind(delta)
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                if is_invalid_id(&error) {
                    // No row can have an id the column type cannot represent.
                    CountStoreError::EntityNotFound {
                        entity_type,
                        entity_id: entity_id.to_owned(),
                    }
                } else {
                    CountStoreError::QueryError {
                        command: "UPDATE".to_owned(),
                        error,
                    }
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(CountStoreError::EntityNotFound {
                entity_type,
                entity_id: entity_id.to_owned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_tables(db: &PgPool) {
        for table in ["series", "chapters"] {
            sqlx::query(&format!(
                r#"CREATE TABLE "{table}" (id TEXT PRIMARY KEY, view_count INTEGER NOT NULL DEFAULT 0)"#
            ))
            .execute(db)
            .await
            .expect("failed to create table");
        }
    }

    async fn view_count(db: &PgPool, table: &str, id: &str) -> i32 {
        sqlx::query_scalar(&format!(r#"SELECT view_count FROM "{table}" WHERE id = $1"#))
            .bind(id)
            .fetch_one(db)
            .await
            .expect("failed to read view count")
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let tables = CountTables {
            series_table: "series; DROP TABLE series".to_owned(),
            ..CountTables::default()
        };

        assert!(matches!(
            tables.validate(),
            Err(CountStoreError::InvalidIdentifier(_))
        ));
        assert!(CountTables::default().validate().is_ok());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_add_views_is_additive(db: PgPool) {
        create_tables(&db).await;
        sqlx::query(r#"INSERT INTO "chapters" (id, view_count) VALUES ('ch-1', 10)"#)
            .execute(&db)
            .await
            .unwrap();

        let store = PgCountStore::new_from_pool(db.clone(), CountTables::default()).unwrap();
        store
            .add_views(EntityType::Chapter, "ch-1", 3)
            .await
            .expect("failed to add views");
        store
            .add_views(EntityType::Chapter, "ch-1", 1)
            .await
            .expect("failed to add views");

        assert_eq!(view_count(&db, "chapters", "ch-1").await, 14);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_missing_entity_is_reported(db: PgPool) {
        create_tables(&db).await;
        let store = PgCountStore::new_from_pool(db, CountTables::default()).unwrap();

        let result = store.add_views(EntityType::Series, "s-404", 1).await;

        assert!(matches!(
            result,
            Err(CountStoreError::EntityNotFound { entity_type: EntityType::Series, .. })
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_id_of_the_wrong_type_is_a_missing_entity(db: PgPool) {
        sqlx::query(
            r#"CREATE TABLE "numbered_series" (id BIGINT PRIMARY KEY, view_count INTEGER NOT NULL DEFAULT 0)"#,
        )
        .execute(&db)
        .await
        .expect("failed to create table");
        sqlx::query(r#"INSERT INTO "numbered_series" (id, view_count) VALUES (7, 0)"#)
            .execute(&db)
            .await
            .unwrap();

        let tables = CountTables {
            series_table: "numbered_series".to_owned(),
            id_type: "bigint".to_owned(),
            ..CountTables::default()
        };
        let store = PgCountStore::new_from_pool(db.clone(), tables).unwrap();

        for malformed in ["not-a-number", "99999999999999999999999"] {
            assert!(matches!(
                store.add_views(EntityType::Series, malformed, 1).await,
                Err(CountStoreError::EntityNotFound { .. })
            ));
        }

        store
            .add_views(EntityType::Series, "7", 2)
            .await
            .expect("failed to add views");
        let count: i32 = sqlx::query_scalar(r#"SELECT view_count FROM "numbered_series" WHERE id = 7"#)
            .fetch_one(&db)
            .await
            .expect("failed to read view count");
        assert_eq!(count, 2);
    }
}
