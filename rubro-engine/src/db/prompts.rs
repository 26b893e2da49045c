//! Prompt persistence

use crate::models::{Category, Prompt};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert a new prompt; labels are unique
pub async fn insert(pool: &SqlitePool, prompt: &Prompt) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO prompts (id, name, label, template, categories, is_default, version, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(prompt.id.to_string())
    .bind(&prompt.name)
    .bind(&prompt.label)
    .bind(&prompt.template)
    .bind(serde_json::to_string(&prompt.categories).unwrap_or_else(|_| "[]".to_string()))
    .bind(prompt.is_default)
    .bind(prompt.version)
    .bind(prompt.created_at)
    .bind(prompt.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store a refined successor of an existing prompt
///
/// The successor keeps the name, bumps the version, and gets a derived label.
pub async fn insert_revision(
    pool: &SqlitePool,
    base: &Prompt,
    refined_template: &str,
) -> Result<Prompt, sqlx::Error> {
    let mut revision = base.clone();
    revision.id = Uuid::new_v4();
    revision.version = base.version + 1;
    revision.label = format!("{}-v{}", base.label, revision.version);
    revision.template = refined_template.to_string();
    revision.is_default = false;
    revision.created_at = Utc::now();
    revision.updated_at = revision.created_at;

    insert(pool, &revision).await?;
    Ok(revision)
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Prompt>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, label, template, categories, is_default, version, created_at, updated_at
         FROM prompts WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_prompt))
}

pub async fn get_by_label(pool: &SqlitePool, label: &str) -> Result<Option<Prompt>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, label, template, categories, is_default, version, created_at, updated_at
         FROM prompts WHERE label = ?",
    )
    .bind(label)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_prompt))
}

/// Flip the single default prompt
pub async fn set_default(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE prompts SET is_default = 0 WHERE is_default = 1")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE prompts SET is_default = 1, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

pub async fn get_default(pool: &SqlitePool) -> Result<Option<Prompt>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, label, template, categories, is_default, version, created_at, updated_at
         FROM prompts WHERE is_default = 1 LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_prompt))
}

fn row_to_prompt(row: sqlx::sqlite::SqliteRow) -> Prompt {
    let id: String = row.get("id");
    let categories: String = row.get("categories");
    let is_default: i64 = row.get("is_default");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Prompt {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get("name"),
        label: row.get("label"),
        template: row.get("template"),
        categories: serde_json::from_str::<Vec<Category>>(&categories).unwrap_or_default(),
        is_default: is_default != 0,
        version: row.get("version"),
        created_at,
        updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubro_common::db::init_memory_database;

    fn sample() -> Prompt {
        Prompt::new(
            "gastos",
            "gastos-base",
            "Clasifica:\n{categories}",
            vec![Category {
                id: 1,
                name: "Pop".to_string(),
                description: "Punto de venta".to_string(),
                priority: 1,
                keywords: vec!["promo".to_string()],
            }],
        )
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let pool = init_memory_database().await.unwrap();
        let prompt = sample();
        insert(&pool, &prompt).await.unwrap();

        let loaded = get_by_label(&pool, "gastos-base").await.unwrap().unwrap();
        assert_eq!(loaded.id, prompt.id);
        assert_eq!(loaded.categories, prompt.categories);
        assert_eq!(loaded.compile(), prompt.compile());
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected() {
        let pool = init_memory_database().await.unwrap();
        insert(&pool, &sample()).await.unwrap();
        assert!(insert(&pool, &sample()).await.is_err());
    }

    #[tokio::test]
    async fn test_revision_bumps_version() {
        let pool = init_memory_database().await.unwrap();
        let base = sample();
        insert(&pool, &base).await.unwrap();

        let revision = insert_revision(&pool, &base, "refined template").await.unwrap();
        assert_eq!(revision.version, 2);
        assert_eq!(revision.label, "gastos-base-v2");

        let loaded = get(&pool, revision.id).await.unwrap().unwrap();
        assert_eq!(loaded.template, "refined template");
    }

    #[tokio::test]
    async fn test_single_default() {
        let pool = init_memory_database().await.unwrap();
        let first = sample();
        insert(&pool, &first).await.unwrap();
        let mut second = sample();
        second.id = Uuid::new_v4();
        second.label = "gastos-alt".to_string();
        insert(&pool, &second).await.unwrap();

        set_default(&pool, first.id).await.unwrap();
        set_default(&pool, second.id).await.unwrap();

        let default = get_default(&pool).await.unwrap().unwrap();
        assert_eq!(default.id, second.id);
    }
}
