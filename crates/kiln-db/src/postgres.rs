//! PostgreSQL store.
//!
//! Build transactions run at SERIALIZABLE isolation. Serialization failures
//! surface as [`DbError::Conflict`] and the caller retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::build::{BuildInfra, BuildSteps, StringPair};
use kiln_core::builder::{BuilderConfig, BuilderEntry};
use kiln_core::task::Task;
use kiln_core::{Build, BuildId, BuilderId};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Postgres};

use crate::queue::QueuedTask;
use crate::store::{BuildQuery, RequestIdRecord, Store, Transaction, join_build, split_build};
use crate::{DbError, DbResult};

/// Selects the build row joined with its satellites, followed by `$tail`.
macro_rules! select_build {
    ($tail:literal) => {
        concat!(
            "SELECT b.data, i.infra, p.properties FROM builds b ",
            "LEFT JOIN build_infra i ON i.build_id = b.id ",
            "LEFT JOIN build_input_properties p ON p.build_id = b.id ",
            $tail
        )
    };
}

type BuildRow = (Value, Option<Value>, Option<Value>);

fn decode_build((data, infra, properties): BuildRow) -> DbResult<Build> {
    let row: Build = serde_json::from_value(data)?;
    let infra: Option<BuildInfra> = infra.map(serde_json::from_value).transpose()?;
    let properties = properties.map(serde_json::from_value).transpose()?;
    Ok(join_build(row, infra, properties))
}

async fn fetch_build<'e, E: PgExecutor<'e>>(exec: E, id: BuildId) -> DbResult<Option<Build>> {
    let row = sqlx::query_as::<_, BuildRow>(select_build!("WHERE b.id = $1"))
        .bind(id.get())
        .fetch_optional(exec)
        .await?;
    row.map(decode_build).transpose()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>> {
        fetch_build(&self.pool, id).await
    }

    async fn search_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>> {
        let builder = query.builder.as_ref();
        let tags: Vec<String> = query.tags.iter().map(ToString::to_string).collect();
        let limit = (query.limit > 0).then(|| i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = sqlx::query_as::<_, BuildRow>(select_build!(
            "WHERE ($1::text IS NULL OR (b.project = $1 AND b.bucket = $2 AND b.builder = $3)) \
             AND ($4::text IS NULL OR b.status = $4) \
             AND b.tags @> $5 \
             ORDER BY b.id ASC \
             LIMIT $6"
        ))
        .bind(builder.map(|b| b.project.as_str()))
        .bind(builder.map(|b| b.bucket.as_str()))
        .bind(builder.map(|b| b.builder.as_str()))
        .bind(query.status.map(|s| s.to_string()))
        .bind(&tags)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_build).collect()
    }

    async fn get_builder(&self, id: &BuilderId) -> DbResult<Option<BuilderConfig>> {
        let config = sqlx::query_scalar::<_, Value>(
            "SELECT config FROM builders WHERE project = $1 AND bucket = $2 AND builder = $3",
        )
        .bind(&id.project)
        .bind(&id.bucket)
        .bind(&id.builder)
        .fetch_optional(&self.pool)
        .await?;
        Ok(config.map(serde_json::from_value).transpose()?)
    }

    async fn put_builder(&self, entry: &BuilderEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builders (project, bucket, builder, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project, bucket, builder) DO UPDATE SET config = EXCLUDED.config
            "#,
        )
        .bind(&entry.id.project)
        .bind(&entry.id.bucket)
        .bind(&entry.id.builder)
        .bind(serde_json::to_value(&entry.config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_sequence(&self, name: &str, count: u32) -> DbResult<u32> {
        let start: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sequences (name, next) VALUES ($1, 1 + $2)
            ON CONFLICT (name) DO UPDATE SET next = sequences.next + $2
            RETURNING next - $2
            "#,
        )
        .bind(name)
        .bind(i64::from(count))
        .fetch_one(&self.pool)
        .await?;
        u32::try_from(start).map_err(|_| DbError::Corrupt(format!("sequence {name} = {start}")))
    }

    async fn update_builder_stats(
        &self,
        builders: &[BuilderId],
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let projects: Vec<&str> = builders.iter().map(|b| b.project.as_str()).collect();
        let buckets: Vec<&str> = builders.iter().map(|b| b.bucket.as_str()).collect();
        let names: Vec<&str> = builders.iter().map(|b| b.builder.as_str()).collect();
        sqlx::query(
            r#"
            INSERT INTO builder_stats (project, bucket, builder, last_scheduled)
            SELECT p, b, n, $4 FROM UNNEST($1::text[], $2::text[], $3::text[]) AS t(p, b, n)
            ON CONFLICT (project, bucket, builder)
            DO UPDATE SET last_scheduled = GREATEST(builder_stats.last_scheduled, EXCLUDED.last_scheduled)
            "#,
        )
        .bind(&projects)
        .bind(&buckets)
        .bind(&names)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_scheduled(&self, builder: &BuilderId) -> DbResult<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT last_scheduled FROM builder_stats
            WHERE project = $1 AND bucket = $2 AND builder = $3
            "#,
        )
        .bind(&builder.project)
        .bind(&builder.bucket)
        .bind(&builder.builder)
        .fetch_optional(&self.pool)
        .await?;
        Ok(at)
    }

    async fn index_tags(&self, entries: &[(StringPair, BuildId)]) -> DbResult<()> {
        let tags: Vec<String> = entries.iter().map(|(t, _)| t.to_string()).collect();
        let ids: Vec<i64> = entries.iter().map(|(_, id)| id.get()).collect();
        sqlx::query(
            r#"
            INSERT INTO tag_index (tag, build_id)
            SELECT * FROM UNNEST($1::text[], $2::bigint[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&tags)
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup_tag(&self, tag: &StringPair) -> DbResult<Vec<BuildId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT build_id FROM tag_index WHERE tag = $1 ORDER BY build_id")
                .bind(tag.to_string())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(BuildId::from).collect())
    }
}

pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get_build(&mut self, id: BuildId) -> DbResult<Option<Build>> {
        fetch_build(&mut *self.tx, id).await
    }

    async fn get_request_id(&mut self, key: &str) -> DbResult<Option<RequestIdRecord>> {
        let row = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            "SELECT key, build_id, create_time FROM request_ids WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|(key, build_id, create_time)| RequestIdRecord {
            key,
            build_id: build_id.into(),
            create_time,
        }))
    }

    async fn get_steps(&mut self, id: BuildId) -> DbResult<Option<BuildSteps>> {
        let steps = sqlx::query_scalar::<_, Value>(
            "SELECT steps FROM build_steps WHERE build_id = $1",
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(steps
            .map(|s| serde_json::from_value(s).map(|steps| BuildSteps { build_id: id, steps }))
            .transpose()?)
    }

    async fn put_build(&mut self, build: &Build) -> DbResult<()> {
        let (row, infra, properties) = split_build(build);
        let tags: Vec<String> = build.tags.iter().map(ToString::to_string).collect();

        sqlx::query(
            r#"
            INSERT INTO builds
                (id, project, bucket, builder, number, status, tags, create_time, update_time, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                number = EXCLUDED.number,
                status = EXCLUDED.status,
                tags = EXCLUDED.tags,
                update_time = EXCLUDED.update_time,
                data = EXCLUDED.data
            "#,
        )
        .bind(build.id.get())
        .bind(&build.builder.project)
        .bind(&build.builder.bucket)
        .bind(&build.builder.builder)
        .bind(build.number.map(i64::from))
        .bind(build.status.to_string())
        .bind(&tags)
        .bind(build.create_time)
        .bind(build.update_time)
        .bind(serde_json::to_value(&row)?)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO build_infra (build_id, infra) VALUES ($1, $2)
            ON CONFLICT (build_id) DO UPDATE SET infra = EXCLUDED.infra
            "#,
        )
        .bind(build.id.get())
        .bind(serde_json::to_value(&infra)?)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO build_input_properties (build_id, properties) VALUES ($1, $2)
            ON CONFLICT (build_id) DO UPDATE SET properties = EXCLUDED.properties
            "#,
        )
        .bind(build.id.get())
        .bind(Value::Object(properties))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn put_request_id(&mut self, record: &RequestIdRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO request_ids (key, build_id, create_time) VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(record.build_id.get())
        .bind(record.create_time)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!("request id {}", record.key)));
        }
        Ok(())
    }

    async fn put_steps(&mut self, steps: &BuildSteps) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_steps (build_id, steps) VALUES ($1, $2)
            ON CONFLICT (build_id) DO UPDATE SET steps = EXCLUDED.steps
            "#,
        )
        .bind(steps.build_id.get())
        .bind(serde_json::to_value(&steps.steps)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn enqueue(&mut self, task: &Task) -> DbResult<bool> {
        let row = QueuedTask::pending(task, Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, build_id, dedup_key, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(&row.kind)
        .bind(row.build_id)
        .bind(&row.dedup_key)
        .bind(&row.status)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
