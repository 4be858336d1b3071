use crate::averaging::{AggregateResult, ResultFilter};
use crate::telemetry::{ChannelValues, NodeKey, SensorChannel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 1000;

/// Durable store for completed windows.
#[async_trait]
pub trait AverageSink: Send + Sync {
    async fn write(&self, result: &AggregateResult) -> Result<()>;

    /// Most recent stored windows first.
    async fn query(&self, filter: &ResultFilter, limit: u32) -> Result<Vec<AggregateResult>>;
}

pub fn clamp_history_limit(limit: u32) -> u32 {
    if limit == 0 {
        DEFAULT_HISTORY_LIMIT
    } else {
        limit.min(MAX_HISTORY_LIMIT)
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct TimescaleSink {
    pool: PgPool,
}

impl TimescaleSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = build_pool(database_url, max_connections)
            .await
            .context("connecting to averages database")?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let mut ddl = String::from(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_averages (
                greenhouse_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                window_start TIMESTAMPTZ NOT NULL,
                duration_seconds DOUBLE PRECISION NOT NULL,
                readings BIGINT NOT NULL"#,
        );
        for channel in SensorChannel::ALL {
            ddl.push_str(",\n                ");
            ddl.push_str(channel.column());
            ddl.push_str(" DOUBLE PRECISION NULL");
        }
        ddl.push_str(",\n                PRIMARY KEY (greenhouse_id, node_id, ts)\n            )");

        sqlx::query(&ddl).execute(&self.pool).await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS sensor_averages_ts_idx
            ON sensor_averages (ts DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Plain Postgres has no create_hypertable; the table still works.
        if let Err(err) = sqlx::query(
            "SELECT create_hypertable('sensor_averages', 'ts', if_not_exists => TRUE, migrate_data => TRUE)",
        )
        .execute(&self.pool)
        .await
        {
            tracing::info!(error = %err, "sensor_averages left as a regular table");
        }

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl AverageSink for TimescaleSink {
    async fn write(&self, result: &AggregateResult) -> Result<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sensor_averages (greenhouse_id, node_id, ts, window_start, duration_seconds, readings",
        );
        for channel in SensorChannel::ALL {
            builder.push(", ");
            builder.push(channel.column());
        }
        builder.push(") VALUES (");
        {
            let mut values = builder.separated(", ");
            values
                .push_bind(&result.key.greenhouse_id)
                .push_bind(&result.key.node_id)
                .push_bind(result.window_end)
                .push_bind(result.window_start)
                .push_bind(result.duration_seconds)
                .push_bind(i64::try_from(result.reading_count).unwrap_or(i64::MAX));
            for channel in SensorChannel::ALL {
                values.push_bind(result.average(channel));
            }
        }
        builder.push(") ON CONFLICT (greenhouse_id, node_id, ts) DO NOTHING");

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn query(&self, filter: &ResultFilter, limit: u32) -> Result<Vec<AggregateResult>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT greenhouse_id, node_id, ts, window_start, duration_seconds, readings",
        );
        for channel in SensorChannel::ALL {
            builder.push(", ");
            builder.push(channel.column());
        }
        builder.push(" FROM sensor_averages WHERE TRUE");
        if let Some(greenhouse_id) = &filter.greenhouse_id {
            builder.push(" AND greenhouse_id = ").push_bind(greenhouse_id);
        }
        if let Some(node_id) = &filter.node_id {
            builder.push(" AND node_id = ").push_bind(node_id);
        }
        builder
            .push(" ORDER BY ts DESC LIMIT ")
            .push_bind(i64::from(clamp_history_limit(limit)));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_result).collect()
    }
}

fn row_to_result(row: &PgRow) -> Result<AggregateResult> {
    let mut averages = ChannelValues::default();
    for channel in SensorChannel::ALL {
        averages.set(channel, row.try_get::<Option<f64>, _>(channel.column())?);
    }

    Ok(AggregateResult {
        key: NodeKey::new(
            row.try_get::<String, _>("greenhouse_id")?,
            row.try_get::<String, _>("node_id")?,
        ),
        window_start: row.try_get::<DateTime<Utc>, _>("window_start")?,
        window_end: row.try_get::<DateTime<Utc>, _>("ts")?,
        duration_seconds: row.try_get::<f64, _>("duration_seconds")?,
        reading_count: row.try_get::<i64, _>("readings")?.max(0) as u64,
        averages,
    })
}
