//! A `sqlx`/PostgreSQL-backed [`Storage`] implementation.
//!
//! One physical table set per actor-name, matching the table names the
//! `sourcerer-schema` CLI emits (`<name>_commands`, `<name>_events`,
//! `<name>_id_map`, `<name>_links`, `<name>_snapshots`). Table names are
//! built from [`crate::Actor::type_name`], a compile-time `&'static str`
//! fixed by the actor's own type, never caller input, so interpolating it
//! into the query string carries no injection risk.
#![allow(clippy::missing_errors_doc)]

use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::id::{ActorId, EventId};
use crate::identifiers::Identifiers;
use crate::record::{
    AggregateIdMap, CommandRecord, EventRecord, LastEventMap, RawEventRecord, RawSnapshot, Snapshot,
};
use crate::registry::TypeRegistry;
use crate::{Actor, Error, Result};

use super::Storage;

fn to_store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn to_serde_error(e: serde_json::Error) -> Error {
    Error::Validation(e.to_string())
}

fn table(actor_name: &str, suffix: &str) -> String {
    format!("{}_{suffix}", actor_name.to_lowercase())
}

/// A `sqlx`/PostgreSQL-backed [`Storage`] implementation.
pub struct SqlxPostgresStorage<A: Actor> {
    pool: PgPool,
    registry: TypeRegistry<A::Event>,
    _marker: PhantomData<A>,
}

impl<A: Actor> SqlxPostgresStorage<A> {
    /// Creates a storage facade over `pool`, decoding events with
    /// `registry`. Assumes the actor's five tables (as emitted by
    /// `sourcerer-schema`) already exist.
    #[must_use]
    pub fn new(pool: PgPool, registry: TypeRegistry<A::Event>) -> Self {
        Self {
            pool,
            registry,
            _marker: PhantomData,
        }
    }

    /// Returns the underlying connection pool, for sharing across an
    /// aggregate's own facade and its children's.
    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl<A: Actor> Storage<A> for SqlxPostgresStorage<A> {
    type Tx = Transaction<'static, Postgres>;

    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Self::Tx> {
        self.pool.begin().await.map_err(to_store_error)
    }

    #[instrument(skip(self, tx))]
    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await.map_err(|e| Error::TransactionAborted(e.to_string()))
    }

    #[instrument(skip(self, tx))]
    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await.map_err(|e| Error::TransactionAborted(e.to_string()))
    }

    #[instrument(skip(self, tx, command), fields(actor_name))]
    async fn add_command(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        command: CommandRecord,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (id, actor_id, type_name, created_on, record) VALUES ($1, $2, $3, $4, $5)",
            table(actor_name, "commands")
        );
        let record = serde_json::to_value(&command).map_err(to_serde_error)?;
        sqlx::query(&query)
            .bind(command.id.as_uuid())
            .bind(command.handled_by.as_uuid())
            .bind(&command.type_name)
            .bind(command.created_on.0)
            .bind(record)
            .execute(&mut **tx)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self, tx, events))]
    async fn add_events(&self, tx: &mut Self::Tx, events: Vec<EventRecord<A::Event>>) -> Result<()> {
        for event in &events {
            let raw = RawEventRecord::from_typed(event)?;
            let query = format!(
                "INSERT INTO {} (id, actor_id, actor_name, type_name, created_on, record) VALUES ($1, $2, $3, $4, $5, $6)",
                table(&raw.actor_name, "events")
            );
            let record = serde_json::to_value(&raw).map_err(to_serde_error)?;
            sqlx::query(&query)
                .bind(raw.id.as_uuid())
                .bind(raw.actor_id.as_uuid())
                .bind(&raw.actor_name)
                .bind(&raw.type_name)
                .bind(raw.created_on.0)
                .bind(record)
                .execute(&mut **tx)
                .await
                .map_err(to_store_error)?;
        }
        Ok(())
    }

    #[instrument(skip(self, tx, ids), fields(actor_name))]
    async fn add_map(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        ids: &Identifiers,
        id: ActorId,
    ) -> Result<()> {
        let canonical = ids.canonical()?;
        let query = format!(
            "INSERT INTO {} (canonical, actor_id) VALUES ($1, $2) ON CONFLICT (canonical) DO NOTHING",
            table(actor_name, "id_map")
        );
        sqlx::query(&query)
            .bind(&canonical)
            .bind(id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(parent_name, child_name))]
    async fn add_link(
        &self,
        tx: &mut Self::Tx,
        parent_name: &str,
        parent_id: ActorId,
        child_name: &str,
        child_id: ActorId,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (parent_id, child_name, child_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            table(parent_name, "links")
        );
        sqlx::query(&query)
            .bind(parent_id.as_uuid())
            .bind(child_name)
            .bind(child_id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self, tx, snapshot), fields(actor_name, allow_during_partition))]
    async fn add_snapshot(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        snapshot: Snapshot<A::Snapshot>,
        allow_during_partition: bool,
    ) -> Result<()> {
        // Forwarded for back-ends that replicate across partitions; a
        // single-primary Postgres instance has no partition semantics of
        // its own to act on.
        let _ = allow_during_partition;
        let raw = RawSnapshot::from_typed(&snapshot)?;
        let query = format!(
            "INSERT INTO {} (actor_id, version, record) VALUES ($1, $2, $3) \
             ON CONFLICT (actor_id) DO UPDATE SET version = EXCLUDED.version, record = EXCLUDED.record",
            table(actor_name, "snapshots")
        );
        let record = serde_json::to_value(&raw).map_err(to_serde_error)?;
        sqlx::query(&query)
            .bind(raw.actor_id.as_uuid())
            .bind(raw.version as i64)
            .bind(record)
            .execute(&mut **tx)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(actor_name))]
    async fn fetch_id(&self, actor_name: &str, ids: &Identifiers) -> Result<Option<ActorId>> {
        let canonical = ids.canonical()?;
        let query = format!(
            "SELECT actor_id FROM {} WHERE canonical = $1",
            table(actor_name, "id_map")
        );
        let row = sqlx::query(&query)
            .bind(&canonical)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(row.map(|r| ActorId::from_uuid(r.get("actor_id"))))
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_id_map(&self, actor_name: &str, id: ActorId) -> Result<AggregateIdMap> {
        let query = format!(
            "SELECT child_name, child_id FROM {} WHERE parent_id = $1",
            table(actor_name, "links")
        );
        let rows = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)?;
        let mut map = AggregateIdMap::new(actor_name, id);
        for row in rows {
            let child_name: String = row.get("child_name");
            let child_id: uuid::Uuid = row.get("child_id");
            map.add_ids_for(child_name, std::iter::once(ActorId::from_uuid(child_id)));
        }
        Ok(map)
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_latest_snapshot(
        &self,
        actor_name: &str,
        id: ActorId,
    ) -> Result<Option<Snapshot<A::Snapshot>>> {
        let query = format!(
            "SELECT record FROM {} WHERE actor_id = $1",
            table(actor_name, "snapshots")
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(to_store_error)?;
        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("record");
                let raw: RawSnapshot = serde_json::from_value(value).map_err(to_serde_error)?;
                Ok(Some(raw.decode()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
    ) -> Result<Vec<EventRecord<A::Event>>> {
        let query = format!(
            "SELECT record FROM {} WHERE actor_id = $1 AND ($2::uuid IS NULL OR id > $2) ORDER BY id ASC",
            table(actor_name, "events")
        );
        let rows = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(last_event_id.map(|e| e.as_uuid()))
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)?;
        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.get("record");
                let raw: RawEventRecord = serde_json::from_value(value).map_err(to_serde_error)?;
                raw.decode(&self.registry)
            })
            .collect()
    }

    #[instrument(skip(self, last_events), fields(actor_name))]
    async fn fetch_aggregated_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
        last_events: &LastEventMap,
    ) -> Result<Vec<EventRecord<A::Event>>> {
        let mut merged = self.fetch_events_since(actor_name, id, last_event_id).await?;
        for (child_name, child_ids) in &last_events.0 {
            for (child_id, resume_point) in child_ids {
                let resume = if resume_point.is_nil() { None } else { Some(*resume_point) };
                merged.extend(self.fetch_events_since(child_name, *child_id, resume).await?);
            }
        }
        merged.sort_by_key(|e| e.id);
        Ok(merged)
    }
}
