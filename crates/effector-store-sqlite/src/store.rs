//! [`SqliteStore`]: the SQLite implementation of [`DispatchStore`].

use std::{path::Path, time::Duration};

use chrono::{DateTime, SubsecRound as _, Utc};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use effector_core::{
  Error as CoreError,
  catalog::{
    ActionDefinition, EffectTypeDefinition, ImpactMapping, ResolvedEffect, sort_resolved,
  },
  effect_run::{EffectOutcome, EffectRun, EffectRunQuery, EffectRunStatus},
  event::{NewEvent, SystemEvent},
  metric::{EventMetric, OutboxStats},
  outbox::{Claim, ClaimRequest, FailedCycle, OutboxEntry, OutboxQuery, OutboxStatus},
  store::{DispatchStore, EventQuery},
};

use crate::{
  Result,
  encode::{
    EVENT_COLUMNS, OUTBOX_COLUMNS, RUN_COLUMNS, RawEffectRun, RawEvent, RawOutboxEntry,
    decode_outbox_status, decode_run_status, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
};

/// Result of a closure that may reject the operation on domain grounds after
/// reading the database. The outer layer carries SQLite failures.
type Guarded<T> = tokio_rusqlite::Result<effector_core::Result<T>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// An Effector store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Clones share
/// one connection thread; separate [`SqliteStore::open`] calls on the same
/// path get independent connections that coordinate through SQLite locking.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn deadline(from: DateTime<Utc>, after: Duration) -> effector_core::Result<DateTime<Utc>> {
  chrono::Duration::from_std(after)
    .map(|d| from + d)
    .map_err(|e| CoreError::InvalidConfig(format!("duration out of range: {e}")))
}

/// The event id of an entry, if and only if `owner` currently holds its
/// claim.
fn claimed_event_id(
  conn: &Connection,
  entry_id: &str,
  owner: &str,
) -> rusqlite::Result<Option<String>> {
  conn
    .query_row(
      "SELECT event_id FROM outbox
       WHERE id = ?1 AND claimed_by = ?2 AND status = 'processing'",
      rusqlite::params![entry_id, owner],
      |r| r.get(0),
    )
    .optional()
}

fn fetch_outbox(conn: &Connection, entry_id: &str) -> rusqlite::Result<Option<RawOutboxEntry>> {
  conn
    .query_row(
      &format!("SELECT {OUTBOX_COLUMNS} FROM outbox o WHERE o.id = ?1"),
      rusqlite::params![entry_id],
      |row| RawOutboxEntry::from_row(row, 0),
    )
    .optional()
}

fn fetch_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Option<RawEffectRun>> {
  conn
    .query_row(
      &format!("SELECT {RUN_COLUMNS} FROM effect_runs r WHERE r.id = ?1"),
      rusqlite::params![run_id],
      |row| RawEffectRun::from_row(row, 0),
    )
    .optional()
}

/// Caller-supplied counts saturate rather than wrap; SQLite reads a negative
/// `LIMIT` as "no limit".
fn sql_count(n: usize) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

fn claim_lost(entry_id: Uuid, owner: String) -> CoreError {
  CoreError::ClaimLost { entry_id, owner }
}

// ─── DispatchStore impl ──────────────────────────────────────────────────────

impl DispatchStore for SqliteStore {
  type Error = crate::Error;

  // ── Catalog administration ────────────────────────────────────────────────

  async fn register_action(&self, action: ActionDefinition) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO actions (action_name, module, entity_type, is_active, description)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(action_name) DO UPDATE SET
             is_active   = excluded.is_active,
             description = excluded.description",
          rusqlite::params![
            action.action_name,
            action.module,
            action.entity_type,
            action.is_active,
            action.description,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn register_effect_type(&self, effect_type: EffectTypeDefinition) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO effect_types (effect_type, category, is_active, description)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(effect_type) DO UPDATE SET
             is_active   = excluded.is_active,
             description = excluded.description",
          rusqlite::params![
            effect_type.effect_type,
            effect_type.category,
            effect_type.is_active,
            effect_type.description,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn register_mapping(&self, mapping: ImpactMapping) -> Result<()> {
    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let action_known = tx
          .query_row(
            "SELECT 1 FROM actions WHERE action_name = ?1",
            rusqlite::params![mapping.action_name],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !action_known {
          return Ok(Err(CoreError::UnknownAction(mapping.action_name)));
        }

        let effect_known = tx
          .query_row(
            "SELECT 1 FROM effect_types WHERE effect_type = ?1",
            rusqlite::params![mapping.effect_type],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !effect_known {
          return Ok(Err(CoreError::UnknownEffectType(mapping.effect_type)));
        }

        tx.execute(
          "INSERT INTO impact_mappings (action_name, effect_type, priority, is_active)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(action_name, effect_type) DO UPDATE SET
             priority  = excluded.priority,
             is_active = excluded.is_active",
          rusqlite::params![
            mapping.action_name,
            mapping.effect_type,
            mapping.priority,
            mapping.is_active,
          ],
        )?;
        tx.commit()?;
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  async fn set_action_active(&self, action_name: String, active: bool) -> Result<()> {
    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let changed = conn.execute(
          "UPDATE actions SET is_active = ?2 WHERE action_name = ?1",
          rusqlite::params![action_name, active],
        )?;
        if changed == 0 {
          return Ok(Err(CoreError::UnknownAction(action_name)));
        }
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  async fn set_effect_type_active(&self, effect_type: String, active: bool) -> Result<()> {
    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let changed = conn.execute(
          "UPDATE effect_types SET is_active = ?2 WHERE effect_type = ?1",
          rusqlite::params![effect_type, active],
        )?;
        if changed == 0 {
          return Ok(Err(CoreError::UnknownEffectType(effect_type)));
        }
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  async fn set_mapping_active(
    &self,
    action_name: String,
    effect_type: String,
    active:      bool,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let changed = conn.execute(
          "UPDATE impact_mappings SET is_active = ?3
           WHERE action_name = ?1 AND effect_type = ?2",
          rusqlite::params![action_name, effect_type, active],
        )?;
        if changed == 0 {
          return Ok(Err(CoreError::MappingNotFound { action_name, effect_type }));
        }
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  // ── Catalog reads ─────────────────────────────────────────────────────────

  async fn list_actions(&self) -> Result<Vec<ActionDefinition>> {
    let actions = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT action_name, module, entity_type, is_active, description
           FROM actions ORDER BY action_name",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(ActionDefinition {
              action_name: row.get(0)?,
              module:      row.get(1)?,
              entity_type: row.get(2)?,
              is_active:   row.get(3)?,
              description: row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(actions)
  }

  async fn list_effect_types(&self) -> Result<Vec<EffectTypeDefinition>> {
    let effect_types = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT effect_type, category, is_active, description
           FROM effect_types ORDER BY effect_type",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(EffectTypeDefinition {
              effect_type: row.get(0)?,
              category:    row.get(1)?,
              is_active:   row.get(2)?,
              description: row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(effect_types)
  }

  async fn list_mappings(&self) -> Result<Vec<ImpactMapping>> {
    let mappings = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT action_name, effect_type, priority, is_active
           FROM impact_mappings ORDER BY action_name, priority, effect_type",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(ImpactMapping {
              action_name: row.get(0)?,
              effect_type: row.get(1)?,
              priority:    row.get(2)?,
              is_active:   row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(mappings)
  }

  async fn resolve_effects(&self, action_name: String) -> Result<Vec<ResolvedEffect>> {
    let mut resolved = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT m.effect_type, e.category, m.priority
           FROM impact_mappings m
           JOIN actions      a ON a.action_name = m.action_name
           JOIN effect_types e ON e.effect_type = m.effect_type
           WHERE m.action_name = ?1
             AND m.is_active = 1
             AND a.is_active = 1
             AND e.is_active = 1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![action_name], |row| {
            Ok(ResolvedEffect {
              effect_type: row.get(0)?,
              category:    row.get(1)?,
              priority:    row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    sort_resolved(&mut resolved);
    Ok(resolved)
  }

  // ── Events ────────────────────────────────────────────────────────────────

  async fn record_event(&self, input: NewEvent) -> Result<SystemEvent> {
    input.validate()?;

    let event = SystemEvent {
      id:          Uuid::new_v4(),
      event_name:  input.action_name,
      entity_type: input.entity_type,
      entity_id:   input.entity_id,
      module:      input.module,
      // Stored at microsecond precision; truncate so the returned value
      // matches what a later read produces.
      occurred_at: Utc::now().trunc_subsecs(6),
      payload:     input.payload,
    };

    let event_id_str = encode_uuid(event.id);
    let entry_id_str = encode_uuid(Uuid::new_v4());
    let at_str       = encode_dt(event.occurred_at);
    let payload_str  = event.payload.to_string();
    let name         = event.event_name.clone();
    let entity_type  = event.entity_type.clone();
    let entity_id    = event.entity_id.clone();
    let module       = event.module.clone();

    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: Option<bool> = tx
          .query_row(
            "SELECT is_active FROM actions WHERE action_name = ?1",
            rusqlite::params![name],
            |r| r.get(0),
          )
          .optional()?;
        if active != Some(true) {
          return Ok(Err(CoreError::UnknownAction(name)));
        }

        tx.execute(
          "INSERT INTO system_events
             (id, event_name, entity_type, entity_id, module, occurred_at, payload)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            event_id_str,
            name,
            entity_type,
            entity_id,
            module,
            at_str,
            payload_str,
          ],
        )?;
        tx.execute(
          "INSERT INTO outbox
             (id, event_id, status, retry_count, created_at, available_at)
           VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
          rusqlite::params![entry_id_str, event_id_str, at_str],
        )?;
        tx.commit()?;
        Ok(Ok(()))
      })
      .await??;

    Ok(event)
  }

  async fn get_event(&self, id: Uuid) -> Result<Option<SystemEvent>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawEvent> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM system_events e WHERE e.id = ?1"),
            rusqlite::params![id_str],
            |row| RawEvent::from_row(row, 0),
          )
          .optional()?)
      })
      .await?;

    raw.map(RawEvent::into_event).transpose()
  }

  async fn list_events(&self, query: &EventQuery) -> Result<Vec<SystemEvent>> {
    let event_name  = query.event_name.clone();
    let entity_type = query.entity_type.clone();
    let entity_id   = query.entity_id.clone();
    let limit_val   = sql_count(query.limit.unwrap_or(100));
    let offset_val  = sql_count(query.offset.unwrap_or(0));

    let raws: Vec<RawEvent> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {EVENT_COLUMNS} FROM system_events e
           WHERE (?1 IS NULL OR e.event_name  = ?1)
             AND (?2 IS NULL OR e.entity_type = ?2)
             AND (?3 IS NULL OR e.entity_id   = ?3)
           ORDER BY e.occurred_at DESC, e.id
           LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![event_name, entity_type, entity_id, limit_val, offset_val],
            |row| RawEvent::from_row(row, 0),
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEvent::into_event).collect()
  }

  // ── Outbox: claim holder writes ───────────────────────────────────────────

  async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<Claim>> {
    let now         = Utc::now();
    let now_str     = encode_dt(now);
    let until_str   = encode_dt(deadline(now, request.visibility_timeout)?);
    let owner       = request.owner;
    let batch_size  = sql_count(request.batch_size);
    let max_retries = request.max_retries;

    let raws: Vec<(RawOutboxEntry, RawEvent)> = self
      .conn
      .call(move |conn| {
        // IMMEDIATE takes the write lock up front, so no other connection can
        // interleave between selecting candidates and flipping them.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(String, String, u32)> = {
          let mut stmt = tx.prepare(
            "SELECT id, status, retry_count FROM outbox
             WHERE (status = 'pending'    AND available_at  <= ?1)
                OR (status = 'processing' AND claimed_until <  ?1)
             ORDER BY available_at, created_at
             LIMIT ?2",
          )?;
          stmt
            .query_map(rusqlite::params![now_str, batch_size], |r| {
              Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, status, retry_count) in candidates {
          let changed = if status == "processing" {
            // The previous holder abandoned the entry; that costs one retry.
            let retries = retry_count + 1;
            if retries >= max_retries {
              tx.execute(
                "UPDATE outbox
                 SET status = 'failed', retry_count = ?2, last_error = 'claim expired',
                     processed_at = ?3, claimed_by = NULL, claimed_until = NULL
                 WHERE id = ?1 AND status = 'processing' AND claimed_until < ?3",
                rusqlite::params![id, retries, now_str],
              )?;
              continue;
            }
            tx.execute(
              "UPDATE outbox
               SET retry_count = ?2, last_error = 'claim expired',
                   claimed_by = ?3, claimed_until = ?4
               WHERE id = ?1 AND status = 'processing' AND claimed_until < ?5",
              rusqlite::params![id, retries, owner, until_str, now_str],
            )?
          } else {
            tx.execute(
              "UPDATE outbox
               SET status = 'processing', claimed_by = ?2, claimed_until = ?3
               WHERE id = ?1 AND status = 'pending' AND available_at <= ?4",
              rusqlite::params![id, owner, until_str, now_str],
            )?
          };
          if changed == 1 {
            claimed.push(id);
          }
        }

        let mut rows = Vec::with_capacity(claimed.len());
        {
          let mut stmt = tx.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS}, {EVENT_COLUMNS}
             FROM outbox o
             JOIN system_events e ON e.id = o.event_id
             WHERE o.id = ?1"
          ))?;
          for id in &claimed {
            rows.push(stmt.query_row(rusqlite::params![id], |row| {
              Ok((RawOutboxEntry::from_row(row, 0)?, RawEvent::from_row(row, 10)?))
            })?);
          }
        }

        tx.commit()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(entry, event)| {
        Ok(Claim {
          entry: entry.into_entry()?,
          event: event.into_event()?,
        })
      })
      .collect()
  }

  async fn renew_claim(&self, entry_id: Uuid, owner: String, visibility: Duration) -> Result<()> {
    let id_str    = encode_uuid(entry_id);
    let until_str = encode_dt(deadline(Utc::now(), visibility)?);

    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let changed = conn.execute(
          "UPDATE outbox SET claimed_until = ?3
           WHERE id = ?1 AND claimed_by = ?2 AND status = 'processing'",
          rusqlite::params![id_str, owner, until_str],
        )?;
        if changed == 0 {
          return Ok(Err(claim_lost(entry_id, owner)));
        }
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  async fn complete_entry(&self, entry_id: Uuid, owner: String) -> Result<OutboxEntry> {
    let id_str  = encode_uuid(entry_id);
    let now_str = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawOutboxEntry> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(event_id) = claimed_event_id(&tx, &id_str, &owner)? else {
          return Ok(Err(claim_lost(entry_id, owner)));
        };

        let unfinished: i64 = tx.query_row(
          "SELECT COUNT(*) FROM effect_runs
           WHERE event_id = ?1 AND status IN ('pending', 'processing')",
          rusqlite::params![event_id],
          |r| r.get(0),
        )?;
        if unfinished > 0 {
          return Ok(Err(CoreError::UnfinishedEffects {
            entry_id,
            unfinished: unfinished as usize,
          }));
        }

        tx.execute(
          "UPDATE outbox
           SET status = 'completed', processed_at = ?2,
               claimed_by = NULL, claimed_until = NULL
           WHERE id = ?1",
          rusqlite::params![id_str, now_str],
        )?;
        let raw = fetch_outbox(&tx, &id_str)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_entry()
  }

  async fn release_failed(&self, failure: FailedCycle) -> Result<OutboxEntry> {
    let now       = Utc::now();
    let now_str   = encode_dt(now);
    let retry_str = encode_dt(deadline(now, failure.backoff)?);
    let id_str    = encode_uuid(failure.entry_id);
    let entry_id  = failure.entry_id;

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawOutboxEntry> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if claimed_event_id(&tx, &id_str, &failure.owner)?.is_none() {
          return Ok(Err(claim_lost(entry_id, failure.owner)));
        }

        let retry_count: u32 = tx.query_row(
          "SELECT retry_count FROM outbox WHERE id = ?1",
          rusqlite::params![id_str],
          |r| r.get(0),
        )?;
        let retries = retry_count + 1;

        if retries >= failure.max_retries {
          tx.execute(
            "UPDATE outbox
             SET status = 'failed', retry_count = ?2, last_error = ?3,
                 processed_at = ?4, claimed_by = NULL, claimed_until = NULL
             WHERE id = ?1",
            rusqlite::params![id_str, retries, failure.error, now_str],
          )?;
        } else {
          tx.execute(
            "UPDATE outbox
             SET status = 'pending', retry_count = ?2, last_error = ?3,
                 available_at = ?4, claimed_by = NULL, claimed_until = NULL
             WHERE id = ?1",
            rusqlite::params![id_str, retries, failure.error, retry_str],
          )?;
        }

        let raw = fetch_outbox(&tx, &id_str)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_entry()
  }

  // ── Effect runs: claim holder writes ──────────────────────────────────────

  async fn ensure_effect_runs(
    &self,
    entry_id: Uuid,
    owner:    String,
    effects:  Vec<ResolvedEffect>,
  ) -> Result<()> {
    let id_str  = encode_uuid(entry_id);
    let now_str = encode_dt(Utc::now());
    let new_ids: Vec<String> = effects
      .iter()
      .map(|_| encode_uuid(Uuid::new_v4()))
      .collect();

    self
      .conn
      .call(move |conn| -> Guarded<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(event_id) = claimed_event_id(&tx, &id_str, &owner)? else {
          return Ok(Err(claim_lost(entry_id, owner)));
        };

        {
          // The unique (event_id, effect_type) key makes re-resolution after
          // a retry a no-op for runs that already exist.
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO effect_runs
               (id, event_id, effect_type, priority, status, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
          )?;
          for (effect, run_id) in effects.iter().zip(&new_ids) {
            stmt.execute(rusqlite::params![
              run_id,
              event_id,
              effect.effect_type,
              effect.priority,
              now_str,
            ])?;
          }
        }

        tx.commit()?;
        Ok(Ok(()))
      })
      .await??;
    Ok(())
  }

  async fn start_effect_run(
    &self,
    entry_id: Uuid,
    owner:    String,
    run_id:   Uuid,
  ) -> Result<EffectRun> {
    let entry_str = encode_uuid(entry_id);
    let run_str   = encode_uuid(run_id);
    let now_str   = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawEffectRun> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(event_id) = claimed_event_id(&tx, &entry_str, &owner)? else {
          return Ok(Err(claim_lost(entry_id, owner)));
        };

        // A run left `processing` by a crashed worker is restarted as well.
        let changed = tx.execute(
          "UPDATE effect_runs
           SET status = 'processing', attempts = attempts + 1, started_at = ?3
           WHERE id = ?1 AND event_id = ?2 AND status IN ('pending', 'processing')",
          rusqlite::params![run_str, event_id, now_str],
        )?;

        let Some(raw) = fetch_run(&tx, &run_str)? else {
          return Ok(Err(CoreError::EffectRunNotFound(run_id)));
        };
        if changed == 0 {
          return Ok(Err(CoreError::InvalidTransition {
            from: raw.status,
            to:   EffectRunStatus::Processing.to_string(),
          }));
        }

        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_run()
  }

  async fn finish_effect_run(
    &self,
    entry_id: Uuid,
    owner:    String,
    run_id:   Uuid,
    outcome:  EffectOutcome,
  ) -> Result<EffectRun> {
    let entry_str  = encode_uuid(entry_id);
    let run_str    = encode_uuid(run_id);
    let now_str    = encode_dt(Utc::now());
    let status_str = outcome.status().as_str();
    let error      = match outcome {
      EffectOutcome::Succeeded => None,
      EffectOutcome::Failed(reason) => Some(reason),
    };

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawEffectRun> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(event_id) = claimed_event_id(&tx, &entry_str, &owner)? else {
          return Ok(Err(claim_lost(entry_id, owner)));
        };

        let changed = tx.execute(
          "UPDATE effect_runs
           SET status = ?3, error_message = ?4, completed_at = ?5
           WHERE id = ?1 AND event_id = ?2 AND status = 'processing'",
          rusqlite::params![run_str, event_id, status_str, error, now_str],
        )?;

        let Some(raw) = fetch_run(&tx, &run_str)? else {
          return Ok(Err(CoreError::EffectRunNotFound(run_id)));
        };
        if changed == 0 {
          return Ok(Err(CoreError::InvalidTransition {
            from: raw.status,
            to:   status_str.to_owned(),
          }));
        }

        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_run()
  }

  // ── Operator actions ──────────────────────────────────────────────────────

  async fn replay_dead_letter(&self, entry_id: Uuid) -> Result<OutboxEntry> {
    let id_str  = encode_uuid(entry_id);
    let now_str = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawOutboxEntry> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
          "UPDATE outbox
           SET status = 'pending', available_at = ?2, processed_at = NULL,
               claimed_by = NULL, claimed_until = NULL
           WHERE id = ?1 AND status = 'failed'",
          rusqlite::params![id_str, now_str],
        )?;

        let Some(raw) = fetch_outbox(&tx, &id_str)? else {
          return Ok(Err(CoreError::OutboxEntryNotFound(entry_id)));
        };
        if changed == 0 {
          return Ok(Err(CoreError::InvalidTransition {
            from: raw.status,
            to:   OutboxStatus::Pending.to_string(),
          }));
        }

        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_entry()
  }

  async fn rerun_effect(&self, run_id: Uuid) -> Result<EffectRun> {
    let run_str = encode_uuid(run_id);
    let now_str = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| -> Guarded<RawEffectRun> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = fetch_run(&tx, &run_str)? else {
          return Ok(Err(CoreError::EffectRunNotFound(run_id)));
        };
        if run.status != EffectRunStatus::Failed.as_str() {
          return Ok(Err(CoreError::InvalidTransition {
            from: run.status,
            to:   EffectRunStatus::Pending.to_string(),
          }));
        }

        let entry_status: String = tx.query_row(
          "SELECT status FROM outbox WHERE event_id = ?1",
          rusqlite::params![run.event_id],
          |r| r.get(0),
        )?;
        if entry_status == OutboxStatus::Processing.as_str() {
          return Ok(Err(CoreError::InvalidTransition {
            from: entry_status,
            to:   OutboxStatus::Pending.to_string(),
          }));
        }

        tx.execute(
          "UPDATE effect_runs
           SET status = 'pending', error_message = NULL,
               started_at = NULL, completed_at = NULL
           WHERE id = ?1",
          rusqlite::params![run_str],
        )?;
        tx.execute(
          "UPDATE outbox
           SET status = 'pending', available_at = ?2, processed_at = NULL
           WHERE event_id = ?1 AND status IN ('completed', 'failed')",
          rusqlite::params![run.event_id, now_str],
        )?;

        let raw = fetch_run(&tx, &run_str)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await??;

    raw.into_run()
  }

  // ── Monitoring reads ──────────────────────────────────────────────────────

  async fn get_outbox_entry(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(fetch_outbox(conn, &id_str)?))
      .await?;
    raw.map(RawOutboxEntry::into_entry).transpose()
  }

  async fn get_outbox_for_event(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
    let id_str = encode_uuid(event_id);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {OUTBOX_COLUMNS} FROM outbox o WHERE o.event_id = ?1"),
            rusqlite::params![id_str],
            |row| RawOutboxEntry::from_row(row, 0),
          )
          .optional()?)
      })
      .await?;
    raw.map(RawOutboxEntry::into_entry).transpose()
  }

  async fn list_outbox(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>> {
    let status_str = query.status.map(|s| s.as_str().to_owned());
    let limit_val  = sql_count(query.limit.unwrap_or(100));
    let offset_val = sql_count(query.offset.unwrap_or(0));

    let raws: Vec<RawOutboxEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {OUTBOX_COLUMNS} FROM outbox o
           WHERE (?1 IS NULL OR o.status = ?1)
           ORDER BY o.created_at DESC, o.id
           LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![status_str, limit_val, offset_val], |row| {
            RawOutboxEntry::from_row(row, 0)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawOutboxEntry::into_entry).collect()
  }

  async fn list_effect_runs(&self, event_id: Uuid) -> Result<Vec<EffectRun>> {
    let id_str = encode_uuid(event_id);

    let raws: Vec<RawEffectRun> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RUN_COLUMNS} FROM effect_runs r
           WHERE r.event_id = ?1
           ORDER BY r.priority, r.effect_type"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| RawEffectRun::from_row(row, 0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEffectRun::into_run).collect()
  }

  async fn search_effect_runs(&self, query: &EffectRunQuery) -> Result<Vec<EffectRun>> {
    let status_str  = query.status.map(|s| s.as_str().to_owned());
    let effect_type = query.effect_type.clone();
    let limit_val   = sql_count(query.limit.unwrap_or(100));

    let raws: Vec<RawEffectRun> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RUN_COLUMNS} FROM effect_runs r
           WHERE (?1 IS NULL OR r.status      = ?1)
             AND (?2 IS NULL OR r.effect_type = ?2)
           ORDER BY r.created_at DESC, r.id
           LIMIT ?3"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![status_str, effect_type, limit_val], |row| {
            RawEffectRun::from_row(row, 0)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEffectRun::into_run).collect()
  }

  // ── Metrics ───────────────────────────────────────────────────────────────

  async fn increment_metric(&self, event_name: String) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO event_metrics (event_name, event_count) VALUES (?1, 1)
           ON CONFLICT(event_name) DO UPDATE SET event_count = event_count + 1",
          rusqlite::params![event_name],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn top_events(&self, limit: usize) -> Result<Vec<EventMetric>> {
    let limit_val = sql_count(limit);
    let metrics = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT event_name, event_count FROM event_metrics
           ORDER BY event_count DESC, event_name ASC
           LIMIT ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![limit_val], |row| {
            Ok(EventMetric {
              event_name:  row.get(0)?,
              event_count: row.get::<_, i64>(1)? as u64,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(metrics)
  }

  async fn outbox_stats(&self) -> Result<OutboxStats> {
    let (outbox, runs): (Vec<(String, i64)>, Vec<(String, i64)>) = self
      .conn
      .call(|conn| {
        let counts = |sql: &str| -> rusqlite::Result<Vec<(String, i64)>> {
          let mut stmt = conn.prepare(sql)?;
          let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        };
        let outbox = counts("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let runs   = counts("SELECT status, COUNT(*) FROM effect_runs GROUP BY status")?;
        Ok((outbox, runs))
      })
      .await?;

    let mut stats = OutboxStats::default();
    for (status, count) in outbox {
      let count = count as u64;
      match decode_outbox_status(&status)? {
        OutboxStatus::Pending => stats.outbox_pending = count,
        OutboxStatus::Processing => stats.outbox_processing = count,
        OutboxStatus::Completed => stats.outbox_completed = count,
        OutboxStatus::Failed => stats.outbox_failed = count,
      }
    }
    for (status, count) in runs {
      let count = count as u64;
      match decode_run_status(&status)? {
        EffectRunStatus::Pending => stats.effects_pending = count,
        EffectRunStatus::Processing => stats.effects_processing = count,
        EffectRunStatus::Completed => stats.effects_completed = count,
        EffectRunStatus::Failed => stats.effects_failed = count,
      }
    }
    Ok(stats)
  }
}
