//! Relational store for predictors, races and predictions.
//!
//! Every multi-statement write runs in a single transaction. Predictor
//! counters are always re-derived from the predictions table, never
//! incremented in place.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use thiserror::Error;
use tipster_core::{
    CanonicalRaceId, Grade, KeyError, Outcome, PlaceholderKey, Prediction, PredictionId,
    Predictor, PredictorId, PredictorSighting, Race, RaceAttributes, RaceKey, RaceRowId,
    ReliabilityTier, Surface, WorkPhase,
};
use tracing::{debug, info};

const RACE_COLUMNS: &str = "id, race_key, name, race_date, venue, surface, distance_m, grade, \
     field_size, track_condition, resolve_failures, enrich_failures";

const PREDICTION_COLUMNS: &str = "id, predictor_id, race_id, lookup_key, outcome, payout, roi";

const PREDICTOR_COLUMNS: &str =
    "id, external_key, name, total_predictions, grade_predictions, reliability";

// `LIKE 'temp_%'` would treat the underscore as a wildcard.
const IS_PLACEHOLDER: &str = "substr(race_key, 1, 5) = 'temp_'";

const IS_UNENRICHED: &str = "(surface = 'unknown' OR distance_m = 0)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("preparing database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("race {race} holds a malformed value: {source}")]
    Decode {
        race: i64,
        #[source]
        source: KeyError,
    },
    #[error("race holding {key} disappeared while merging into it")]
    MergeTargetMissing { key: String },
}

/// Result of writing a canonical identifier onto a placeholder race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Updated,
    Merged {
        into: RaceRowId,
        moved_predictions: u64,
    },
    /// The row was already canonical or no longer exists; nothing was written.
    AlreadyResolved,
}

/// One bounded page of backlog, selected by predicate and row-id watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPage {
    pub after: RaceRowId,
    pub limit: u32,
    /// Units with at least this many recorded failures are left out. 0 disables.
    pub quarantine_after: u32,
    pub graded_only: bool,
}

impl PendingPage {
    pub fn first(limit: u32, quarantine_after: u32) -> Self {
        Self {
            after: RaceRowId(0),
            limit,
            quarantine_after,
            graded_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BacklogCounts {
    pub predictors: i64,
    pub predictions: i64,
    pub races: i64,
    pub placeholders: i64,
    pub unenriched: i64,
    pub quarantined_resolve: i64,
    pub quarantined_enrich: i64,
}

impl BacklogCounts {
    pub fn is_drained(&self) -> bool {
        self.placeholders == 0 && self.unenriched == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceSummary {
    pub race: Race,
    pub prediction_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub predictor_id: PredictorId,
    pub inserted: u64,
    pub skipped: u64,
    pub reliability: ReliabilityTier,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewPrediction {
    pub lookup_key: Option<i64>,
    pub outcome: Outcome,
    pub payout: Option<i64>,
    pub roi: Option<f64>,
}

#[derive(Debug, FromRow)]
struct RaceRecord {
    id: i64,
    race_key: String,
    name: String,
    race_date: Option<NaiveDate>,
    venue: Option<String>,
    surface: String,
    distance_m: i64,
    grade: Option<String>,
    field_size: Option<i64>,
    track_condition: Option<String>,
    resolve_failures: i64,
    enrich_failures: i64,
}

impl RaceRecord {
    fn into_race(self) -> Result<Race, StoreError> {
        let race = self.id;
        let decode = move |source| StoreError::Decode { race, source };
        let key = RaceKey::parse(&self.race_key).map_err(decode)?;
        let surface = Surface::from_str(&self.surface).map_err(decode)?;
        let grade = match self.grade.as_deref() {
            Some(label) => {
                Some(Grade::parse_label(label).ok_or_else(|| decode(KeyError::UnknownGrade(label.to_string())))?)
            }
            None => None,
        };
        Ok(Race {
            id: RaceRowId(self.id),
            key,
            name: self.name,
            race_date: self.race_date,
            venue: self.venue,
            surface,
            distance_m: clamp_u32(self.distance_m),
            grade,
            field_size: self.field_size.map(clamp_u32),
            track_condition: self.track_condition,
            resolve_failures: clamp_u32(self.resolve_failures),
            enrich_failures: clamp_u32(self.enrich_failures),
        })
    }
}

#[derive(Debug, FromRow)]
struct RaceSummaryRecord {
    #[sqlx(flatten)]
    race: RaceRecord,
    prediction_count: i64,
}

#[derive(Debug, FromRow)]
struct PredictionRecord {
    id: i64,
    predictor_id: i64,
    race_id: i64,
    lookup_key: Option<i64>,
    outcome: String,
    payout: Option<i64>,
    roi: Option<f64>,
}

impl From<PredictionRecord> for Prediction {
    fn from(row: PredictionRecord) -> Self {
        Self {
            id: PredictionId(row.id),
            predictor_id: PredictorId(row.predictor_id),
            race_id: RaceRowId(row.race_id),
            lookup_key: row.lookup_key,
            outcome: outcome_from_column(&row.outcome),
            payout: row.payout,
            roi: row.roi,
        }
    }
}

#[derive(Debug, FromRow)]
struct PredictorRecord {
    id: i64,
    external_key: i64,
    name: String,
    total_predictions: i64,
    grade_predictions: i64,
    reliability: String,
}

impl From<PredictorRecord> for Predictor {
    fn from(row: PredictorRecord) -> Self {
        Self {
            id: PredictorId(row.id),
            external_key: row.external_key,
            name: row.name,
            total_predictions: row.total_predictions,
            grade_predictions: row.grade_predictions,
            reliability: ReliabilityTier::from_str(&row.reliability).unwrap_or_default(),
        }
    }
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn outcome_from_column(value: &str) -> Outcome {
    match value {
        "hit" => Outcome::Hit,
        "miss" => Outcome::Miss,
        _ => Outcome::Unknown,
    }
}

fn outcome_column(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Hit => "hit",
        Outcome::Miss => "miss",
        Outcome::Unknown => "unknown",
    }
}

fn failure_column(phase: WorkPhase) -> &'static str {
    match phase {
        WorkPhase::Resolve => "resolve_failures",
        WorkPhase::Enrich => "enrich_failures",
    }
}

#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Opens (creating if needed) the database at `url`, e.g. `sqlite://data/tipster.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && parent != Path::new("/") {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        debug!(url, "entity store connected");
        Ok(Self { pool })
    }

    /// A private, migrated in-memory database. One pinned connection, since
    /// every SQLite memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_predictor(&self, external_key: i64, name: &str) -> Result<PredictorId, StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_predictor(&mut conn, external_key, name).await
    }

    pub async fn insert_race(
        &self,
        key: &RaceKey,
        name: &str,
        grade: Option<Grade>,
    ) -> Result<RaceRowId, StoreError> {
        let id: i64 = sqlx::query_scalar("INSERT INTO races (race_key, name, grade) VALUES (?, ?, ?) RETURNING id")
            .bind(key.as_str())
            .bind(name)
            .bind(grade.map(Grade::as_str))
            .fetch_one(&self.pool)
            .await?;
        Ok(RaceRowId(id))
    }

    /// Inserts one prediction and re-derives its predictor's counters.
    pub async fn insert_prediction(
        &self,
        predictor: PredictorId,
        race: RaceRowId,
        prediction: &NewPrediction,
    ) -> Result<PredictionId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_prediction(&mut tx, predictor, race, prediction).await?;
        refresh_predictor_stats(&mut tx, predictor).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Records one predictor sighting: upserts the predictor, files every
    /// unseen prediction under a fresh placeholder race, then re-derives the
    /// predictor's counters and tier.
    pub async fn ingest_sighting(&self, sighting: &PredictorSighting) -> Result<IngestSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let predictor_id = upsert_predictor(&mut tx, sighting.external_key, &sighting.name).await?;

        let mut inserted = 0;
        let mut skipped = 0;
        for draft in &sighting.predictions {
            if let Some(lookup_key) = draft.lookup_key {
                let seen: Option<i64> = sqlx::query_scalar("SELECT id FROM predictions WHERE lookup_key = ?")
                    .bind(lookup_key)
                    .fetch_optional(&mut *tx)
                    .await?;
                if seen.is_some() {
                    skipped += 1;
                    continue;
                }
            }

            let sequence: i64 = sqlx::query_scalar(
                "UPDATE sequences SET value = value + 1 WHERE name = 'placeholder' RETURNING value",
            )
            .fetch_one(&mut *tx)
            .await?;
            let key = PlaceholderKey::new(sighting.external_key, sequence);

            let race_id: i64 = sqlx::query_scalar(
                "INSERT INTO races (race_key, name, race_date, venue, grade) VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(key.as_str())
            .bind(&draft.race_name)
            .bind(draft.race_date)
            .bind(draft.venue.as_deref())
            .bind(draft.grade.map(Grade::as_str))
            .fetch_one(&mut *tx)
            .await?;

            let prediction = NewPrediction {
                lookup_key: draft.lookup_key,
                outcome: draft.outcome,
                payout: draft.payout,
                roi: draft.roi(),
            };
            insert_prediction(&mut tx, predictor_id, RaceRowId(race_id), &prediction).await?;
            inserted += 1;
        }

        let reliability = refresh_predictor_stats(&mut tx, predictor_id).await?;
        tx.commit().await?;

        info!(
            predictor = sighting.external_key,
            inserted,
            skipped,
            reliability = reliability.as_str(),
            "sighting ingested"
        );
        Ok(IngestSummary {
            predictor_id,
            inserted,
            skipped,
            reliability,
        })
    }

    pub async fn race(&self, id: RaceRowId) -> Result<Option<Race>, StoreError> {
        let row: Option<RaceRecord> = sqlx::query_as(&format!("SELECT {RACE_COLUMNS} FROM races WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RaceRecord::into_race).transpose()
    }

    pub async fn race_by_key(&self, key: &str) -> Result<Option<Race>, StoreError> {
        let row: Option<RaceRecord> =
            sqlx::query_as(&format!("SELECT {RACE_COLUMNS} FROM races WHERE race_key = ?"))
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(RaceRecord::into_race).transpose()
    }

    pub async fn predictor(&self, id: PredictorId) -> Result<Option<Predictor>, StoreError> {
        let row: Option<PredictorRecord> =
            sqlx::query_as(&format!("SELECT {PREDICTOR_COLUMNS} FROM predictors WHERE id = ?"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Predictor::from))
    }

    /// The lowest-numbered prediction under `race` that carries a lookup key.
    pub async fn lookup_key_for_race(&self, race: RaceRowId) -> Result<Option<i64>, StoreError> {
        let key = sqlx::query_scalar(
            "SELECT lookup_key FROM predictions WHERE race_id = ? AND lookup_key IS NOT NULL ORDER BY id LIMIT 1",
        )
        .bind(race.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    pub async fn predictions_for_race(&self, race: RaceRowId) -> Result<Vec<Prediction>, StoreError> {
        let rows: Vec<PredictionRecord> = sqlx::query_as(&format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE race_id = ? ORDER BY id"
        ))
        .bind(race.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Prediction::from).collect())
    }

    pub async fn pending_resolution(&self, page: &PendingPage) -> Result<Vec<RaceRowId>, StoreError> {
        self.pending(IS_PLACEHOLDER, WorkPhase::Resolve, page).await
    }

    pub async fn pending_enrichment(&self, page: &PendingPage) -> Result<Vec<RaceRowId>, StoreError> {
        let predicate = format!("NOT {IS_PLACEHOLDER} AND {IS_UNENRICHED}");
        self.pending(&predicate, WorkPhase::Enrich, page).await
    }

    async fn pending(
        &self,
        predicate: &str,
        phase: WorkPhase,
        page: &PendingPage,
    ) -> Result<Vec<RaceRowId>, StoreError> {
        let failures = failure_column(phase);
        let sql = format!(
            "SELECT id FROM races \
             WHERE {predicate} AND id > ? \
               AND (? = 0 OR {failures} < ?) \
               AND (? = 0 OR grade IS NOT NULL) \
             ORDER BY id LIMIT ?"
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(page.after.0)
            .bind(i64::from(page.quarantine_after))
            .bind(i64::from(page.quarantine_after))
            .bind(page.graded_only)
            .bind(i64::from(page.limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(RaceRowId).collect())
    }

    /// Writes `canonical` onto the placeholder race `id`. If another race
    /// already holds `canonical`, the placeholder's predictions move to that
    /// race and the placeholder row is deleted. Either way one transaction.
    pub async fn assign_canonical_id(
        &self,
        id: RaceRowId,
        canonical: &CanonicalRaceId,
    ) -> Result<AssignOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT race_key FROM races WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        match current.as_deref().map(RaceKey::parse) {
            Some(Ok(RaceKey::Placeholder(_))) => {}
            _ => return Ok(AssignOutcome::AlreadyResolved),
        }

        let write = sqlx::query("UPDATE races SET race_key = ? WHERE id = ?")
            .bind(canonical.as_str())
            .bind(id.0)
            .execute(&mut *tx)
            .await;

        match write {
            Ok(_) => {
                tx.commit().await?;
                debug!(race = %id, canonical = %canonical, "placeholder resolved in place");
                Ok(AssignOutcome::Updated)
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                let outcome = merge_into_existing(&mut tx, id, canonical).await?;
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes every present attribute in one UPDATE; absent ones and unknown
    /// sentinels leave the stored value alone. Returns the race as stored
    /// afterwards, or `None` if the row is gone.
    pub async fn apply_race_attributes(
        &self,
        id: RaceRowId,
        attrs: &RaceAttributes,
    ) -> Result<Option<Race>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE races SET \
               name = COALESCE(?, name), \
               race_date = COALESCE(?, race_date), \
               venue = COALESCE(?, venue), \
               surface = COALESCE(?, surface), \
               distance_m = COALESCE(?, distance_m), \
               grade = COALESCE(?, grade), \
               field_size = COALESCE(?, field_size), \
               track_condition = COALESCE(?, track_condition) \
             WHERE id = ?",
        )
        .bind(attrs.name.as_deref().filter(|name| !name.trim().is_empty()))
        .bind(attrs.race_date)
        .bind(attrs.venue.as_deref())
        .bind(attrs.surface.filter(|s| s.is_known()).map(Surface::as_str))
        .bind(attrs.distance_m.filter(|d| *d > 0).map(i64::from))
        .bind(attrs.grade.map(Grade::as_str))
        .bind(attrs.field_size.map(i64::from))
        .bind(attrs.track_condition.as_deref())
        .bind(id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        if attrs.grade.is_some() {
            for predictor in predictors_on_race(&mut tx, id).await? {
                refresh_predictor_stats(&mut tx, predictor).await?;
            }
        }

        let row: RaceRecord = sqlx::query_as(&format!("SELECT {RACE_COLUMNS} FROM races WHERE id = ?"))
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        row.into_race().map(Some)
    }

    /// Bumps the failure counter for `phase` and returns its new
    /// value (0 if the row no longer exists).
    pub async fn record_failure(&self, id: RaceRowId, phase: WorkPhase) -> Result<u32, StoreError> {
        let column = failure_column(phase);
        let count: Option<i64> = sqlx::query_scalar(&format!(
            "UPDATE races SET {column} = {column} + 1 WHERE id = ? RETURNING {column}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(clamp_u32).unwrap_or(0))
    }

    /// Resets failure counters for `phase`, returning how many races were requeued.
    pub async fn clear_failures(&self, phase: WorkPhase) -> Result<u64, StoreError> {
        let column = failure_column(phase);
        let cleared = sqlx::query(&format!("UPDATE races SET {column} = 0 WHERE {column} > 0"))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(cleared)
    }

    pub async fn backlog(&self, quarantine_after: u32) -> Result<BacklogCounts, StoreError> {
        let threshold = i64::from(quarantine_after);
        let (races, placeholders, unenriched, quarantined_resolve, quarantined_enrich): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(&format!(
            "SELECT COUNT(*), \
               COALESCE(SUM(CASE WHEN {IS_PLACEHOLDER} THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN NOT {IS_PLACEHOLDER} AND {IS_UNENRICHED} THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN ? > 0 AND {IS_PLACEHOLDER} AND resolve_failures >= ? THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN ? > 0 AND NOT {IS_PLACEHOLDER} AND {IS_UNENRICHED} AND enrich_failures >= ? THEN 1 ELSE 0 END), 0) \
             FROM races"
        ))
        .bind(threshold)
        .bind(threshold)
        .bind(threshold)
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;

        let predictors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictors")
            .fetch_one(&self.pool)
            .await?;
        let predictions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictions")
            .fetch_one(&self.pool)
            .await?;

        Ok(BacklogCounts {
            predictors,
            predictions,
            races,
            placeholders,
            unenriched,
            quarantined_resolve,
            quarantined_enrich,
        })
    }

    pub async fn predictor_tier_counts(&self) -> Result<Vec<(ReliabilityTier, i64)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT reliability, COUNT(*) FROM predictors GROUP BY reliability")
                .fetch_all(&self.pool)
                .await?;
        let mut counts: Vec<(ReliabilityTier, i64)> = rows
            .into_iter()
            .map(|(tier, count)| (ReliabilityTier::from_str(&tier).unwrap_or_default(), count))
            .collect();
        counts.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(counts)
    }

    /// Races that are both resolved and enriched, newest first.
    pub async fn completed_races(&self, limit: u32) -> Result<Vec<RaceSummary>, StoreError> {
        let rows: Vec<RaceSummaryRecord> = sqlx::query_as(&format!(
            "SELECT {RACE_COLUMNS}, \
               (SELECT COUNT(*) FROM predictions WHERE predictions.race_id = races.id) AS prediction_count \
             FROM races \
             WHERE NOT {IS_PLACEHOLDER} AND NOT {IS_UNENRICHED} \
             ORDER BY race_date DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            summaries.push(RaceSummary {
                race: row.race.into_race()?,
                prediction_count: row.prediction_count,
            });
        }
        Ok(summaries)
    }
}

async fn upsert_predictor(
    conn: &mut SqliteConnection,
    external_key: i64,
    name: &str,
) -> Result<PredictorId, StoreError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO predictors (external_key, name) VALUES (?, ?) \
         ON CONFLICT (external_key) DO UPDATE SET name = excluded.name, updated_at = datetime('now') \
         RETURNING id",
    )
    .bind(external_key)
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(PredictorId(id))
}

async fn insert_prediction(
    conn: &mut SqliteConnection,
    predictor: PredictorId,
    race: RaceRowId,
    prediction: &NewPrediction,
) -> Result<PredictionId, StoreError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO predictions (predictor_id, race_id, lookup_key, outcome, payout, roi) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(predictor.0)
    .bind(race.0)
    .bind(prediction.lookup_key)
    .bind(outcome_column(prediction.outcome))
    .bind(prediction.payout)
    .bind(prediction.roi)
    .fetch_one(&mut *conn)
    .await?;
    Ok(PredictionId(id))
}

async fn predictors_on_race(conn: &mut SqliteConnection, race: RaceRowId) -> Result<Vec<PredictorId>, StoreError> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT predictor_id FROM predictions WHERE race_id = ?")
        .bind(race.0)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids.into_iter().map(PredictorId).collect())
}

/// Re-derives total and grade-tier counts from the predictions table and
/// stores the tier they imply.
async fn refresh_predictor_stats(
    conn: &mut SqliteConnection,
    predictor: PredictorId,
) -> Result<ReliabilityTier, StoreError> {
    let (total, graded): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN r.grade IS NOT NULL THEN 1 ELSE 0 END), 0) \
         FROM predictions p JOIN races r ON r.id = p.race_id \
         WHERE p.predictor_id = ?",
    )
    .bind(predictor.0)
    .fetch_one(&mut *conn)
    .await?;

    let tier = ReliabilityTier::from_grade_predictions(graded);
    sqlx::query(
        "UPDATE predictors SET total_predictions = ?, grade_predictions = ?, reliability = ?, \
           updated_at = datetime('now') \
         WHERE id = ?",
    )
    .bind(total)
    .bind(graded)
    .bind(tier.as_str())
    .bind(predictor.0)
    .execute(&mut *conn)
    .await?;
    Ok(tier)
}

async fn merge_into_existing(
    conn: &mut SqliteConnection,
    placeholder: RaceRowId,
    canonical: &CanonicalRaceId,
) -> Result<AssignOutcome, StoreError> {
    let target: i64 = sqlx::query_scalar("SELECT id FROM races WHERE race_key = ?")
        .bind(canonical.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::MergeTargetMissing {
            key: canonical.to_string(),
        })?;

    // Listing-derived fields the surviving race may not have yet.
    sqlx::query(
        "UPDATE races SET \
           grade = COALESCE(grade, (SELECT grade FROM races WHERE id = ?)), \
           race_date = COALESCE(race_date, (SELECT race_date FROM races WHERE id = ?)), \
           venue = COALESCE(venue, (SELECT venue FROM races WHERE id = ?)) \
         WHERE id = ?",
    )
    .bind(placeholder.0)
    .bind(placeholder.0)
    .bind(placeholder.0)
    .bind(target)
    .execute(&mut *conn)
    .await?;

    let moved = sqlx::query("UPDATE predictions SET race_id = ? WHERE race_id = ?")
        .bind(target)
        .bind(placeholder.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM races WHERE id = ?")
        .bind(placeholder.0)
        .execute(&mut *conn)
        .await?;

    // The survivor may have taken the placeholder's grade, so its own
    // predictors need new counts as well as the moved ones.
    for predictor in predictors_on_race(conn, RaceRowId(target)).await? {
        refresh_predictor_stats(conn, predictor).await?;
    }

    info!(
        placeholder = %placeholder,
        into = target,
        canonical = %canonical,
        moved,
        "placeholder merged into existing race"
    );
    Ok(AssignOutcome::Merged {
        into: RaceRowId(target),
        moved_predictions: moved,
    })
}
