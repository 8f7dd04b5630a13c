//! SQLite-backed person gallery.
//!
//! One row per person in `persons`, with the person's samples serialized as
//! a JSON array in `faces_json` and the average embedding stored as a
//! little-endian f32 BLOB. Sample image files live in `samples_dir`; the
//! store owns them together with the image writer pool.

use crate::error::StoreError;
use crate::index::CosineIndex;
use facegallery_core::{pca, Embedding, DEFAULT_CLASSIFICATION_THRESHOLD, DISTANCE_THRESHOLD, UNKNOWN_NAME};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// File name of the gallery database inside `database_dir`.
pub const DB_FILE_NAME: &str = "persons.db";

/// Above this many persons, cosine search goes through the in-memory index.
pub const INDEX_MIN_PERSONS: usize = 256;

/// Schema migrations; `PRAGMA user_version` counts the applied ones.
const MIGRATIONS: &[&str] = &["CREATE TABLE IF NOT EXISTS persons (
         global_id TEXT PRIMARY KEY,
         name TEXT NOT NULL,
         avg_embedding BLOB NOT NULL,
         classification_threshold REAL NOT NULL,
         last_image_time INTEGER NOT NULL,
         faces_json TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_persons_name ON persons (name);"];

const PERSON_COLUMNS: &str =
    "global_id, name, avg_embedding, classification_threshold, last_image_time, faces_json";

/// One stored face sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Face {
    pub id: String,
    pub embedding: Embedding,
    /// Absolute path of the sample image.
    pub image_path: PathBuf,
    /// Epoch seconds.
    pub created_at: i64,
}

/// A gallery identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub global_id: String,
    pub name: String,
    pub avg_embedding: Embedding,
    pub classification_threshold: f32,
    pub last_image_time: i64,
    /// Samples in admission order. Samples whose image file is missing are
    /// not listed.
    pub faces: Vec<Face>,
}

impl Person {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_NAME
    }

    pub fn num_samples(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub person: Person,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

impl Metric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Cosine => a.cosine_distance(b),
            Metric::Euclidean => a.euclidean_distance(b),
        }
    }
}

/// On-disk form of a face inside `faces_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FaceRecord {
    id: String,
    embedding: Vec<f32>,
    /// Relative to `samples_dir` when the image lives there, absolute otherwise.
    image: String,
    created_at: i64,
}

/// Raw `persons` row.
struct PersonRow {
    global_id: String,
    name: String,
    avg_embedding: Vec<u8>,
    classification_threshold: f64,
    last_image_time: i64,
    faces_json: String,
}

impl PersonRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            global_id: row.get(0)?,
            name: row.get(1)?,
            avg_embedding: row.get(2)?,
            classification_threshold: row.get(3)?,
            last_image_time: row.get(4)?,
            faces_json: row.get(5)?,
        })
    }

    fn records(&self) -> Result<Vec<FaceRecord>, StoreError> {
        Ok(serde_json::from_str(&self.faces_json)?)
    }

    fn avg_embedding(&self) -> Result<Embedding, StoreError> {
        Embedding::from_le_bytes(&self.avg_embedding).ok_or_else(|| StoreError::Corrupt {
            id: self.global_id.clone(),
            reason: format!("avg_embedding BLOB of {} bytes", self.avg_embedding.len()),
        })
    }
}

struct Inner {
    conn: Connection,
    index: Option<CosineIndex>,
    /// `PRAGMA data_version` when the index was built.
    index_version: i64,
}

/// Persistent person gallery.
///
/// All operations serialize on one mutex guarding the connection and the
/// cosine index.
pub struct GalleryStore {
    inner: Mutex<Inner>,
    db_path: PathBuf,
    samples_dir: PathBuf,
}

impl GalleryStore {
    /// Open (or create) the gallery at `<database_dir>/persons.db`.
    pub fn open(database_dir: impl AsRef<Path>, samples_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let database_dir = database_dir.as_ref();
        let samples_dir = samples_dir.as_ref().to_path_buf();
        fs::create_dir_all(database_dir)?;
        fs::create_dir_all(&samples_dir)?;

        let db_path = database_dir.join(DB_FILE_NAME);
        let mut conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        apply_migrations(&mut conn)?;

        let persons: i64 = conn.query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?;
        tracing::info!(path = %db_path.display(), persons, "gallery store opened");

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                index: None,
                index_version: 0,
            }),
            db_path,
            samples_dir,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn samples_dir(&self) -> &Path {
        &self.samples_dir
    }

    /// Fresh sample image path inside `samples_dir`.
    pub fn new_sample_path(&self, extension: &str) -> PathBuf {
        self.samples_dir.join(format!("{}.{extension}", Uuid::new_v4()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    // ── Mutations ──────────────────────────────────────────────────────────

    /// Create a person from a first sample. The image must already exist.
    pub fn create_person(
        &self,
        embedding: &Embedding,
        image_path: &Path,
        timestamp: i64,
        name: Option<&str>,
    ) -> Result<Person, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.create_person_with_id(&id, embedding, image_path, timestamp, name)
    }

    /// Create a person under a caller-chosen id.
    pub fn create_person_with_id(
        &self,
        global_id: &str,
        embedding: &Embedding,
        image_path: &Path,
        timestamp: i64,
        name: Option<&str>,
    ) -> Result<Person, StoreError> {
        self.require_image(image_path)?;
        let name = name.unwrap_or(UNKNOWN_NAME);
        let records = vec![self.new_record(embedding, image_path)];

        let mut inner = self.lock()?;
        let exists = inner
            .conn
            .query_row("SELECT 1 FROM persons WHERE global_id = ?1", [global_id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateId(global_id.to_string()));
        }

        inner.conn.execute(
            "INSERT INTO persons (global_id, name, avg_embedding, classification_threshold, last_image_time, faces_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                global_id,
                name,
                embedding.to_le_bytes(),
                DEFAULT_CLASSIFICATION_THRESHOLD as f64,
                timestamp,
                serde_json::to_string(&records)?,
            ],
        )?;
        if let Some(index) = inner.index.as_mut() {
            index.upsert(global_id, embedding);
        }
        tracing::info!(global_id, name, "person created");

        let person = Person {
            global_id: global_id.to_string(),
            name: name.to_string(),
            avg_embedding: embedding.clone(),
            classification_threshold: DEFAULT_CLASSIFICATION_THRESHOLD,
            last_image_time: timestamp,
            faces: self.faces_from_records(global_id, records),
        };
        Ok(person)
    }

    /// Append a sample to a person and recompute its average embedding.
    pub fn insert_sample(
        &self,
        person_id: &str,
        embedding: &Embedding,
        image_path: &Path,
        timestamp: i64,
    ) -> Result<Person, StoreError> {
        self.require_image(image_path)?;

        let mut inner = self.lock()?;
        let row = load_row(&inner.conn, person_id)?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        let mut records = row.records()?;
        if let Some(first) = records.first() {
            if first.embedding.len() != embedding.dim() {
                return Err(StoreError::DimensionMismatch {
                    expected: first.embedding.len(),
                    actual: embedding.dim(),
                });
            }
        }
        records.push(self.new_record(embedding, image_path));

        let avg = mean_of(person_id, &records)?;
        let last_image_time = row.last_image_time.max(timestamp);
        inner.conn.execute(
            "UPDATE persons SET avg_embedding = ?2, last_image_time = ?3, faces_json = ?4 WHERE global_id = ?1",
            params![person_id, avg.to_le_bytes(), last_image_time, serde_json::to_string(&records)?],
        )?;
        if let Some(index) = inner.index.as_mut() {
            index.upsert(person_id, &avg);
        }
        tracing::info!(global_id = person_id, samples = records.len(), "sample added");

        Ok(Person {
            global_id: row.global_id,
            name: row.name,
            avg_embedding: avg,
            classification_threshold: row.classification_threshold as f32,
            last_image_time,
            faces: self.faces_from_records(person_id, records),
        })
    }

    /// Remove one sample and its image file.
    ///
    /// Returns `true` if this was the person's last sample and the person
    /// was removed with it.
    pub fn remove_sample(&self, person_id: &str, sample_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let row = load_row(&inner.conn, person_id)?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        let mut records = row.records()?;
        let pos = records
            .iter()
            .position(|r| r.id == sample_id)
            .ok_or_else(|| StoreError::SampleNotFound {
                person_id: person_id.to_string(),
                sample_id: sample_id.to_string(),
            })?;
        let removed = records.remove(pos);

        let person_removed = records.is_empty();
        if person_removed {
            inner
                .conn
                .execute("DELETE FROM persons WHERE global_id = ?1", [person_id])?;
            if let Some(index) = inner.index.as_mut() {
                index.remove(person_id);
            }
            tracing::info!(global_id = person_id, "last sample removed; person deleted");
        } else {
            let avg = mean_of(person_id, &records)?;
            inner.conn.execute(
                "UPDATE persons SET avg_embedding = ?2, faces_json = ?3 WHERE global_id = ?1",
                params![person_id, avg.to_le_bytes(), serde_json::to_string(&records)?],
            )?;
            if let Some(index) = inner.index.as_mut() {
                index.upsert(person_id, &avg);
            }
            tracing::info!(global_id = person_id, sample_id, "sample removed");
        }
        drop(inner);

        self.remove_image(&self.resolve(&removed.image));
        Ok(person_removed)
    }

    pub fn rename(&self, person_id: &str, name: &str) -> Result<(), StoreError> {
        let inner = self.lock()?;
        let changed = inner.conn.execute(
            "UPDATE persons SET name = ?2 WHERE global_id = ?1",
            params![person_id, name],
        )?;
        if changed == 0 {
            return Err(StoreError::PersonNotFound(person_id.to_string()));
        }
        tracing::info!(global_id = person_id, name, "person renamed");
        Ok(())
    }

    pub fn set_threshold(&self, person_id: &str, threshold: f32) -> Result<(), StoreError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(StoreError::InvalidThreshold(threshold));
        }
        let inner = self.lock()?;
        let changed = inner.conn.execute(
            "UPDATE persons SET classification_threshold = ?2 WHERE global_id = ?1",
            params![person_id, threshold as f64],
        )?;
        if changed == 0 {
            return Err(StoreError::PersonNotFound(person_id.to_string()));
        }
        Ok(())
    }

    /// Delete a person and every one of its sample images.
    pub fn delete_person(&self, person_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = load_row(&inner.conn, person_id)?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        let records = row.records()?;
        inner
            .conn
            .execute("DELETE FROM persons WHERE global_id = ?1", [person_id])?;
        if let Some(index) = inner.index.as_mut() {
            index.remove(person_id);
        }
        drop(inner);

        for record in &records {
            self.remove_image(&self.resolve(&record.image));
        }
        tracing::info!(global_id = person_id, samples = records.len(), "person deleted");
        Ok(())
    }

    /// Delete every person and every file in `samples_dir`.
    ///
    /// Returns the number of persons removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let removed = inner.conn.execute("DELETE FROM persons", [])?;
        inner.index = None;
        drop(inner);

        let mut files = 0usize;
        for entry in fs::read_dir(&self.samples_dir)? {
            let path = entry?.path();
            if path.is_file() {
                self.remove_image(&path);
                files += 1;
            }
        }
        tracing::info!(persons = removed, files, "gallery cleared");
        Ok(removed)
    }

    // ── Queries ────────────────────────────────────────────────────────────

    /// All persons in insertion order.
    pub fn get_all(&self, only_unknowns: bool) -> Result<Vec<Person>, StoreError> {
        let rows = {
            let inner = self.lock()?;
            let sql = if only_unknowns {
                format!("SELECT {PERSON_COLUMNS} FROM persons WHERE name = ?1 ORDER BY rowid")
            } else {
                format!("SELECT {PERSON_COLUMNS} FROM persons WHERE ?1 IS NOT NULL ORDER BY rowid")
            };
            let mut stmt = inner.conn.prepare(&sql)?;
            let rows = stmt
                .query_map([UNKNOWN_NAME], PersonRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    pub fn get_by_id(&self, person_id: &str) -> Result<Option<Person>, StoreError> {
        let row = load_row(&self.lock()?.conn, person_id)?;
        row.map(|r| self.decode(r)).transpose()
    }

    /// First person (by insertion order) with this name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Person>, StoreError> {
        let row = {
            let inner = self.lock()?;
            inner
                .conn
                .query_row(
                    &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE name = ?1 ORDER BY rowid LIMIT 1"),
                    [name],
                    PersonRow::from_row,
                )
                .optional()?
        };
        row.map(|r| self.decode(r)).transpose()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        count_rows(&inner.conn)
    }

    pub fn num_samples(&self, person_id: &str) -> Result<usize, StoreError> {
        self.get_by_id(person_id)?
            .map(|p| p.num_samples())
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))
    }

    pub fn last_image_time(&self, person_id: &str) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        inner
            .conn
            .query_row(
                "SELECT last_image_time FROM persons WHERE global_id = ?1",
                [person_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))
    }

    // ── Search ─────────────────────────────────────────────────────────────

    /// Nearest person by cosine distance to the average embedding.
    pub fn search(&self, embedding: &Embedding) -> Result<Option<SearchHit>, StoreError> {
        Ok(self.search_k(embedding, 1, Metric::Cosine)?.into_iter().next())
    }

    /// Up to `k` nearest persons, nearest first. Ties keep insertion order.
    pub fn search_k(&self, embedding: &Embedding, k: usize, metric: Metric) -> Result<Vec<SearchHit>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = {
            let mut inner = self.lock()?;
            let ranked: Vec<(String, f32)> =
                if metric == Metric::Cosine && count_rows(&inner.conn)? > INDEX_MIN_PERSONS {
                    let index = inner.fresh_index()?;
                    index
                        .search(embedding, k)
                        .into_iter()
                        .map(|(id, d)| (id.to_string(), d))
                        .collect()
                } else {
                    linear_scan(&inner.conn, embedding, k, metric)?
                };

            let mut rows = Vec::with_capacity(ranked.len());
            for (id, distance) in ranked {
                if let Some(row) = load_row(&inner.conn, &id)? {
                    rows.push((row, distance));
                }
            }
            rows
        };

        rows.into_iter()
            .map(|(row, distance)| Ok(SearchHit { person: self.decode(row)?, distance }))
            .collect()
    }

    /// Rebuild the in-memory cosine index from the database.
    ///
    /// Returns the number of indexed persons.
    pub fn rebuild_index(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        inner.index = None;
        Ok(inner.fresh_index()?.len())
    }

    // ── Calibration ────────────────────────────────────────────────────────

    /// Recompute per-person classification thresholds from sample spread.
    ///
    /// Each person with at least two samples gets the area `π·σ₁·σ₂` of its
    /// samples reduced to 2-D. Areas are min-max normalized across those
    /// persons and mapped to `1 − norm·DISTANCE_THRESHOLD`: the tightest
    /// cluster gets 1.0, the loosest gets the default. Returns the number of
    /// persons updated.
    pub fn calibrate_thresholds(&self) -> Result<usize, StoreError> {
        let persons = self.get_all(false)?;
        let mut areas = Vec::new();
        for person in persons.iter().filter(|p| p.faces.len() >= 2) {
            let samples: Vec<&[f32]> = person
                .faces
                .iter()
                .map(|f| f.embedding.values.as_slice())
                .collect();
            areas.push((person.global_id.as_str(), pca::ellipse_area(&samples)?));
        }
        if areas.is_empty() {
            tracing::info!("no person has enough samples to calibrate");
            return Ok(0);
        }

        let min = areas.iter().map(|(_, a)| *a).fold(f64::INFINITY, f64::min);
        let max = areas.iter().map(|(_, a)| *a).fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;

        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        let mut updated = 0;
        for (id, area) in &areas {
            let norm = if range > 0.0 { (area - min) / range } else { 0.0 };
            let threshold = 1.0 - norm * DISTANCE_THRESHOLD as f64;
            updated += tx.execute(
                "UPDATE persons SET classification_threshold = ?2 WHERE global_id = ?1",
                params![id, threshold],
            )?;
            tracing::debug!(global_id = id, area, threshold, "threshold calibrated");
        }
        tx.commit()?;
        tracing::info!(persons = updated, "thresholds calibrated");
        Ok(updated)
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    fn require_image(&self, image_path: &Path) -> Result<(), StoreError> {
        if image_path.is_file() {
            Ok(())
        } else {
            Err(StoreError::MissingImage(image_path.to_path_buf()))
        }
    }

    fn new_record(&self, embedding: &Embedding, image_path: &Path) -> FaceRecord {
        FaceRecord {
            id: Uuid::new_v4().to_string(),
            embedding: embedding.values.clone(),
            image: self.relativize(image_path),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    fn relativize(&self, path: &Path) -> String {
        path.strip_prefix(&self.samples_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn resolve(&self, image: &str) -> PathBuf {
        let path = Path::new(image);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.samples_dir.join(path)
        }
    }

    fn remove_image(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "sample image removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "sample image already missing")
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove sample image"),
        }
    }

    /// Faces whose image file exists; missing ones are logged and skipped.
    fn faces_from_records(&self, person_id: &str, records: Vec<FaceRecord>) -> Vec<Face> {
        records
            .into_iter()
            .filter_map(|r| {
                let image_path = self.resolve(&r.image);
                if !image_path.is_file() {
                    tracing::warn!(
                        global_id = person_id,
                        sample_id = %r.id,
                        path = %image_path.display(),
                        "sample image missing; skipping"
                    );
                    return None;
                }
                Some(Face {
                    id: r.id,
                    embedding: Embedding::new(r.embedding),
                    image_path,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    fn decode(&self, row: PersonRow) -> Result<Person, StoreError> {
        let avg_embedding = row.avg_embedding()?;
        let records = row.records()?;
        let faces = self.faces_from_records(&row.global_id, records);
        Ok(Person {
            global_id: row.global_id,
            name: row.name,
            avg_embedding,
            classification_threshold: row.classification_threshold as f32,
            last_image_time: row.last_image_time,
            faces,
        })
    }
}

impl Inner {
    /// The cosine index, rebuilt if missing or if another connection wrote
    /// to the database since it was built.
    fn fresh_index(&mut self) -> Result<&CosineIndex, StoreError> {
        let version = data_version(&self.conn)?;
        let stale = self.index.is_none() || version != self.index_version;
        if stale {
            if self.index.is_some() {
                tracing::debug!("database changed externally; rebuilding cosine index");
            }
            let mut stmt = self
                .conn
                .prepare("SELECT global_id, avg_embedding FROM persons ORDER BY rowid")?;
            let entries = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let decoded: Vec<(String, Embedding)> = entries
                .into_iter()
                .filter_map(|(id, blob)| Embedding::from_le_bytes(&blob).map(|e| (id, e)))
                .collect();
            let index = CosineIndex::build(decoded.iter().map(|(id, e)| (id.as_str(), e)));
            tracing::info!(persons = index.len(), "cosine index built");
            self.index = Some(index);
            self.index_version = version;
        }
        self.index
            .as_ref()
            .ok_or_else(|| StoreError::Corrupt {
                id: "index".into(),
                reason: "cosine index unavailable".into(),
            })
    }
}

fn apply_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let current = usize::try_from(current).unwrap_or(0);
    if current > MIGRATIONS.len() {
        tracing::warn!(
            version = current,
            known = MIGRATIONS.len(),
            "database schema is newer than this build"
        );
        return Ok(());
    }
    for (i, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (i + 1) as i64)?;
        tx.commit()?;
        tracing::info!(version = i + 1, "applied schema migration");
    }
    Ok(())
}

fn data_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA data_version", [], |r| r.get(0))?)
}

fn count_rows(conn: &Connection) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn load_row(conn: &Connection, person_id: &str) -> Result<Option<PersonRow>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE global_id = ?1"),
            [person_id],
            PersonRow::from_row,
        )
        .optional()?)
}

fn mean_of(person_id: &str, records: &[FaceRecord]) -> Result<Embedding, StoreError> {
    let embeddings: Vec<Embedding> = records
        .iter()
        .map(|r| Embedding::new(r.embedding.clone()))
        .collect();
    Embedding::mean(&embeddings).ok_or_else(|| StoreError::Corrupt {
        id: person_id.to_string(),
        reason: "samples have inconsistent embedding dimensions".into(),
    })
}

/// Rank every person by `metric`, nearest first, keeping insertion order
/// among equal distances.
fn linear_scan(
    conn: &Connection,
    embedding: &Embedding,
    k: usize,
    metric: Metric,
) -> Result<Vec<(String, f32)>, StoreError> {
    let mut stmt = conn.prepare("SELECT global_id, avg_embedding FROM persons ORDER BY rowid")?;
    let mut rows = stmt.query([])?;
    let mut ranked = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let Some(avg) = Embedding::from_le_bytes(&blob) else {
            tracing::warn!(global_id = %id, "unreadable avg_embedding; skipping");
            continue;
        };
        if avg.dim() != embedding.dim() {
            tracing::debug!(global_id = %id, "embedding dimension differs; skipping");
            continue;
        }
        ranked.push((id, metric.distance(embedding, &avg)));
    }
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(k);
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: GalleryStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path().join("database"), dir.path().join("faces")).unwrap();
        Fixture { _dir: dir, store }
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    /// Write a placeholder sample image and return its path.
    fn image(store: &GalleryStore) -> PathBuf {
        let path = store.new_sample_path("jpeg");
        fs::write(&path, b"jpeg").unwrap();
        path
    }

    fn assert_mean_invariant(person: &Person) {
        let mean = Embedding::mean(person.faces.iter().map(|f| &f.embedding)).unwrap();
        for (a, b) in mean.values.iter().zip(person.avg_embedding.values.iter()) {
            assert!((a - b).abs() < 1e-6, "avg {:?} != mean {:?}", person.avg_embedding, mean);
        }
    }

    #[test]
    fn test_empty_store_search_is_none() {
        let f = fixture();
        assert!(f.store.search(&emb(&[1.0, 0.0])).unwrap().is_none());
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[test]
    fn test_create_then_search_returns_same_person() {
        let f = fixture();
        let e = emb(&[0.2, 0.4, -0.1]);
        let p = f.store.create_person(&e, &image(&f.store), 100, None).unwrap();
        assert_eq!(p.name, UNKNOWN_NAME);
        assert_eq!(p.classification_threshold, DEFAULT_CLASSIFICATION_THRESHOLD);

        let hit = f.store.search(&e).unwrap().unwrap();
        assert_eq!(hit.person.global_id, p.global_id);
        assert!(hit.distance.abs() < 1e-6);
        assert_eq!(hit.person, p);
    }

    #[test]
    fn test_create_refuses_missing_image() {
        let f = fixture();
        let missing = f.store.samples_dir().join("nope.jpeg");
        assert!(matches!(
            f.store.create_person(&emb(&[1.0]), &missing, 0, None),
            Err(StoreError::MissingImage(_))
        ));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let f = fixture();
        f.store
            .create_person_with_id("p1", &emb(&[1.0]), &image(&f.store), 0, None)
            .unwrap();
        assert!(matches!(
            f.store.create_person_with_id("p1", &emb(&[1.0]), &image(&f.store), 0, None),
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_insert_sample_keeps_mean_and_last_time() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0, 0.0]), &image(&f.store), 100, None).unwrap();
        let p = f
            .store
            .insert_sample(&p.global_id, &emb(&[0.0, 1.0]), &image(&f.store), 50)
            .unwrap();
        assert_eq!(p.faces.len(), 2);
        assert_eq!(p.avg_embedding.values, vec![0.5, 0.5]);
        // Never moves backwards.
        assert_eq!(p.last_image_time, 100);
        assert_mean_invariant(&p);

        let p = f
            .store
            .insert_sample(&p.global_id, &emb(&[1.0, 1.0]), &image(&f.store), 200)
            .unwrap();
        assert_eq!(f.store.last_image_time(&p.global_id).unwrap(), 200);
        assert_mean_invariant(&f.store.get_by_id(&p.global_id).unwrap().unwrap());
    }

    #[test]
    fn test_insert_sample_dimension_mismatch() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0, 0.0]), &image(&f.store), 0, None).unwrap();
        assert!(matches!(
            f.store.insert_sample(&p.global_id, &emb(&[1.0]), &image(&f.store), 0),
            Err(StoreError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_remove_samples_until_person_is_gone() {
        let f = fixture();
        let paths = [image(&f.store), image(&f.store), image(&f.store)];
        let p = f.store.create_person(&emb(&[1.0, 0.0]), &paths[0], 0, None).unwrap();
        f.store.insert_sample(&p.global_id, &emb(&[0.0, 1.0]), &paths[1], 1).unwrap();
        let p = f.store.insert_sample(&p.global_id, &emb(&[1.0, 1.0]), &paths[2], 2).unwrap();

        let ids: Vec<String> = p.faces.iter().map(|s| s.id.clone()).collect();
        assert!(!f.store.remove_sample(&p.global_id, &ids[0]).unwrap());
        let mid = f.store.get_by_id(&p.global_id).unwrap().unwrap();
        assert_eq!(mid.faces.len(), 2);
        assert_mean_invariant(&mid);

        assert!(!f.store.remove_sample(&p.global_id, &ids[1]).unwrap());
        assert!(f.store.remove_sample(&p.global_id, &ids[2]).unwrap());

        assert!(f.store.get_by_id(&p.global_id).unwrap().is_none());
        for path in &paths {
            assert!(!path.exists());
        }
        assert!(matches!(
            f.store.remove_sample(&p.global_id, &ids[2]),
            Err(StoreError::PersonNotFound(_))
        ));
    }

    #[test]
    fn test_remove_unknown_sample() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, None).unwrap();
        assert!(matches!(
            f.store.remove_sample(&p.global_id, "nope"),
            Err(StoreError::SampleNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_image_skipped_on_read() {
        let f = fixture();
        let keep = image(&f.store);
        let lost = image(&f.store);
        let p = f.store.create_person(&emb(&[1.0, 0.0]), &keep, 0, None).unwrap();
        f.store.insert_sample(&p.global_id, &emb(&[0.0, 1.0]), &lost, 1).unwrap();
        fs::remove_file(&lost).unwrap();

        let p = f.store.get_by_id(&p.global_id).unwrap().unwrap();
        assert_eq!(p.faces.len(), 1);
        assert_eq!(p.faces[0].image_path, keep);
        assert!(p.faces.iter().all(|s| s.image_path.exists()));
    }

    #[test]
    fn test_rename_is_idempotent() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, None).unwrap();
        f.store.rename(&p.global_id, "Alice").unwrap();
        let once = f.store.get_by_id(&p.global_id).unwrap().unwrap();
        f.store.rename(&p.global_id, "Alice").unwrap();
        let twice = f.store.get_by_id(&p.global_id).unwrap().unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.name, "Alice");
        assert!(matches!(f.store.rename("nope", "x"), Err(StoreError::PersonNotFound(_))));
    }

    #[test]
    fn test_set_threshold_range() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, None).unwrap();
        f.store.set_threshold(&p.global_id, 1.0).unwrap();
        f.store.set_threshold(&p.global_id, 0.5).unwrap();
        for bad in [0.0, -0.1, 1.01, f32::NAN] {
            assert!(matches!(
                f.store.set_threshold(&p.global_id, bad),
                Err(StoreError::InvalidThreshold(_))
            ));
        }
        assert_eq!(
            f.store.get_by_id(&p.global_id).unwrap().unwrap().classification_threshold,
            0.5
        );
    }

    #[test]
    fn test_get_all_and_by_name() {
        let f = fixture();
        let a = f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, Some("Alice")).unwrap();
        let u = f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, None).unwrap();
        f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, Some("Alice")).unwrap();

        let all = f.store.get_all(false).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].global_id, a.global_id);

        let unknowns = f.store.get_all(true).unwrap();
        assert_eq!(unknowns.len(), 1);
        assert_eq!(unknowns[0].global_id, u.global_id);

        assert_eq!(f.store.get_by_name("Alice").unwrap().unwrap().global_id, a.global_id);
        assert!(f.store.get_by_name("Bob").unwrap().is_none());
        assert_eq!(f.store.num_samples(&a.global_id).unwrap(), 1);
    }

    #[test]
    fn test_search_ties_keep_insertion_order() {
        let f = fixture();
        let first = f.store.create_person(&emb(&[1.0, 0.0]), &image(&f.store), 0, None).unwrap();
        f.store.create_person(&emb(&[2.0, 0.0]), &image(&f.store), 0, None).unwrap();
        let hit = f.store.search(&emb(&[1.0, 0.0])).unwrap().unwrap();
        assert_eq!(hit.person.global_id, first.global_id);
    }

    #[test]
    fn test_search_k_euclidean() {
        let f = fixture();
        f.store.create_person(&emb(&[0.0, 0.0]), &image(&f.store), 0, Some("origin")).unwrap();
        f.store.create_person(&emb(&[10.0, 0.0]), &image(&f.store), 0, Some("far")).unwrap();
        f.store.create_person(&emb(&[1.0, 0.0]), &image(&f.store), 0, Some("near")).unwrap();

        let hits = f.store.search_k(&emb(&[0.9, 0.0]), 2, Metric::Euclidean).unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.person.name.as_str()).collect();
        assert_eq!(names, vec!["near", "origin"]);
        assert!((hits[0].distance - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_delete_person_removes_files() {
        let f = fixture();
        let paths = [image(&f.store), image(&f.store)];
        let p = f.store.create_person(&emb(&[1.0]), &paths[0], 0, None).unwrap();
        f.store.insert_sample(&p.global_id, &emb(&[1.0]), &paths[1], 0).unwrap();
        f.store.delete_person(&p.global_id).unwrap();
        assert_eq!(f.store.count().unwrap(), 0);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_clear_removes_everything() {
        let f = fixture();
        f.store.create_person(&emb(&[1.0]), &image(&f.store), 0, None).unwrap();
        f.store.create_person(&emb(&[0.5]), &image(&f.store), 0, None).unwrap();
        // A stray file in the samples directory goes too.
        fs::write(f.store.samples_dir().join("stray.png"), b"x").unwrap();

        assert_eq!(f.store.clear().unwrap(), 2);
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(fs::read_dir(f.store.samples_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_calibration_single_sample_keeps_default() {
        let f = fixture();
        let p = f.store.create_person(&emb(&[1.0, 0.0]), &image(&f.store), 0, None).unwrap();
        assert_eq!(f.store.calibrate_thresholds().unwrap(), 0);
        assert_eq!(
            f.store.get_by_id(&p.global_id).unwrap().unwrap().classification_threshold,
            DEFAULT_CLASSIFICATION_THRESHOLD
        );
    }

    fn person_with(f: &Fixture, samples: &[&[f32]]) -> String {
        let p = f.store.create_person(&emb(samples[0]), &image(&f.store), 0, None).unwrap();
        for s in &samples[1..] {
            f.store.insert_sample(&p.global_id, &emb(s), &image(&f.store), 0).unwrap();
        }
        p.global_id
    }

    #[test]
    fn test_calibration_ranks_spread() {
        let f = fixture();
        let tight = person_with(&f, &[&[0.0, 0.0, 1.0], &[0.1, 0.0, 1.0], &[0.0, 0.1, 1.0]]);
        let loose = person_with(&f, &[&[0.0, 0.0, 1.0], &[3.0, 0.0, 1.0], &[0.0, 3.0, 1.0]]);
        let single = person_with(&f, &[&[1.0, 1.0, 1.0]]);

        assert_eq!(f.store.calibrate_thresholds().unwrap(), 2);
        let t = |id: &str| f.store.get_by_id(id).unwrap().unwrap().classification_threshold;
        assert!((t(&tight) - 1.0).abs() < 1e-6);
        assert!((t(&loose) - DEFAULT_CLASSIFICATION_THRESHOLD).abs() < 1e-6);
        assert_eq!(t(&single), DEFAULT_CLASSIFICATION_THRESHOLD);

        for p in f.store.get_all(false).unwrap() {
            assert!(p.classification_threshold > 0.0 && p.classification_threshold <= 1.0);
        }

        // Idempotent.
        let before: Vec<f32> = f.store.get_all(false).unwrap().iter().map(|p| p.classification_threshold).collect();
        f.store.calibrate_thresholds().unwrap();
        let after: Vec<f32> = f.store.get_all(false).unwrap().iter().map(|p| p.classification_threshold).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_calibration_equal_areas_gives_one() {
        let f = fixture();
        let a = person_with(&f, &[&[0.0, 0.0], &[1.0, 0.0]]);
        let b = person_with(&f, &[&[5.0, 5.0], &[6.0, 5.0]]);
        f.store.calibrate_thresholds().unwrap();
        for id in [a, b] {
            assert_eq!(f.store.get_by_id(&id).unwrap().unwrap().classification_threshold, 1.0);
        }
    }

    fn spread_embedding(i: usize) -> Embedding {
        let angle = i as f32 * 0.01;
        emb(&[angle.cos(), angle.sin(), (i % 7) as f32 * 0.01, 0.5])
    }

    #[test]
    fn test_large_gallery_uses_index() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..INDEX_MIN_PERSONS + 10 {
            let p = f.store.create_person(&spread_embedding(i), &image(&f.store), 0, None).unwrap();
            ids.push(p.global_id);
        }
        let hit = f.store.search(&spread_embedding(123)).unwrap().unwrap();
        assert_eq!(hit.person.global_id, ids[123]);
        assert!(hit.distance.abs() < 1e-5);

        // Mutations through the store keep the index current.
        let late = f.store.create_person(&emb(&[0.0, 0.0, 0.0, -1.0]), &image(&f.store), 0, None).unwrap();
        let hit = f.store.search(&emb(&[0.0, 0.0, 0.0, -2.0])).unwrap().unwrap();
        assert_eq!(hit.person.global_id, late.global_id);

        f.store.delete_person(&late.global_id).unwrap();
        let hit = f.store.search(&emb(&[0.0, 0.0, 0.0, -2.0])).unwrap().unwrap();
        assert_ne!(hit.person.global_id, late.global_id);

        assert_eq!(f.store.rebuild_index().unwrap(), INDEX_MIN_PERSONS + 10);
        assert_eq!(f.store.rebuild_index().unwrap(), INDEX_MIN_PERSONS + 10);
    }

    #[test]
    fn test_external_writer_invalidates_index() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("database");
        let faces = dir.path().join("faces");
        let store = GalleryStore::open(&db, &faces).unwrap();
        for i in 0..INDEX_MIN_PERSONS + 1 {
            store.create_person(&spread_embedding(i), &image(&store), 0, None).unwrap();
        }
        // Builds the index.
        store.search(&spread_embedding(0)).unwrap();

        let other = GalleryStore::open(&db, &faces).unwrap();
        let outsider = other
            .create_person(&emb(&[0.0, 0.0, 0.0, -1.0]), &image(&other), 0, Some("outsider"))
            .unwrap();

        let hit = store.search(&emb(&[0.0, 0.0, 0.0, -1.0])).unwrap().unwrap();
        assert_eq!(hit.person.global_id, outsider.global_id);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("database");
        let faces = dir.path().join("faces");
        let id = {
            let store = GalleryStore::open(&db, &faces).unwrap();
            store
                .create_person(&emb(&[0.25, 0.5]), &image(&store), 7, Some("Bob"))
                .unwrap()
                .global_id
        };
        let store = GalleryStore::open(&db, &faces).unwrap();
        let p = store.get_by_id(&id).unwrap().unwrap();
        assert_eq!(p.name, "Bob");
        assert_eq!(p.avg_embedding.values, vec![0.25, 0.5]);
        assert_eq!(p.last_image_time, 7);
        assert!(p.faces[0].image_path.starts_with(&faces));
    }
}
