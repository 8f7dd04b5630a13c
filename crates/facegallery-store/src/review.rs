//! Review operations over the gallery: listing, batched sample edits,
//! recalibration and the 2-D projection shown by review UIs.

use crate::error::StoreError;
use crate::store::{GalleryStore, Person};
use facegallery_core::pca::{self, Pca2};
use serde::Serialize;
use std::path::PathBuf;

/// What a reviewer decided for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    Accept,
    /// Assign this label to the sample's person.
    Rename(String),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEdit {
    pub person_id: String,
    pub sample_id: String,
    pub action: ReviewAction,
}

impl SampleEdit {
    pub fn new(person_id: impl Into<String>, sample_id: impl Into<String>, action: ReviewAction) -> Self {
        Self {
            person_id: person_id.into(),
            sample_id: sample_id.into(),
            action,
        }
    }
}

/// Picks one label when samples of the same person were given different
/// labels. Returning `None` leaves the person untouched.
pub trait ConflictResolver {
    fn resolve(&mut self, person: &Person, labels: &[String]) -> Option<String>;
}

impl<F> ConflictResolver for F
where
    F: FnMut(&Person, &[String]) -> Option<String>,
{
    fn resolve(&mut self, person: &Person, labels: &[String]) -> Option<String> {
        self(person, labels)
    }
}

/// Resolver for non-interactive callers: every conflict stays unresolved.
pub struct DeclineConflicts;

impl ConflictResolver for DeclineConflicts {
    fn resolve(&mut self, _person: &Person, _labels: &[String]) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReviewReport {
    /// `(global_id, new name)`.
    pub renamed: Vec<(String, String)>,
    pub deleted_samples: usize,
    /// Persons removed because their last sample was deleted.
    pub removed_persons: Vec<String>,
    /// Persons with conflicting labels the resolver declined.
    pub unresolved: Vec<String>,
    /// `(global_id, error)` for edits that failed.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSummary {
    pub id: String,
    pub image_path: PathBuf,
    pub created_at: i64,
}

/// A person without embeddings, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub global_id: String,
    pub name: String,
    pub classification_threshold: f32,
    pub last_image_time: i64,
    pub samples: Vec<SampleSummary>,
}

impl From<&Person> for PersonSummary {
    fn from(p: &Person) -> Self {
        Self {
            global_id: p.global_id.clone(),
            name: p.name.clone(),
            classification_threshold: p.classification_threshold,
            last_image_time: p.last_image_time,
            samples: p
                .faces
                .iter()
                .map(|f| SampleSummary {
                    id: f.id.clone(),
                    image_path: f.image_path.clone(),
                    created_at: f.created_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedPerson {
    pub global_id: String,
    pub name: String,
    /// `avg_embedding` in the shared 2-D basis.
    pub point: [f64; 2],
    /// 1-σ ellipse radii of the person's projected samples.
    pub radii: [f64; 2],
    pub samples: Vec<[f64; 2]>,
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Projection {
    pub persons: Vec<ProjectedPerson>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub persons: usize,
    pub unknown_persons: usize,
    pub samples: usize,
}

impl GalleryStore {
    pub fn list_persons(&self, only_unknowns: bool) -> Result<Vec<PersonSummary>, StoreError> {
        Ok(self.get_all(only_unknowns)?.iter().map(PersonSummary::from).collect())
    }

    /// Apply a batch of per-sample review decisions.
    ///
    /// Edits are grouped by person. A person whose samples received
    /// different labels is handed to `resolver`; if it declines, none of
    /// that person's edits are applied. Failures of individual edits are
    /// collected in the report rather than aborting the batch.
    pub fn apply_edits(
        &self,
        edits: &[SampleEdit],
        resolver: &mut dyn ConflictResolver,
    ) -> Result<ReviewReport, StoreError> {
        let mut report = ReviewReport::default();

        // Group by person, first-seen order.
        let mut groups: Vec<(&str, Vec<&SampleEdit>)> = Vec::new();
        for edit in edits {
            match groups.iter_mut().find(|(id, _)| *id == edit.person_id) {
                Some((_, group)) => group.push(edit),
                None => groups.push((edit.person_id.as_str(), vec![edit])),
            }
        }

        for (person_id, group) in groups {
            let Some(person) = self.get_by_id(person_id)? else {
                report
                    .errors
                    .push((person_id.to_string(), StoreError::PersonNotFound(person_id.to_string()).to_string()));
                continue;
            };

            let mut labels: Vec<String> = Vec::new();
            for edit in &group {
                if let ReviewAction::Rename(label) = &edit.action {
                    if !labels.contains(label) {
                        labels.push(label.clone());
                    }
                }
            }
            let label = match labels.len() {
                0 => None,
                1 => labels.pop(),
                _ => match resolver.resolve(&person, &labels) {
                    Some(label) => Some(label),
                    None => {
                        tracing::info!(global_id = person_id, ?labels, "label conflict left unresolved");
                        report.unresolved.push(person_id.to_string());
                        continue;
                    }
                },
            };

            let mut person_removed = false;
            for edit in group.iter().filter(|e| e.action == ReviewAction::Delete) {
                match self.remove_sample(person_id, &edit.sample_id) {
                    Ok(removed) => {
                        report.deleted_samples += 1;
                        if removed {
                            report.removed_persons.push(person_id.to_string());
                            person_removed = true;
                            break;
                        }
                    }
                    Err(e) => report.errors.push((person_id.to_string(), e.to_string())),
                }
            }

            if let (Some(label), false) = (label, person_removed) {
                if label != person.name {
                    match self.rename(person_id, &label) {
                        Ok(()) => report.renamed.push((person_id.to_string(), label)),
                        Err(e) => report.errors.push((person_id.to_string(), e.to_string())),
                    }
                }
            }
        }

        tracing::info!(
            renamed = report.renamed.len(),
            deleted = report.deleted_samples,
            removed = report.removed_persons.len(),
            unresolved = report.unresolved.len(),
            errors = report.errors.len(),
            "review edits applied"
        );
        Ok(report)
    }

    /// Recompute every eligible person's classification threshold.
    pub fn recalibrate(&self) -> Result<usize, StoreError> {
        self.calibrate_thresholds()
    }

    /// Project the whole gallery into a shared 2-D basis.
    ///
    /// Works on a snapshot; the store lock is not held during PCA.
    pub fn project(&self) -> Result<Projection, StoreError> {
        let persons = self.get_all(false)?;
        let all: Vec<&[f32]> = persons
            .iter()
            .flat_map(|p| p.faces.iter().map(|f| f.embedding.values.as_slice()))
            .collect();
        if all.is_empty() {
            return Ok(Projection::default());
        }
        let model = Pca2::fit(&all)?;

        let mut projected = Vec::with_capacity(persons.len());
        for person in &persons {
            let samples = person
                .faces
                .iter()
                .map(|f| model.transform(&f.embedding.values))
                .collect::<Result<Vec<_>, _>>()?;
            let (sx, sy) = pca::spread(&samples);
            projected.push(ProjectedPerson {
                global_id: person.global_id.clone(),
                name: person.name.clone(),
                point: model.transform(&person.avg_embedding.values)?,
                radii: [sx, sy],
                samples,
                thumbnail: person.faces.first().map(|f| f.image_path.clone()),
            });
        }
        Ok(Projection { persons: projected })
    }

    pub fn stats(&self) -> Result<Stats, StoreError> {
        let persons = self.get_all(false)?;
        Ok(Stats {
            persons: persons.len(),
            unknown_persons: persons.iter().filter(|p| p.is_unknown()).count(),
            samples: persons.iter().map(|p| p.faces.len()).sum(),
        })
    }
}
