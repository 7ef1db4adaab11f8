//! Rename detection
//!
//! Heuristic scoring for field and model renames, the confirmation protocol used
//! to turn candidates into a confirmed rename map, and mutual-best matching for
//! model renames.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::state::{FieldState, FieldType, ModelState, ProjectState};

/// Model pairs must score at least this to count as a rename
pub const DEFAULT_MODEL_THRESHOLD: f64 = 0.90;

/// Field candidates below this score are never offered
pub const DEFAULT_FIELD_MIN_SCORE: f64 = 40.0;

/// Score of a field pair whose types differ
pub const TYPE_MISMATCH: f64 = -1000.0;

/// Score of a field pair sharing an explicit physical column
pub const SAME_COLUMN: f64 = 100.0;

/// Confirmed field renames: model name -> old field name -> new field name
pub type RenameMap = BTreeMap<String, BTreeMap<String, String>>;

/// Renames confirmed for one model. Looked up by the new model name first.
pub fn renames_for<'a>(
    map: &'a RenameMap,
    new_model: &str,
    old_model: &str,
) -> Option<&'a BTreeMap<String, String>> {
    map.get(new_model).or_else(|| map.get(old_model))
}

/// Lowercase, drop an `_id` suffix and collapse punctuation to spaces
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let stem = lower.strip_suffix("_id").unwrap_or(&lower);
    stem.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity ratio in `[0, 1]` of two normalized names
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

/// Score how likely `new_field` is `old_field` under a new name.
///
/// Asymmetric. Differing types always yield [`TYPE_MISMATCH`].
pub fn score_field_rename(old_name: &str, old_field: &FieldState, new_name: &str, new_field: &FieldState) -> f64 {
    if old_field.field_type != new_field.field_type {
        return TYPE_MISMATCH;
    }

    if let (Some(old_column), Some(new_column)) = (&old_field.db_column, &new_field.db_column) {
        if !old_column.is_empty() && old_column == new_column {
            return SAME_COLUMN;
        }
    }

    let old = old_field.normalized();
    let new = new_field.normalized();
    let mut score = 50.0 * name_similarity(old_name, new_name);

    if old.field_type.is_relation() {
        let same_target = match (&old.related_table, &new.related_table) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        if same_target {
            score += 20.0;
        }
    }
    if old.primary_key == new.primary_key {
        score += 10.0;
    }
    for (a, b) in [(old.null, new.null), (old.unique, new.unique), (old.index, new.index)] {
        if a == b {
            score += 5.0;
        }
    }
    if old.field_type.is_char_like() && old.max_length == new.max_length {
        score += 10.0;
    }
    if old.field_type == FieldType::Decimal
        && old.max_digits == new.max_digits
        && old.decimal_places == new.decimal_places
    {
        score += 10.0;
    }
    if old_field.db_column.as_deref() == Some(new_name) {
        score += 4.0;
    }
    if new_field.db_column.as_deref() == Some(old_name) {
        score += 4.0;
    }

    score
}

/// A possible new name for a removed field
#[derive(Debug, Clone, PartialEq)]
pub struct RenameCandidate {
    pub name: String,
    pub score: f64,
}

/// Candidates for `old_field`, best first, ties broken by name
pub fn rank_candidates(
    old_field: &FieldState,
    pool: &[&FieldState],
    min_score: f64,
) -> Vec<RenameCandidate> {
    let mut candidates: Vec<RenameCandidate> = pool
        .iter()
        .map(|new_field| RenameCandidate {
            name: new_field.name.clone(),
            score: score_field_rename(&old_field.name, old_field, &new_field.name, new_field),
        })
        .filter(|c| c.score >= min_score)
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    candidates
}

/// Similarity of two models in `[0, 1]`.
///
/// Mostly the share of same-named, same-typed fields, with small bonuses for a
/// matching primary key type, equal field counts and similar table names.
pub fn model_similarity(old: &ModelState, new: &ModelState) -> f64 {
    let old_fields: Vec<&FieldState> = old.schema_fields().collect();
    let new_fields: Vec<&FieldState> = new.schema_fields().collect();
    let total = old_fields.len().max(new_fields.len());

    let overlap = old_fields
        .iter()
        .filter(|f| {
            new.field(&f.name)
                .map_or(false, |other| other.field_type == f.field_type)
        })
        .count();

    // Accumulated in percent so that exact matches land exactly on the threshold
    let mut percent = if total == 0 {
        0.0
    } else {
        70.0 * overlap as f64 / total as f64
    };
    if old.primary_key_type().is_some() && old.primary_key_type() == new.primary_key_type() {
        percent += 10.0;
    }
    if old_fields.len() == new_fields.len() {
        percent += 10.0;
    }
    percent += 10.0 * name_similarity(&old.db_table, &new.db_table);
    percent / 100.0
}

fn best_match<'a>(
    from: &str,
    to: impl Iterator<Item = &'a String>,
    score: impl Fn(&str, &str) -> f64,
) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for candidate in to {
        let s = score(from, candidate);
        let better = match &best {
            None => true,
            // Strictly greater keeps the alphabetically first name on ties
            Some((_, current)) => s > *current,
        };
        if better {
            best = Some((candidate.clone(), s));
        }
    }
    best
}

/// Mutual best model matches at or above `threshold`, as (old name, new name)
pub fn detect_model_renames(old: &ProjectState, new: &ProjectState, threshold: f64) -> Vec<(String, String)> {
    let removed: BTreeSet<&String> = old
        .model_states
        .keys()
        .filter(|name| !new.model_states.contains_key(*name))
        .collect();
    let added: BTreeSet<&String> = new
        .model_states
        .keys()
        .filter(|name| !old.model_states.contains_key(*name))
        .collect();

    let score = |old_name: &str, new_name: &str| match (old.model(old_name), new.model(new_name)) {
        (Some(a), Some(b)) => model_similarity(a, b),
        _ => 0.0,
    };

    let mut pairs = Vec::new();
    for old_name in &removed {
        let Some((new_name, s)) = best_match(old_name, added.iter().copied(), score) else {
            continue;
        };
        if s < threshold {
            continue;
        }
        let back = best_match(&new_name, removed.iter().copied(), |n, o| score(o, n));
        if back.map(|(name, _)| name) == Some((*old_name).clone()) {
            tracing::debug!(old = %old_name, new = %new_name, score = s, "Detected model rename");
            pairs.push(((*old_name).clone(), new_name));
        }
    }
    pairs
}

/// Answer to a proposed field rename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameDecision {
    /// Take the best candidate
    Accept,
    /// Take the candidate at this position
    Pick(usize),
    /// Not a rename
    Skip,
}

/// Human (or scripted) confirmation of renames and risky alterations
pub trait Confirmer {
    fn confirm_field_rename(
        &mut self,
        model: &str,
        old_field: &str,
        candidates: &[RenameCandidate],
    ) -> Result<RenameDecision>;

    /// Offenders are `Model.field` labels of null -> not null alterations without a default
    fn confirm_risky_alters(&mut self, offenders: &[String]) -> Result<bool>;
}

/// Accepts every best candidate and every risky alteration
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Confirmer for AcceptAll {
    fn confirm_field_rename(&mut self, _: &str, _: &str, _: &[RenameCandidate]) -> Result<RenameDecision> {
        Ok(RenameDecision::Accept)
    }

    fn confirm_risky_alters(&mut self, _: &[String]) -> Result<bool> {
        Ok(true)
    }
}

/// Declines every rename and every risky alteration
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineAll;

impl Confirmer for DeclineAll {
    fn confirm_field_rename(&mut self, _: &str, _: &str, _: &[RenameCandidate]) -> Result<RenameDecision> {
        Ok(RenameDecision::Skip)
    }

    fn confirm_risky_alters(&mut self, _: &[String]) -> Result<bool> {
        Ok(false)
    }
}

/// Walk every removed field of every surviving model and ask the confirmer
/// which added field, if any, it became.
///
/// `model_renames` pairs are compared old-to-new. A new field consumed by one
/// confirmed rename is no longer offered to the others.
pub fn confirm_field_renames(
    old: &ProjectState,
    new: &ProjectState,
    model_renames: &[(String, String)],
    min_score: f64,
    confirmer: &mut dyn Confirmer,
) -> Result<RenameMap> {
    let mut pairs: Vec<(&ModelState, &ModelState)> = old
        .model_states
        .iter()
        .filter_map(|(name, model)| new.model(name).map(|other| (model, other)))
        .collect();
    for (old_name, new_name) in model_renames {
        if let (Some(a), Some(b)) = (old.model(old_name), new.model(new_name)) {
            pairs.push((a, b));
        }
    }

    let mut map = RenameMap::new();
    for (old_model, new_model) in pairs {
        let removed: Vec<&FieldState> = old_model
            .schema_fields()
            .filter(|f| new_model.field(&f.name).is_none())
            .collect();
        let mut pool: Vec<&FieldState> = new_model
            .schema_fields()
            .filter(|f| old_model.field(&f.name).is_none())
            .collect();
        pool.sort_by(|a, b| a.name.cmp(&b.name));

        // most confident removed field first
        let best = |field: &FieldState| {
            rank_candidates(field, &pool, min_score)
                .first()
                .map_or(f64::NEG_INFINITY, |c| c.score)
        };
        let mut removed: Vec<(f64, &FieldState)> = removed.into_iter().map(|f| (best(f), f)).collect();
        removed.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.name.cmp(&b.name)));
        let removed: Vec<&FieldState> = removed.into_iter().map(|(_, f)| f).collect();

        for old_field in removed {
            let candidates = rank_candidates(old_field, &pool, min_score);
            if candidates.is_empty() {
                continue;
            }
            let chosen = match confirmer.confirm_field_rename(&new_model.name, &old_field.name, &candidates)? {
                RenameDecision::Skip => continue,
                RenameDecision::Accept => &candidates[0],
                RenameDecision::Pick(i) => candidates.get(i).ok_or_else(|| {
                    Error::InvalidMigration(format!(
                        "Rename choice {} for {}.{} is out of range",
                        i, new_model.name, old_field.name
                    ))
                })?,
            };
            tracing::info!(
                model = %new_model.name,
                old = %old_field.name,
                new = %chosen.name,
                "Confirmed field rename"
            );
            map.entry(new_model.name.clone())
                .or_default()
                .insert(old_field.name.clone(), chosen.name.clone());
            pool.retain(|f| f.name != chosen.name);
        }
    }
    Ok(map)
}
