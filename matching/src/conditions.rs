//! Conditions and the buffers rating works in
//!
//! A condition reads one trait of a candidate and scores it in `[0, 1]`, or
//! rejects it. A member's conditions are weighted; the rating system reduces
//! them to one score per candidate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::components::{trait_names, DataId, TraitKind, TraitValue, Vec2};
use crate::pool::Poolable;
use crate::trait_store::TraitDatabase;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Scoring rule over one trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Bool tag trait must hold `required`.
    Semantic { tag: String, required: bool },
    /// 2-D bounds close to `target`; score falls to zero at `tolerance`.
    Bounds2D { target: Vec2, tolerance: f32 },
    /// 2-D bounds at least `min` on both axes.
    MinBounds2D { min: Vec2 },
    /// Float trait inside `[min, max]`.
    FloatRange { trait_name: String, min: f32, max: f32 },
    /// Pose height inside `[min, max]`.
    Elevation { min: f32, max: f32 },
    /// Geolocation (latitude, longitude in degrees) within `radius_m` of `center`.
    GeoRadius { center: Vec2, radius_m: f32 },
    /// Text trait equal to `value`.
    TextEquals { trait_name: String, value: String },
    /// Any value of the trait.
    Exists { trait_name: String, kind: TraitKind },
}

impl Condition {
    pub fn trait_name(&self) -> &str {
        match self {
            Condition::Semantic { tag, .. } => tag,
            Condition::Bounds2D { .. } | Condition::MinBounds2D { .. } => trait_names::BOUNDS_2D,
            Condition::FloatRange { trait_name, .. } => trait_name,
            Condition::Elevation { .. } => trait_names::POSE,
            Condition::GeoRadius { .. } => trait_names::GEOLOCATION,
            Condition::TextEquals { trait_name, .. } => trait_name,
            Condition::Exists { trait_name, .. } => trait_name,
        }
    }

    pub fn kind(&self) -> TraitKind {
        match self {
            Condition::Semantic { .. } => TraitKind::Bool,
            Condition::Bounds2D { .. } | Condition::MinBounds2D { .. } => TraitKind::Vec2,
            Condition::FloatRange { .. } => TraitKind::Float,
            Condition::Elevation { .. } => TraitKind::Pose,
            Condition::GeoRadius { .. } => TraitKind::Vec2,
            Condition::TextEquals { .. } => TraitKind::Text,
            Condition::Exists { kind, .. } => *kind,
        }
    }

    /// Score a trait value, `None` when the value fails the condition.
    pub fn rate(&self, value: &TraitValue) -> Option<f32> {
        match (self, value) {
            (Condition::Semantic { required, .. }, TraitValue::Bool(v)) => {
                (v == required).then_some(1.0)
            }
            (Condition::Bounds2D { target, tolerance }, TraitValue::Vec2(v)) => {
                let deviation = (v.x - target.x).abs().max((v.y - target.y).abs());
                if *tolerance <= 0.0 {
                    return (deviation == 0.0).then_some(1.0);
                }
                (deviation <= *tolerance).then(|| 1.0 - deviation / tolerance)
            }
            (Condition::MinBounds2D { min }, TraitValue::Vec2(v)) => {
                (v.x >= min.x && v.y >= min.y).then_some(1.0)
            }
            (Condition::FloatRange { min, max, .. }, TraitValue::Float(v)) => range_score(*v, *min, *max),
            (Condition::Elevation { min, max }, TraitValue::Pose(pose)) => {
                range_score(pose.position.y, *min, *max)
            }
            (Condition::GeoRadius { center, radius_m }, TraitValue::Vec2(v)) => {
                let distance = haversine_m(*center, *v);
                if *radius_m <= 0.0 {
                    return (distance == 0.0).then_some(1.0);
                }
                (distance <= *radius_m).then(|| 1.0 - distance / radius_m)
            }
            (Condition::TextEquals { value: expected, .. }, TraitValue::Text(v)) => {
                (v == expected).then_some(1.0)
            }
            (Condition::Exists { kind, .. }, v) => (v.kind() == *kind).then_some(1.0),
            _ => None,
        }
    }
}

/// 1.0 at the centre of the range, 0.5 at its edges, `None` outside.
pub(crate) fn range_score(value: f32, min: f32, max: f32) -> Option<f32> {
    if value < min || value > max {
        return None;
    }
    let half = (max - min) / 2.0;
    if half <= 0.0 {
        return Some(1.0);
    }
    let centre = min + half;
    Some(1.0 - 0.5 * (value - centre).abs() / half)
}

fn haversine_m(a: Vec2, b: Vec2) -> f32 {
    let (lat1, lon1) = ((a.x as f64).to_radians(), (a.y as f64).to_radians());
    let (lat2, lon2) = ((b.x as f64).to_radians(), (b.y as f64).to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    (2.0 * EARTH_RADIUS_M * h.sqrt().asin()) as f32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedCondition {
    pub condition: Condition,
    pub weight: f32,
}

/// The ordered conditions of one query member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConditions {
    pub entries: Vec<WeightedCondition>,
}

impl ProxyConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.entries.push(WeightedCondition {
            condition,
            weight: 1.0,
        });
        self
    }

    pub fn with_weighted(mut self, condition: Condition, weight: f32) -> Self {
        self.entries.push(WeightedCondition { condition, weight });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Weighted mean of per-condition scores. Zero total weight falls back
    /// to the plain mean; no conditions rate 1.0.
    pub fn reduce(&self, scores: impl Iterator<Item = f32>) -> f32 {
        let mut weighted = 0.0;
        let mut plain = 0.0;
        let mut total_weight = 0.0;
        let mut count = 0usize;
        for (entry, score) in self.entries.iter().zip(scores) {
            weighted += entry.weight * score;
            plain += score;
            total_weight += entry.weight;
            count += 1;
        }
        if count == 0 {
            1.0
        } else if total_weight > 0.0 {
            weighted / total_weight
        } else {
            plain / count as f32
        }
    }
}

// ============================================================================
// Pooled per-row buffers
// ============================================================================

/// Trait values read for a row's conditions, per condition then candidate.
/// Maps of unused conditions stay allocated for the next row that needs them.
#[derive(Debug, Default)]
pub struct CachedTraitCollection {
    per_condition: Vec<HashMap<DataId, TraitValue>>,
    active: usize,
}

impl CachedTraitCollection {
    /// Re-read every condition's trait for `candidates`.
    pub fn refresh(&mut self, conditions: &ProxyConditions, db: &TraitDatabase, candidates: &[DataId]) {
        self.prepare(conditions.len());
        for (cache, entry) in self.per_condition.iter_mut().zip(&conditions.entries) {
            let name = entry.condition.trait_name();
            for &id in candidates {
                if let Some(value) = db.get_value(id, name) {
                    cache.insert(id, value);
                }
            }
        }
    }

    pub fn get(&self, condition: usize, id: DataId) -> Option<&TraitValue> {
        self.per_condition[..self.active].get(condition)?.get(&id)
    }

    fn prepare(&mut self, conditions: usize) {
        for cache in &mut self.per_condition {
            cache.clear();
        }
        if self.per_condition.len() < conditions {
            self.per_condition.resize_with(conditions, HashMap::new);
        }
        self.active = conditions;
    }
}

impl Poolable for CachedTraitCollection {
    fn reset(&mut self) {
        self.prepare(0);
    }
}

/// Per-condition scores of every candidate that passed that condition.
#[derive(Debug, Default)]
pub struct ConditionRatingsData {
    per_condition: Vec<HashMap<DataId, f32>>,
    active: usize,
}

impl ConditionRatingsData {
    pub fn prepare(&mut self, conditions: usize) {
        for ratings in &mut self.per_condition {
            ratings.clear();
        }
        if self.per_condition.len() < conditions {
            self.per_condition.resize_with(conditions, HashMap::new);
        }
        self.active = conditions;
    }

    pub fn insert(&mut self, condition: usize, id: DataId, score: f32) {
        if let Some(ratings) = self.per_condition[..self.active].get_mut(condition) {
            ratings.insert(id, score);
        }
    }

    pub fn get(&self, condition: usize, id: DataId) -> Option<f32> {
        self.per_condition[..self.active].get(condition)?.get(&id).copied()
    }

    pub fn condition_count(&self) -> usize {
        self.active
    }
}

impl Poolable for ConditionRatingsData {
    fn reset(&mut self) {
        self.prepare(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Pose, Vec3};

    #[test]
    fn test_bounds_rating() {
        let cond = Condition::Bounds2D {
            target: Vec2::new(0.5, 2.5),
            tolerance: 1.0,
        };
        assert_eq!(cond.rate(&Vec2::new(0.5, 2.5).into()), Some(1.0));
        let near = cond.rate(&Vec2::new(0.75, 2.5).into()).unwrap();
        assert!((near - 0.75).abs() < 1e-6);
        assert_eq!(cond.rate(&Vec2::new(3.0, 2.5).into()), None);
        assert_eq!(cond.rate(&TraitValue::Bool(true)), None);
    }

    #[test]
    fn test_range_and_elevation() {
        assert_eq!(range_score(1.0, 0.0, 2.0), Some(1.0));
        assert_eq!(range_score(0.0, 0.0, 2.0), Some(0.5));
        assert_eq!(range_score(2.5, 0.0, 2.0), None);

        let cond = Condition::Elevation { min: -1.0, max: 1.0 };
        let pose = Pose::at(Vec3::new(4.0, 0.0, 2.0));
        assert_eq!(cond.rate(&pose.into()), Some(1.0));
    }

    #[test]
    fn test_geo_radius() {
        let london = Vec2::new(51.5074, -0.1278);
        let cond = Condition::GeoRadius {
            center: london,
            radius_m: 1000.0,
        };
        assert_eq!(cond.rate(&london.into()), Some(1.0));
        // Paris is ~340km away
        assert_eq!(cond.rate(&Vec2::new(48.8566, 2.3522).into()), None);
    }

    #[test]
    fn test_reduce_weights() {
        let conditions = ProxyConditions::new()
            .with_weighted(Condition::Exists { trait_name: "a".into(), kind: TraitKind::Bool }, 3.0)
            .with_weighted(Condition::Exists { trait_name: "b".into(), kind: TraitKind::Bool }, 1.0);
        let reduced = conditions.reduce([1.0, 0.0].into_iter());
        assert!((reduced - 0.75).abs() < 1e-6);
        assert_eq!(ProxyConditions::new().reduce(std::iter::empty()), 1.0);
    }

    #[test]
    fn test_trait_cache_refresh() {
        let mut db = TraitDatabase::new();
        db.add_or_update(DataId(1), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
        db.add_or_update(DataId(2), "floor", true).unwrap();
        let conditions = ProxyConditions::new().with(Condition::MinBounds2D { min: Vec2::new(0.5, 0.5) });

        let mut cache = CachedTraitCollection::default();
        cache.refresh(&conditions, &db, &[DataId(1), DataId(2)]);
        assert!(cache.get(0, DataId(1)).is_some());
        assert!(cache.get(0, DataId(2)).is_none());

        cache.reset();
        assert!(cache.get(0, DataId(1)).is_none());
    }
}
