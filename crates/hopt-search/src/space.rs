//! Parameter declarations and the search space they form.

use hopt_types::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A concrete candidate value for a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(Value),
}

impl ParameterValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Float(v) => Value::from(*v),
            Self::Int(v) => Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Json(Value::Bool(v))
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Json(Value::String(v.to_string()))
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Json(Value::String(v))
    }
}

impl From<Value> for ParameterValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Number(n) if n.is_i64() => n.as_i64().map_or(Self::Json(Value::Number(n)), Self::Int),
            other => Self::Json(other),
        }
    }
}

impl From<ParameterValue> for Value {
    fn from(v: ParameterValue) -> Self {
        v.to_json()
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Declaration of a parameter drawn from an explicit list of options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptList {
    pub id: String,
    pub options: Vec<ParameterValue>,
    #[serde(default)]
    pub tunable: bool,
}

impl OptList {
    pub fn new<V: Into<ParameterValue>>(id: impl Into<String>, options: impl IntoIterator<Item = V>) -> Self {
        Self {
            id: id.into(),
            options: options.into_iter().map(Into::into).collect(),
            tunable: false,
        }
    }

    pub fn tunable(mut self) -> Self {
        self.tunable = true;
        self
    }
}

/// Declaration of a parameter drawn from a `[low, high]` range.
///
/// With a `sample_count` the range is sampled once, at declaration time, into
/// a frozen candidate set. Without one the two bounds are the candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptRange {
    pub id: String,
    pub low: f64,
    pub high: f64,
    #[serde(default = "default_sample_count")]
    pub sample_count: Option<usize>,
    #[serde(default)]
    pub log_base: Option<f64>,
    #[serde(default)]
    pub tunable: bool,
}

fn default_sample_count() -> Option<usize> {
    Some(10)
}

impl OptRange {
    pub fn new(id: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            id: id.into(),
            low,
            high,
            sample_count: default_sample_count(),
            log_base: None,
            tunable: false,
        }
    }

    pub fn samples(mut self, n: usize) -> Self {
        self.sample_count = Some(n);
        self
    }

    /// Use the bounds themselves as the only candidates.
    pub fn bounds_only(mut self) -> Self {
        self.sample_count = None;
        self
    }

    pub fn log_base(mut self, base: f64) -> Self {
        self.log_base = Some(base);
        self
    }

    pub fn tunable(mut self) -> Self {
        self.tunable = true;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.id.clone();
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err(ConfigError::NonFiniteBound { name });
        }
        if let Some(base) = self.log_base {
            if !(base > 0.0) || base == 1.0 || !base.is_finite() {
                return Err(ConfigError::InvalidLogBase { name, base });
            }
            if !(self.high >= self.low && self.low > 0.0) {
                return Err(ConfigError::NonPositiveLogBound {
                    name,
                    low: self.low,
                    high: self.high,
                });
            }
        }
        if self.low > self.high {
            return Err(ConfigError::InvertedRange {
                name,
                low: self.low,
                high: self.high,
            });
        }
        if self.sample_count == Some(0) {
            return Err(ConfigError::ZeroSampleCount { name });
        }
        Ok(())
    }

    /// Validate and turn the range into its frozen candidate set.
    pub fn materialize<R: Rng>(&self, rng: &mut R) -> Result<Vec<ParameterValue>, ConfigError> {
        self.validate()?;

        let Some(n) = self.sample_count else {
            return Ok(vec![
                ParameterValue::Float(self.low),
                ParameterValue::Float(self.high),
            ]);
        };

        let values = match self.log_base {
            None => (0..n)
                .map(|_| ParameterValue::Float(rng.random_range(self.low..=self.high)))
                .collect(),
            Some(base) => {
                let log_low = self.low.log(base);
                let log_high = self.high.log(base);
                // `log` may flip the order for bases below 1
                let (lo, hi) = if log_low <= log_high {
                    (log_low, log_high)
                } else {
                    (log_high, log_low)
                };
                (0..n)
                    .map(|_| {
                        let exp: f64 = rng.random_range(lo..=hi);
                        ParameterValue::Float(base.powf(exp).clamp(self.low, self.high))
                    })
                    .collect()
            }
        };
        Ok(values)
    }
}

/// How an [`OptArg`] was declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptKind {
    List,
    Range {
        low: f64,
        high: f64,
        sample_count: Option<usize>,
        log_base: Option<f64>,
    },
}

/// A declared parameter with its frozen candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptArg {
    pub id: String,
    pub kind: OptKind,
    pub candidates: Vec<ParameterValue>,
    pub tunable: bool,
}

impl OptArg {
    pub fn from_list(decl: OptList) -> Result<Self, ConfigError> {
        if decl.tunable && decl.options.is_empty() {
            return Err(ConfigError::EmptyCandidates { name: decl.id });
        }
        Ok(Self {
            id: decl.id,
            kind: OptKind::List,
            candidates: decl.options,
            tunable: decl.tunable,
        })
    }

    pub fn from_range<R: Rng>(decl: OptRange, rng: &mut R) -> Result<Self, ConfigError> {
        let candidates = decl.materialize(rng)?;
        Ok(Self {
            kind: OptKind::Range {
                low: decl.low,
                high: decl.high,
                sample_count: decl.sample_count,
                log_base: decl.log_base,
            },
            id: decl.id,
            candidates,
            tunable: decl.tunable,
        })
    }

    /// Name used in trial configurations: the id with every `-` removed.
    pub fn clean_name(&self) -> String {
        clean_name(&self.id)
    }
}

pub fn clean_name(id: &str) -> String {
    id.replace('-', "")
}

// ---------------------------------------------------------------------------
// Parameter space
// ---------------------------------------------------------------------------

/// One `{index, name, value}` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub index: usize,
    pub name: String,
    pub value: ParameterValue,
}

/// Tunable parameters only, one group of candidate records per parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlattenedSpace {
    pub groups: Vec<Vec<Assignment>>,
}

impl FlattenedSpace {
    /// Number of points in the full Cartesian product, `None` on overflow.
    pub fn grid_size(&self) -> Option<usize> {
        self.groups
            .iter()
            .try_fold(1usize, |total, group| total.checked_mul(group.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// One concrete point in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    assignments: Vec<Assignment>,
}

impl Trial {
    pub fn new(assignments: Vec<Assignment>) -> Self {
        Self { assignments }
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        // later groups win on duplicate names
        self.assignments
            .iter()
            .rev()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }
}

/// Declared parameters in declaration order.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    args: Vec<OptArg>,
    rng: StdRng,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Space whose range sampling is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            args: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn opt_list(&mut self, decl: OptList) -> Result<&OptArg, ConfigError> {
        let arg = OptArg::from_list(decl)?;
        Ok(self.insert(arg))
    }

    pub fn opt_range(&mut self, decl: OptRange) -> Result<&OptArg, ConfigError> {
        let arg = OptArg::from_range(decl, &mut self.rng)?;
        Ok(self.insert(arg))
    }

    /// Re-declaring an id replaces the earlier declaration in its slot.
    fn insert(&mut self, arg: OptArg) -> &OptArg {
        let slot = match self.args.iter().position(|a| a.id == arg.id) {
            Some(i) => {
                tracing::debug!(id = %arg.id, "replacing earlier declaration");
                self.args[i] = arg;
                i
            }
            None => {
                self.args.push(arg);
                self.args.len() - 1
            }
        };
        &self.args[slot]
    }

    pub fn get(&self, id: &str) -> Option<&OptArg> {
        self.args.iter().find(|a| a.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptArg> {
        self.args.iter()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn flatten(&self) -> FlattenedSpace {
        let groups = self
            .args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.tunable)
            .map(|(index, arg)| {
                let name = arg.clean_name();
                arg.candidates
                    .iter()
                    .map(|value| Assignment {
                        index,
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .collect();
        FlattenedSpace { groups }
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_range_with_zero_low_fails_at_declaration() {
        let mut space = ParameterSpace::with_seed(1);
        let err = space
            .opt_range(OptRange::new("lr", 0.0, 1.0).log_base(10.0).tunable())
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveLogBound { .. }));
        assert!(space.is_empty());

        let err = space
            .opt_range(OptRange::new("lr", -1.0, 1.0).log_base(10.0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveLogBound { .. }));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut space = ParameterSpace::with_seed(1);
        assert!(matches!(
            space.opt_range(OptRange::new("x", 2.0, 1.0)),
            Err(ConfigError::InvertedRange { .. })
        ));
        assert!(matches!(
            space.opt_range(OptRange::new("x", 1.0, 2.0).samples(0)),
            Err(ConfigError::ZeroSampleCount { .. })
        ));
        assert!(matches!(
            space.opt_range(OptRange::new("x", 1.0, 2.0).log_base(1.0)),
            Err(ConfigError::InvalidLogBase { .. })
        ));
        assert!(matches!(
            space.opt_range(OptRange::new("x", f64::NEG_INFINITY, 2.0)),
            Err(ConfigError::NonFiniteBound { .. })
        ));
        assert!(matches!(
            space.opt_list(OptList::new::<i64>("x", vec![]).tunable()),
            Err(ConfigError::EmptyCandidates { .. })
        ));
    }

    #[test]
    fn range_samples_are_frozen_and_in_bounds() {
        let mut space = ParameterSpace::with_seed(7);
        let arg = space
            .opt_range(OptRange::new("dropout", 0.1, 0.5).samples(25).tunable())
            .unwrap()
            .clone();
        assert_eq!(arg.candidates.len(), 25);
        for v in &arg.candidates {
            let v = v.as_f64().unwrap();
            assert!((0.1..=0.5).contains(&v), "out of bounds: {v}");
        }

        // flattening twice sees the same frozen values
        assert_eq!(space.flatten(), space.flatten());
    }

    #[test]
    fn log_range_samples_stay_in_bounds() {
        let mut space = ParameterSpace::with_seed(3);
        let arg = space
            .opt_range(OptRange::new("lr", 1e-5, 1e-1).samples(100).log_base(10.0).tunable())
            .unwrap();
        assert_eq!(arg.candidates.len(), 100);
        for v in &arg.candidates {
            let v = v.as_f64().unwrap();
            assert!((1e-5..=1e-1).contains(&v), "lr out of bounds: {v}");
        }
    }

    #[test]
    fn same_seed_gives_same_candidates() {
        let decl = OptRange::new("lr", 0.0, 1.0).samples(5).tunable();
        let mut a = ParameterSpace::with_seed(42);
        let mut b = ParameterSpace::with_seed(42);
        assert_eq!(
            a.opt_range(decl.clone()).unwrap().candidates,
            b.opt_range(decl).unwrap().candidates
        );
    }

    #[test]
    fn range_without_samples_uses_bounds() {
        let mut space = ParameterSpace::with_seed(1);
        let arg = space
            .opt_range(OptRange::new("momentum", 0.8, 0.99).bounds_only())
            .unwrap();
        assert_eq!(
            arg.candidates,
            vec![ParameterValue::Float(0.8), ParameterValue::Float(0.99)]
        );
    }

    #[test]
    fn flatten_skips_non_tunable_and_cleans_names() {
        let mut space = ParameterSpace::with_seed(1);
        space
            .opt_list(OptList::new("--batch-size", [16, 32]).tunable())
            .unwrap();
        space.opt_list(OptList::new("--seed", [1, 2, 3])).unwrap();
        space
            .opt_list(OptList::new("optimizer", ["adam", "sgd", "rmsprop"]).tunable())
            .unwrap();

        let flat = space.flatten();
        assert_eq!(flat.groups.len(), 2);
        assert_eq!(flat.groups[0].len(), 2);
        assert_eq!(flat.groups[0][0].name, "batchsize");
        assert_eq!(flat.groups[0][0].index, 0);
        // index is the declaration slot, non-tunable slots included
        assert_eq!(flat.groups[1][0].index, 2);
        assert_eq!(flat.groups[1][2].value, ParameterValue::from("rmsprop"));
        assert_eq!(flat.grid_size(), Some(6));
    }

    #[test]
    fn redeclaration_replaces_in_place() {
        let mut space = ParameterSpace::with_seed(1);
        space.opt_list(OptList::new("a", [1, 2]).tunable()).unwrap();
        space.opt_list(OptList::new("b", [3]).tunable()).unwrap();
        space.opt_list(OptList::new("a", [9]).tunable()).unwrap();

        assert_eq!(space.len(), 2);
        let flat = space.flatten();
        assert_eq!(flat.groups[0][0].index, 0);
        assert_eq!(flat.groups[0][0].value, ParameterValue::Int(9));
        assert_eq!(flat.groups[0].len(), 1);
    }

    #[test]
    fn trial_lookup_prefers_later_groups() {
        let trial = Trial::new(vec![
            Assignment { index: 0, name: "lr".into(), value: 0.1.into() },
            Assignment { index: 1, name: "lr".into(), value: 0.2.into() },
        ]);
        assert_eq!(trial.get("lr"), Some(&ParameterValue::Float(0.2)));
    }

    #[test]
    fn declarations_deserialize_with_defaults() {
        let range: OptRange = serde_json::from_str(r#"{"id": "lr", "low": 0.001, "high": 0.1}"#).unwrap();
        assert_eq!(range.sample_count, Some(10));
        assert!(!range.tunable);

        let list: OptList = serde_json::from_str(r#"{"id": "act", "options": ["relu", 3], "tunable": true}"#).unwrap();
        assert_eq!(list.options[1], ParameterValue::Int(3));
    }
}
