/*!
 * Capability contracts and the validator that enforces them.
 *
 * A contract maps operation parameter names to a [`Constraint`]. Every
 * validated call is checked against the *live* contract of the instance it
 * targets, so drivers that rewrite their own envelope after a mode change
 * are enforced with the envelope currently in force.
 *
 * Rules applied per supplied argument:
 *
 * - `Null` arguments are unspecified and skipped.
 * - Parameters with no declared constraint are skipped.
 * - [`Constraint::Range`] fails on values below `min` or above `max`; numeric
 *   strings are coerced first and a missing bound is open.
 * - [`Constraint::Enumeration`] fails unless the value matches a member,
 *   case-insensitively for text and within a small tolerance for numbers.
 * - [`Constraint::Conditional`] picks a branch from the selector argument of
 *   the same call, falling back to the instance's recorded current value.
 *   An unknown or missing selector value produces a warning, never an error.
 * - [`Constraint::Unconstrained`] produces a warning.
 *
 * Values are never clamped.
 */
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use benchflow_core::types::Value;
use benchflow_core::utils::is_close;

/// Relative tolerance for numeric enumeration members
pub const ENUM_REL_TOLERANCE: f64 = 1e-5;
/// Absolute tolerance for numeric enumeration members
pub const ENUM_ABS_TOLERANCE: f64 = 1e-8;

/// Legal values for a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Inclusive numeric interval; a missing bound is unbounded
    Range {
        /// Lower bound
        #[serde(default)]
        min: Option<f64>,
        /// Upper bound
        #[serde(default)]
        max: Option<f64>,
    },
    /// Finite set of allowed values
    Enumeration {
        /// Allowed members
        members: Vec<Value>,
    },
    /// Constraint selected by the value of another parameter
    Conditional {
        /// Name of the selector parameter
        selector: String,
        /// Branch per selector value, keyed case-insensitively
        branches: BTreeMap<String, Constraint>,
    },
    /// Declared but intentionally unchecked
    Unconstrained,
}

impl Constraint {
    /// Closed interval `[min, max]`
    pub fn range(min: f64, max: f64) -> Self {
        Constraint::Range {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Interval with only a lower bound
    pub fn at_least(min: f64) -> Self {
        Constraint::Range {
            min: Some(min),
            max: None,
        }
    }

    /// Interval with only an upper bound
    pub fn at_most(max: f64) -> Self {
        Constraint::Range {
            min: None,
            max: Some(max),
        }
    }

    /// Enumeration of the given members
    pub fn one_of<I, V>(members: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Constraint::Enumeration {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Conditional on `selector`, one branch per selector value
    pub fn conditional<S, I, K>(selector: S, branches: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (K, Constraint)>,
        K: AsRef<str>,
    {
        Constraint::Conditional {
            selector: selector.into(),
            branches: branches
                .into_iter()
                .map(|(k, c)| (normalize_key(k.as_ref()), c))
                .collect(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Constraint::Range { .. } => "range",
            Constraint::Enumeration { .. } => "enumeration",
            Constraint::Conditional { .. } => "conditional",
            Constraint::Unconstrained => "unconstrained",
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Per-parameter envelopes for a driver class or instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityContract {
    constraints: BTreeMap<String, Constraint>,
}

impl CapabilityContract {
    /// Create an empty contract
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion
    pub fn with<S: Into<String>>(mut self, parameter: S, constraint: Constraint) -> Self {
        self.constraints.insert(parameter.into(), constraint);
        self
    }

    /// Declare or replace the constraint of a parameter
    pub fn insert<S: Into<String>>(&mut self, parameter: S, constraint: Constraint) -> Option<Constraint> {
        self.constraints.insert(parameter.into(), constraint)
    }

    /// Remove a declaration
    pub fn remove(&mut self, parameter: &str) -> Option<Constraint> {
        self.constraints.remove(parameter)
    }

    /// Constraint declared for a parameter
    pub fn get(&self, parameter: &str) -> Option<&Constraint> {
        self.constraints.get(parameter)
    }

    /// Whether a parameter has a declaration
    pub fn declares(&self, parameter: &str) -> bool {
        self.constraints.contains_key(parameter)
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Whether nothing is declared
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Iterate over declarations in parameter order
    pub fn iter(&self) -> btree_map::Iter<'_, String, Constraint> {
        self.constraints.iter()
    }

    /// Layer a more specific contract over this one.
    ///
    /// Entries of `child` replace entries of `self` with the same name.
    pub fn overlay(mut self, child: &CapabilityContract) -> Self {
        for (parameter, constraint) in child.iter() {
            self.constraints.insert(parameter.clone(), constraint.clone());
        }
        self
    }
}

/// Arguments of a single operation call
///
/// A `Null` value means "left unspecified by the caller".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallArgs(BTreeMap<String, Value>);

impl CallArgs {
    /// Create an empty argument set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert an argument
    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        self.0.insert(name.into(), value.into());
    }

    /// Argument value, `None` when absent or `Null`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Iterate over the specified (non-null) arguments
    pub fn specified(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().filter(|(_, v)| !v.is_null())
    }

    /// Whether no argument was specified
    pub fn is_empty(&self) -> bool {
        self.specified().next().is_none()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for CallArgs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Recorded current values of an instance's constrained parameters
pub type InstanceState = BTreeMap<String, Value>;

/// Selector context of a conditional branch
#[derive(Debug, Clone, PartialEq)]
pub struct BranchContext {
    /// Selector parameter name
    pub selector: String,
    /// Selector value that chose the branch
    pub value: String,
}

impl fmt::Display for BranchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " (when {} = {})", self.selector, self.value)
    }
}

fn describe_branch(branch: &Option<BranchContext>) -> String {
    branch.as_ref().map(|b| b.to_string()).unwrap_or_default()
}

fn describe_bound(bound: &Option<f64>, open: &str) -> String {
    bound.map(|b| b.to_string()).unwrap_or_else(|| open.to_string())
}

/// An argument outside its declared envelope
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    /// Value outside a range, or not numeric at all
    #[error(
        "{parameter} = {value} is outside [{}, {}]{}",
        describe_bound(.min, "-inf"),
        describe_bound(.max, "inf"),
        describe_branch(.branch)
    )]
    Range {
        /// Parameter name
        parameter: String,
        /// Offending value as supplied
        value: String,
        /// Lower bound in force
        min: Option<f64>,
        /// Upper bound in force
        max: Option<f64>,
        /// Conditional branch in force, if any
        branch: Option<BranchContext>,
    },

    /// Value not among the allowed members
    #[error("{parameter} = {value} is not one of {allowed:?}{}", describe_branch(.branch))]
    Enumeration {
        /// Parameter name
        parameter: String,
        /// Offending value as supplied
        value: String,
        /// Allowed members
        allowed: Vec<String>,
        /// Conditional branch in force, if any
        branch: Option<BranchContext>,
    },
}

impl ContractViolation {
    /// Name of the offending parameter
    pub fn parameter(&self) -> &str {
        match self {
            ContractViolation::Range { parameter, .. } => parameter,
            ContractViolation::Enumeration { parameter, .. } => parameter,
        }
    }
}

/// A check that could not be carried out
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// The parameter is declared unconstrained
    Unconstrained {
        /// Parameter name
        parameter: String,
    },
    /// No branch is declared for the selector value
    UnknownSelectorValue {
        /// Parameter name
        parameter: String,
        /// Selector parameter name
        selector: String,
        /// Selector value without a branch
        value: String,
    },
    /// The selector value is neither in the call nor recorded
    MissingSelector {
        /// Parameter name
        parameter: String,
        /// Selector parameter name
        selector: String,
    },
    /// A branch is itself conditional, which is not evaluated
    NestedConditional {
        /// Parameter name
        parameter: String,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::Unconstrained { parameter } => {
                write!(f, "{} is declared unconstrained; value not verified", parameter)
            }
            ValidationWarning::UnknownSelectorValue {
                parameter,
                selector,
                value,
            } => write!(
                f,
                "{} has no envelope for {} = {}; value not verified",
                parameter, selector, value
            ),
            ValidationWarning::MissingSelector { parameter, selector } => write!(
                f,
                "{} depends on {} which is not known; value not verified",
                parameter, selector
            ),
            ValidationWarning::NestedConditional { parameter } => {
                write!(f, "{} has a nested conditional envelope; value not verified", parameter)
            }
        }
    }
}

/// Outcome of a successful validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Checks that were skipped with a warning
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// Whether every declared check was carried out
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, warning: ValidationWarning) {
        warn!(%warning, "Contract check skipped");
        self.warnings.push(warning);
    }
}

/// Checks call arguments against a contract
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractValidator;

impl ContractValidator {
    /// Validate `args` against `contract`.
    ///
    /// `state` holds the instance's recorded values and is consulted only for
    /// conditional selectors missing from the call. The first violation found,
    /// in parameter order, is returned.
    pub fn validate(
        contract: &CapabilityContract,
        args: &CallArgs,
        state: &InstanceState,
    ) -> Result<ValidationReport, ContractViolation> {
        let mut report = ValidationReport::default();

        for (parameter, value) in args.specified() {
            let Some(constraint) = contract.get(parameter) else {
                continue;
            };

            match constraint {
                Constraint::Conditional { selector, branches } => {
                    let selector_value = args
                        .get(selector)
                        .or_else(|| state.get(selector).filter(|v| !v.is_null()));

                    let Some(selector_value) = selector_value else {
                        report.warn(ValidationWarning::MissingSelector {
                            parameter: parameter.clone(),
                            selector: selector.clone(),
                        });
                        continue;
                    };

                    let key = selector_value.normalized();
                    let branch = branches
                        .iter()
                        .find(|(k, _)| normalize_key(k) == key)
                        .map(|(_, c)| c);

                    match branch {
                        None => report.warn(ValidationWarning::UnknownSelectorValue {
                            parameter: parameter.clone(),
                            selector: selector.clone(),
                            value: selector_value.to_string(),
                        }),
                        Some(Constraint::Conditional { .. }) => {
                            report.warn(ValidationWarning::NestedConditional {
                                parameter: parameter.clone(),
                            })
                        }
                        Some(leaf) => {
                            let context = BranchContext {
                                selector: selector.clone(),
                                value: selector_value.to_string(),
                            };
                            Self::check_leaf(parameter, value, leaf, Some(context), &mut report)?;
                        }
                    }
                }
                leaf => Self::check_leaf(parameter, value, leaf, None, &mut report)?,
            }
        }

        Ok(report)
    }

    fn check_leaf(
        parameter: &str,
        value: &Value,
        constraint: &Constraint,
        branch: Option<BranchContext>,
        report: &mut ValidationReport,
    ) -> Result<(), ContractViolation> {
        match constraint {
            Constraint::Range { min, max } => {
                let within = value.to_f64().is_some_and(|v| {
                    !v.is_nan()
                        && min.map_or(true, |lo| v >= lo)
                        && max.map_or(true, |hi| v <= hi)
                });
                if within {
                    Ok(())
                } else {
                    Err(ContractViolation::Range {
                        parameter: parameter.to_string(),
                        value: value.to_string(),
                        min: *min,
                        max: *max,
                        branch,
                    })
                }
            }
            Constraint::Enumeration { members } => {
                if members.iter().any(|member| member_matches(member, value)) {
                    Ok(())
                } else {
                    Err(ContractViolation::Enumeration {
                        parameter: parameter.to_string(),
                        value: value.to_string(),
                        allowed: members.iter().map(|m| m.to_string()).collect(),
                        branch,
                    })
                }
            }
            Constraint::Unconstrained => {
                report.warn(ValidationWarning::Unconstrained {
                    parameter: parameter.to_string(),
                });
                Ok(())
            }
            Constraint::Conditional { .. } => {
                report.warn(ValidationWarning::NestedConditional {
                    parameter: parameter.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Record every constrained argument of a completed call into `state`
    pub fn record(contract: &CapabilityContract, args: &CallArgs, state: &mut InstanceState) {
        for (parameter, value) in args.specified() {
            if contract.declares(parameter) {
                state.insert(parameter.clone(), value.clone());
            }
        }
    }
}

/// Whether `value` selects enumeration `member`
///
/// Numbers compare within [`ENUM_REL_TOLERANCE`] / [`ENUM_ABS_TOLERANCE`];
/// everything else compares as trimmed, lowercased text.
pub fn member_matches(member: &Value, value: &Value) -> bool {
    if member.is_numeric() || value.is_numeric() {
        if let (Some(m), Some(v)) = (member.to_f64(), value.to_f64()) {
            return is_close(m, v, ENUM_REL_TOLERANCE, ENUM_ABS_TOLERANCE);
        }
    }
    member.normalized() == value.normalized()
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Range { min, max } => write!(
                f,
                "range [{}, {}]",
                describe_bound(min, "-inf"),
                describe_bound(max, "inf")
            ),
            Constraint::Enumeration { members } => {
                let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                write!(f, "one of {{{}}}", members.join(", "))
            }
            Constraint::Conditional { selector, branches } => {
                write!(f, "depends on {} ({} branches)", selector, branches.len())
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> CapabilityContract {
        CapabilityContract::new()
            .with("voltage", Constraint::range(-210.0, 210.0))
            .with("offset", Constraint::at_least(0.0))
            .with("coupling", Constraint::one_of(["AC", "DC"]))
            .with("sensitivity", Constraint::one_of([2e-9, 5e-9, 1e-3]))
            .with("note", Constraint::Unconstrained)
            .with(
                "frequency",
                Constraint::conditional(
                    "func",
                    [
                        ("SIN", Constraint::range(1e-6, 240e6)),
                        ("SQU", Constraint::range(1e-6, 120e6)),
                    ],
                ),
            )
    }

    fn check(args: CallArgs) -> Result<ValidationReport, ContractViolation> {
        ContractValidator::validate(&contract(), &args, &InstanceState::new())
    }

    #[test]
    fn test_range_bounds_inclusive() {
        assert!(check(CallArgs::new().with("voltage", -210.0)).is_ok());
        assert!(check(CallArgs::new().with("voltage", 210)).is_ok());

        let err = check(CallArgs::new().with("voltage", 210.0001)).unwrap_err();
        assert_eq!(err.parameter(), "voltage");
        assert!(matches!(err, ContractViolation::Range { .. }));
        assert!(check(CallArgs::new().with("voltage", -210.0001)).is_err());
    }

    #[test]
    fn test_range_coerces_numeric_strings() {
        assert!(check(CallArgs::new().with("voltage", "1.5e2")).is_ok());
        assert!(check(CallArgs::new().with("voltage", "300")).is_err());
        assert!(check(CallArgs::new().with("voltage", "high")).is_err());
    }

    #[test]
    fn test_open_ended_range() {
        assert!(check(CallArgs::new().with("offset", 1e12)).is_ok());
        let err = check(CallArgs::new().with("offset", -1)).unwrap_err();
        assert_eq!(err.to_string(), "offset = -1 is outside [0, inf]");
    }

    #[test]
    fn test_enumeration_case_insensitive() {
        for value in ["ac", "AC", "Ac", " dc "] {
            assert!(check(CallArgs::new().with("coupling", value)).is_ok(), "{}", value);
        }
        let err = check(CallArgs::new().with("coupling", "GND")).unwrap_err();
        assert!(matches!(err, ContractViolation::Enumeration { ref allowed, .. } if allowed.len() == 2));
    }

    #[test]
    fn test_numeric_enumeration_tolerance() {
        assert!(check(CallArgs::new().with("sensitivity", 1.000001e-3)).is_ok());
        assert!(check(CallArgs::new().with("sensitivity", "5e-9")).is_ok());
        assert!(check(CallArgs::new().with("sensitivity", 1.1e-3)).is_err());
    }

    #[test]
    fn test_unspecified_arguments_skipped() {
        let args = CallArgs::new()
            .with("voltage", Value::Null)
            .with("undeclared", 1e9);
        let report = check(args).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_unconstrained_warns() {
        let report = check(CallArgs::new().with("note", "anything")).unwrap();
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::Unconstrained {
                parameter: "note".into()
            }]
        );
    }

    #[test]
    fn test_conditional_branches() {
        let sin = CallArgs::new().with("func", "sin").with("frequency", 200e6);
        assert!(check(sin).is_ok());

        let squ = CallArgs::new().with("func", "SQU").with("frequency", 200e6);
        let err = check(squ).unwrap_err();
        assert_eq!(
            err.to_string(),
            "frequency = 200000000 is outside [0.000001, 120000000] (when func = SQU)"
        );
    }

    #[test]
    fn test_conditional_unknown_selector_warns() {
        let args = CallArgs::new().with("func", "PULSE").with("frequency", 1e12);
        let report = check(args).unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [ValidationWarning::UnknownSelectorValue { value, .. }] if value == "PULSE"
        ));
    }

    #[test]
    fn test_conditional_falls_back_to_recorded_state() {
        let mut state = InstanceState::new();
        state.insert("func".into(), Value::from("SQU"));
        let args = CallArgs::new().with("frequency", 200e6);
        assert!(ContractValidator::validate(&contract(), &args, &state).is_err());

        let report = check(CallArgs::new().with("frequency", 200e6)).unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [ValidationWarning::MissingSelector { .. }]
        ));
    }

    #[test]
    fn test_nested_conditional_warns() {
        let nested = CapabilityContract::new().with(
            "x",
            Constraint::conditional(
                "a",
                [("1", Constraint::conditional("b", [("2", Constraint::range(0.0, 1.0))]))],
            ),
        );
        let args = CallArgs::new().with("a", 1).with("b", 2).with("x", 5.0);
        let report = ContractValidator::validate(&nested, &args, &InstanceState::new()).unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [ValidationWarning::NestedConditional { .. }]
        ));
    }

    #[test]
    fn test_overlay_narrows_parent() {
        let parent = CapabilityContract::new()
            .with("voltage", Constraint::range(-10.0, 10.0))
            .with("coupling", Constraint::one_of(["AC", "DC"]));
        let child = CapabilityContract::new().with("voltage", Constraint::range(0.0, 5.0));
        let merged = parent.overlay(&child);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("voltage"), Some(&Constraint::range(0.0, 5.0)));
        assert!(merged.declares("coupling"));
    }

    #[test]
    fn test_record_only_declared() {
        let mut state = InstanceState::new();
        let args = CallArgs::new()
            .with("voltage", 1.0)
            .with("undeclared", 2.0)
            .with("coupling", Value::Null);
        ContractValidator::record(&contract(), &args, &mut state);
        assert_eq!(state.len(), 1);
        assert_eq!(state.get("voltage"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn test_contract_deserializes_from_toml() {
        let contract: CapabilityContract = toml::from_str(
            r#"
            [voltage]
            kind = "range"
            min = -10
            max = 10.5

            [mode]
            kind = "enumeration"
            members = ["fast", "slow", 3]

            [level]
            kind = "unconstrained"
            "#,
        )
        .unwrap();
        assert_eq!(
            contract.get("voltage"),
            Some(&Constraint::Range {
                min: Some(-10.0),
                max: Some(10.5)
            })
        );
        assert_eq!(contract.get("level"), Some(&Constraint::Unconstrained));
        let args = CallArgs::new().with("mode", "FAST").with("voltage", 3);
        assert!(ContractValidator::validate(&contract, &args, &InstanceState::new()).is_ok());
    }
}
