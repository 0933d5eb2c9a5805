//! Placement constraints.
//!
//! ## Design Principles
//!
//! - The operand travels as the submitted string so unknown operands can be
//!   reported verbatim; [`ConstraintOperand`] is the closed set we act on
//! - Targets are either literals or a single `${path}` interpolation of a
//!   known node attribute

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::version::VersionConstraint;

/// Interpolation paths accepted verbatim inside `${...}`.
pub const EXACT_TARGETS: &[&str] = &[
    "node.unique.id",
    "node.datacenter",
    "node.unique.name",
    "node.class",
    "node.pool",
];

/// Interpolation path prefixes accepted inside `${...}`.
pub const PREFIX_TARGETS: &[&str] = &["attr.", "meta."];

/// The closed set of constraint operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOperand {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Regex,
    Version,
    Semver,
    SetContains,
    SetContainsAll,
    SetContainsAny,
    IsSet,
    IsNotSet,
    DistinctHosts,
    DistinctProperty,
}

impl ConstraintOperand {
    /// Parses an operand, accepting the `==`, `is` and `not` aliases.
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s {
            "=" | "==" | "is" => Self::Equal,
            "!=" | "not" => Self::NotEqual,
            "<" => Self::Less,
            "<=" => Self::LessEqual,
            ">" => Self::Greater,
            ">=" => Self::GreaterEqual,
            "regexp" => Self::Regex,
            "version" => Self::Version,
            "semver" => Self::Semver,
            "set_contains" => Self::SetContains,
            "set_contains_all" => Self::SetContainsAll,
            "set_contains_any" => Self::SetContainsAny,
            "is_set" => Self::IsSet,
            "is_not_set" => Self::IsNotSet,
            "distinct_hosts" => Self::DistinctHosts,
            "distinct_property" => Self::DistinctProperty,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Regex => "regexp",
            Self::Version => "version",
            Self::Semver => "semver",
            Self::SetContains => "set_contains",
            Self::SetContainsAll => "set_contains_all",
            Self::SetContainsAny => "set_contains_any",
            Self::IsSet => "is_set",
            Self::IsNotSet => "is_not_set",
            Self::DistinctHosts => "distinct_hosts",
            Self::DistinctProperty => "distinct_property",
        }
    }

    /// Operators that only make sense across the allocations of a group.
    pub fn is_group_only(&self) -> bool {
        matches!(self, Self::DistinctHosts | Self::DistinctProperty)
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Less
                | Self::LessEqual
                | Self::Greater
                | Self::GreaterEqual
        )
    }
}

impl fmt::Display for ConstraintOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A placement constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    pub ltarget: String,
    pub rtarget: String,
    pub operand: String,
    #[serde(default)]
    pub weight: i8,
}

impl Constraint {
    pub fn new(
        ltarget: impl Into<String>,
        operand: impl Into<String>,
        rtarget: impl Into<String>,
    ) -> Self {
        Self {
            ltarget: ltarget.into(),
            rtarget: rtarget.into(),
            operand: operand.into(),
            weight: 0,
        }
    }

    /// The parsed operand, `None` when unknown.
    pub fn operand(&self) -> Option<ConstraintOperand> {
        ConstraintOperand::parse(&self.operand)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        self.validate_with_targets(true)
    }

    /// Validates a constraint on a requested device, whose targets address
    /// device attributes rather than node attributes.
    pub fn validate_device(&self) -> Result<(), ValidationErrors> {
        self.validate_with_targets(false)
    }

    fn validate_with_targets(&self, node_targets: bool) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.operand.is_empty() {
            errs.push("Missing constraint operand");
        }

        let mut require_ltarget = true;
        // Pattern operands carry a pattern, not a target, on the right.
        let mut check_rtarget = true;

        match self.operand() {
            Some(ConstraintOperand::DistinctHosts) => require_ltarget = false,
            Some(
                ConstraintOperand::SetContains
                | ConstraintOperand::SetContainsAll
                | ConstraintOperand::SetContainsAny,
            ) => {
                if self.rtarget.is_empty() {
                    errs.push("Set contains constraint requires an RTarget");
                }
            }
            Some(ConstraintOperand::Regex) => {
                check_rtarget = false;
                if let Err(err) = Regex::new(&self.rtarget) {
                    errs.push(format!("Regular expression failed to compile: {err}"));
                }
            }
            Some(ConstraintOperand::Version) => {
                check_rtarget = false;
                if let Err(err) = VersionConstraint::parse(&self.rtarget) {
                    errs.push(format!("Version constraint is invalid: {err}"));
                }
            }
            Some(ConstraintOperand::Semver) => {
                check_rtarget = false;
                if let Err(err) = VersionConstraint::parse_semver(&self.rtarget) {
                    errs.push(format!("Semver constraint is invalid: {err}"));
                }
            }
            Some(ConstraintOperand::DistinctProperty) => {
                if !self.rtarget.is_empty() {
                    match self.rtarget.parse::<u64>() {
                        Err(err) => errs.push(format!(
                            "Failed to convert RTarget {:?} to uint64: {err}",
                            self.rtarget
                        )),
                        Ok(0) => errs.push(
                            "Distinct Property must have an allowed count of 1 or greater: 0 < 1",
                        ),
                        Ok(_) => {}
                    }
                }
            }
            Some(ConstraintOperand::IsSet | ConstraintOperand::IsNotSet) => {
                if !self.rtarget.is_empty() {
                    errs.push(format!(
                        "Operator {:?} does not support an RTarget",
                        self.operand
                    ));
                }
            }
            Some(op) if op.is_comparison() => {
                if self.rtarget.is_empty() {
                    errs.push(format!("Operator {:?} requires an RTarget", self.operand));
                }
            }
            Some(_) => {}
            None if self.operand.is_empty() => {}
            None => errs.push(format!("Unknown constraint type {:?}", self.operand)),
        }

        if require_ltarget && self.ltarget.is_empty() {
            errs.push("No LTarget provided but is required by constraint");
        }
        if !node_targets {
            return errs.into_result();
        }
        if let Err(msg) = validate_target(&self.ltarget) {
            errs.push(msg);
        }
        if check_rtarget {
            if let Err(msg) = validate_target(&self.rtarget) {
                errs.push(msg);
            }
        }
        errs.into_result()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.ltarget, self.operand, self.rtarget)
    }
}

/// Checks that a constraint target is a literal or a supported `${path}`.
///
/// The error names the target verbatim.
pub fn validate_target(target: &str) -> Result<(), String> {
    let Some(rest) = target.strip_prefix("${") else {
        if target.starts_with('$') && !target.starts_with("${") && target.ends_with('}') {
            return Err(format!(
                "attribute {target:?} is missing an opening brace"
            ));
        }
        return Ok(());
    };
    let Some(interior) = rest.strip_suffix('}') else {
        return Err(format!("attribute {target:?} is missing a closing brace"));
    };
    let known = EXACT_TARGETS.contains(&interior)
        || PREFIX_TARGETS
            .iter()
            .any(|prefix| interior.len() > prefix.len() && interior.starts_with(prefix));
    if known {
        Ok(())
    } else {
        Err(format!("unsupported attribute {target:?}"))
    }
}
