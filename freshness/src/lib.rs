#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! Decides whether a cached artifact is still fresh enough to serve, given the call it would be
//! serving and the artifact's recorded modification time.

use std::collections::HashMap;

/// A scalar argument value, compared for equality against a freshness spec's barrier entries.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
  Str(String),
  Int(i64),
  Bool(bool),
}

/// A freshness policy attached to a cached function, deciding whether a given artifact's age
/// disqualifies it from being served for a particular call.
#[derive(Clone, Debug)]
pub enum FreshnessSpec {
  /// The artifact must have been produced after this instant; `mtime > t`.
  Timestamp(i64),
  /// Per-argument barriers: the artifact fails if any listed `(value, barrier)` pair matches the
  /// call's argument for that name and the artifact predates the barrier.
  PerArgument(HashMap<String, Vec<(ArgValue, i64)>>),
}

/// Evaluates `spec` against an artifact's `mtime` and the call's keyword arguments.
///
/// Absent specs always pass. Malformed specs (a `PerArgument` spec referencing an argument name
/// the call doesn't carry) fail closed: they return `false` and log a warning, rather than
/// silently treating the artifact as fresh.
pub fn passes(
  spec: Option<&FreshnessSpec>,
  artifact_mtime: i64,
  call_kwargs: &HashMap<String, ArgValue>,
) -> bool {
  match spec {
    None => true,
    Some(FreshnessSpec::Timestamp(t)) => artifact_mtime > *t,
    Some(FreshnessSpec::PerArgument(barriers)) => {
      for (arg_name, entries) in barriers {
        let Some(call_value) = call_kwargs.get(arg_name) else {
          log::warn!(
            "freshness spec references argument {arg_name:?} which the call does not carry; \
             failing closed"
          );
          return false;
        };
        for (expected_value, barrier) in entries {
          if call_value == expected_value && artifact_mtime < *barrier {
            return false;
          }
        }
      }
      true
    }
  }
}
