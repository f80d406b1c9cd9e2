// Copyright 2026 the project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

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
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! Deterministic fingerprinting of `(function identity, selected arguments)` pairs.
//!
//! A [`Key`] is the 128-bit MD5 hash of a stable, structural encoding of the function's
//! fully-qualified name and a caller-chosen subset of its arguments. Two invocations with
//! byte-identical encodings always produce the same [`Key`], regardless of process or machine.

use std::fmt;
use std::str::FromStr;

use md5::{Digest as _, Md5};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const KEY_SIZE: usize = 16;

/// The default number of decimal digits floats are normalized to before hashing.
pub const DEFAULT_FLOAT_DIGITS: u32 = 8;

/// A 128-bit content address, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
  pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Key {
    Key(bytes)
  }

  pub fn from_hex_string(hex_string: &str) -> Result<Key, String> {
    let bytes: Vec<u8> = hex::decode(hex_string).map_err(|e| format!("{e:?}"))?;
    if bytes.len() != KEY_SIZE {
      return Err(format!(
        "Expected a {KEY_SIZE}-byte key, but given {} bytes",
        bytes.len()
      ));
    }
    let mut key = [0; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(Key(key))
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl fmt::Debug for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Key<{}>", self.to_hex())
  }
}

impl AsRef<[u8]> for Key {
  fn as_ref(&self) -> &[u8] {
    &self.0[..]
  }
}

impl FromStr for Key {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Key::from_hex_string(s)
  }
}

impl Serialize for Key {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Key {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct KeyVisitor;

    impl Visitor<'_> for KeyVisitor {
      type Value = Key;

      fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a 32-character hex key")
      }

      fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
      where
        E: serde::de::Error,
      {
        Key::from_hex_string(v).map_err(serde::de::Error::custom)
      }
    }

    deserializer.deserialize_str(KeyVisitor)
  }
}

/// A value in the dynamically-typed argument tree that callers fingerprint.
///
/// This stands in for the heterogeneous values (including nested sequences and mappings, and
/// references to functions) that a dynamically-typed caller might pass as arguments.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Bytes(Vec<u8>),
  /// An ordered sequence, hashed left-to-right.
  Seq(Vec<Value>),
  /// A mapping, hashed by iterating `(hash(k), hash(v))` in insertion order.
  Map(Vec<(Value, Value)>),
  /// A function-valued argument, reduced to its name before hashing.
  Func(String),
  /// A worker-runtime handle (e.g. a bound-task `self`/`task` receiver). Skipped when found as
  /// the leading positional argument; see [`key`].
  RuntimeHandle,
}

impl From<serde_json::Value> for Value {
  fn from(v: serde_json::Value) -> Value {
    match v {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Value::Int(i)
        } else {
          Value::Float(n.as_f64().unwrap_or(0.0))
        }
      }
      serde_json::Value::String(s) => Value::Str(s),
      serde_json::Value::Array(a) => Value::Seq(a.into_iter().map(Value::from).collect()),
      serde_json::Value::Object(o) => Value::Map(
        o.into_iter()
          .map(|(k, v)| (Value::Str(k), Value::from(v)))
          .collect(),
      ),
    }
  }
}

/// Writes a stable, structural encoding of [`Value`]s into an MD5 hasher, normalizing floats to
/// a fixed number of decimal digits so that mathematically-equal floats collapse to one key.
struct KeyHasher {
  hasher: Md5,
  float_digits: u32,
}

impl KeyHasher {
  fn new(float_digits: u32) -> KeyHasher {
    KeyHasher {
      hasher: Md5::default(),
      float_digits,
    }
  }

  fn write_tag(&mut self, tag: u8) {
    self.hasher.update([tag]);
  }

  fn write_str(&mut self, s: &str) {
    self.hasher.update((s.len() as u64).to_le_bytes());
    self.hasher.update(s.as_bytes());
  }

  fn write_bytes(&mut self, b: &[u8]) {
    self.hasher.update((b.len() as u64).to_le_bytes());
    self.hasher.update(b);
  }

  fn write_value(&mut self, value: &Value) {
    match value {
      Value::Null => self.write_tag(0),
      Value::Bool(b) => {
        self.write_tag(1);
        self.hasher.update([u8::from(*b)]);
      }
      Value::Int(i) => {
        self.write_tag(2);
        self.hasher.update(i.to_le_bytes());
      }
      Value::Float(f) => {
        // Normalize to a fixed decimal digit count so that e.g. 1.000000001 and 1.000000002
        // hash identically at the default precision, but differ at a higher one.
        self.write_tag(3);
        let normalized = format!("{:.*}", self.float_digits as usize, f);
        self.write_str(&normalized);
      }
      Value::Str(s) => {
        self.write_tag(4);
        self.write_str(s);
      }
      Value::Bytes(b) => {
        self.write_tag(5);
        self.write_bytes(b);
      }
      Value::Seq(items) => {
        self.write_tag(6);
        self.hasher.update((items.len() as u64).to_le_bytes());
        for item in items {
          self.write_value(item);
        }
      }
      Value::Map(entries) => {
        self.write_tag(7);
        self.hasher.update((entries.len() as u64).to_le_bytes());
        for (k, v) in entries {
          self.write_value(k);
          self.write_value(v);
        }
      }
      Value::Func(name) => {
        self.write_tag(8);
        self.write_str(name);
      }
      Value::RuntimeHandle => {
        // Should have been skipped by `key()`, but encode deterministically if it wasn't.
        self.write_tag(9);
      }
    }
  }

  fn finish(self) -> Key {
    let digest = self.hasher.finalize();
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest[..KEY_SIZE]);
    Key(bytes)
  }
}

/// Options controlling which arguments participate in a [`key`] computation.
#[derive(Clone, Debug, Default)]
pub struct KeyOptions {
  /// Restricts which kwargs participate. When present, positional args are excluded entirely.
  pub selected_keys: Option<Vec<String>>,
  /// Decimal digit count floats are normalized to. Defaults to [`DEFAULT_FLOAT_DIGITS`].
  pub float_digits: Option<u32>,
}

/// Computes the fingerprint of a `(function identity, selected arguments)` pair.
///
/// The leading positional argument is skipped if it is a [`Value::RuntimeHandle`], because its
/// string form varies by worker-runtime version and would otherwise make the key
/// non-deterministic across deployments.
pub fn key(func_id: &str, args: &[Value], kwargs: &[(String, Value)], options: &KeyOptions) -> Key {
  let float_digits = options.float_digits.unwrap_or(DEFAULT_FLOAT_DIGITS);
  let mut hasher = KeyHasher::new(float_digits);

  hasher.write_str("cache_results");
  hasher.write_str(func_id);

  match &options.selected_keys {
    Some(selected) => {
      // Selecting keys excludes positional args entirely, and only the named kwargs hash, in
      // the order the caller listed them (not the call's own order) so that reordering the
      // `selected_keys` configuration is itself a fingerprint-affecting change.
      let selected_kwargs: Vec<(Value, Value)> = selected
        .iter()
        .filter_map(|name| {
          kwargs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        })
        .collect();
      hasher.write_value(&Value::Map(selected_kwargs));
    }
    None => {
      let args = skip_leading_runtime_handle(args);
      hasher.write_value(&Value::Seq(args.to_vec()));
      let kwarg_entries: Vec<(Value, Value)> = kwargs
        .iter()
        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        .collect();
      hasher.write_value(&Value::Map(kwarg_entries));
    }
  }

  hasher.finish()
}

fn skip_leading_runtime_handle(args: &[Value]) -> &[Value] {
  match args.first() {
    Some(Value::RuntimeHandle) => &args[1..],
    _ => args,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn k(func: &str, args: &[Value]) -> Key {
    key(func, args, &[], &KeyOptions::default())
  }

  #[test]
  fn deterministic() {
    let a = k("pkg.mod.func", &[Value::Int(1), Value::Str("x".into())]);
    let b = k("pkg.mod.func", &[Value::Int(1), Value::Str("x".into())]);
    assert_eq!(a, b);
    assert_eq!(a.to_hex().len(), 32);
  }

  #[test]
  fn different_args_differ() {
    let a = k("pkg.mod.func", &[Value::Int(1)]);
    let b = k("pkg.mod.func", &[Value::Int(2)]);
    assert_ne!(a, b);
  }

  #[test]
  fn different_func_differs() {
    let a = k("pkg.mod.a", &[Value::Int(1)]);
    let b = k("pkg.mod.b", &[Value::Int(1)]);
    assert_ne!(a, b);
  }

  #[test]
  fn float_normalization_collapses_at_default_precision() {
    let a = key(
      "f",
      &[Value::Float(1.000_000_001)],
      &[],
      &KeyOptions::default(),
    );
    let b = key(
      "f",
      &[Value::Float(1.000_000_002)],
      &[],
      &KeyOptions::default(),
    );
    assert_eq!(a, b, "digits=8 should collapse a difference at the 9th decimal");
  }

  #[test]
  fn float_normalization_distinguishes_at_higher_precision() {
    let opts = KeyOptions {
      selected_keys: None,
      float_digits: Some(10),
    };
    let a = key("f", &[Value::Float(1.000_000_001)], &[], &opts);
    let b = key("f", &[Value::Float(1.000_000_002)], &[], &opts);
    assert_ne!(a, b, "digits=10 should distinguish a difference at the 9th decimal");
  }

  #[test]
  fn runtime_handle_is_skipped_when_leading() {
    let a = key(
      "f",
      &[Value::RuntimeHandle, Value::Int(1)],
      &[],
      &KeyOptions::default(),
    );
    let b = key("f", &[Value::Int(1)], &[], &KeyOptions::default());
    assert_eq!(a, b);
  }

  #[test]
  fn selected_keys_excludes_positional_args() {
    let opts = KeyOptions {
      selected_keys: Some(vec!["mode".to_string()]),
      float_digits: None,
    };
    let a = key(
      "f",
      &[Value::Int(999)],
      &[("mode".to_string(), Value::Str("A".into()))],
      &opts,
    );
    let b = key(
      "f",
      &[Value::Int(1)],
      &[("mode".to_string(), Value::Str("A".into()))],
      &opts,
    );
    assert_eq!(a, b, "positional args must not participate when selected_keys is set");
  }

  #[test]
  fn selected_keys_ignores_unselected_kwargs() {
    let opts = KeyOptions {
      selected_keys: Some(vec!["mode".to_string()]),
      float_digits: None,
    };
    let a = key(
      "f",
      &[],
      &[
        ("mode".to_string(), Value::Str("A".into())),
        ("noise".to_string(), Value::Int(1)),
      ],
      &opts,
    );
    let b = key(
      "f",
      &[],
      &[
        ("mode".to_string(), Value::Str("A".into())),
        ("noise".to_string(), Value::Int(2)),
      ],
      &opts,
    );
    assert_eq!(a, b);
  }

  #[test]
  fn nested_containers_hash_structurally() {
    let a = k("f", &[Value::Seq(vec![Value::Int(1), Value::Int(2)])]);
    let b = k("f", &[Value::Seq(vec![Value::Int(2), Value::Int(1)])]);
    assert_ne!(a, b, "sequences are hashed left-to-right, so order matters");
  }

  #[test]
  fn function_values_reduce_to_name() {
    let a = k("f", &[Value::Func("module.callback".into())]);
    let b = k("f", &[Value::Func("module.callback".into())]);
    assert_eq!(a, b);
  }

  #[test]
  fn key_round_trips_through_hex() {
    let a = k("f", &[Value::Int(42)]);
    let parsed = Key::from_hex_string(&a.to_hex()).unwrap();
    assert_eq!(a, parsed);
  }

  #[test]
  fn from_json_value_converts_nested_structures() {
    let json = serde_json::json!({"a": [1, 2.5, "x", null, true]});
    let value: Value = json.into();
    match value {
      Value::Map(entries) => assert_eq!(entries.len(), 1),
      other => panic!("expected a map, got {other:?}"),
    }
  }
}
