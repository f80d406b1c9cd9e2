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

//! Wire formats installed artifacts are tagged with, so that a later reader knows how to decode
//! the bytes it downloads without out-of-band knowledge of who produced them.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Identifies the encoding a cached value was serialized with. Persisted alongside the value
/// (see the `_meta` record an installed artifact carries) so a reader never has to guess.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
  /// The value is already a byte string; no (de)serialization happens.
  Raw,
  /// MessagePack. The default for graph-shaped values, per the format's compactness and
  /// unambiguous binary framing.
  MsgPack,
  /// JSON. Accepted for small, human-inspectable graphs.
  Json,
  /// A pickle-compatible tagged format, for values produced by callers that still speak pickle.
  PickleEquivalent,
}

impl Tag {
  pub fn as_str(&self) -> &'static str {
    match self {
      Tag::Raw => "raw",
      Tag::MsgPack => "msgpack",
      Tag::Json => "json",
      Tag::PickleEquivalent => "pickle",
    }
  }
}

impl std::str::FromStr for Tag {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "raw" => Ok(Tag::Raw),
      "msgpack" => Ok(Tag::MsgPack),
      "json" => Ok(Tag::Json),
      "pickle" => Ok(Tag::PickleEquivalent),
      other => Err(Error::UnknownTag(other.to_string())),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("unknown serialization tag: {0}")]
  UnknownTag(String),
  #[error("msgpack encode failed: {0}")]
  MsgPackEncode(#[from] rmp_serde::encode::Error),
  #[error("msgpack decode failed: {0}")]
  MsgPackDecode(#[from] rmp_serde::decode::Error),
  #[error("json encode/decode failed: {0}")]
  Json(#[from] serde_json::Error),
  #[error("pickle-equivalent encode/decode failed: {0}")]
  Pickle(String),
}

/// Encodes `value` under the given tag. `Tag::Raw` is rejected here: raw bytes bypass
/// serialization entirely and are installed directly by the caller.
pub fn encode<T: Serialize>(value: &T, tag: Tag) -> Result<Vec<u8>, Error> {
  match tag {
    Tag::Raw => Err(Error::UnknownTag("raw".to_string())),
    Tag::MsgPack => Ok(rmp_serde::to_vec(value)?),
    Tag::Json => Ok(serde_json::to_vec(value)?),
    Tag::PickleEquivalent => {
      serde_pickle::to_vec(value, Default::default()).map_err(|e| Error::Pickle(e.to_string()))
    }
  }
}

/// Decodes bytes previously produced by [`encode`] under the given tag.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], tag: Tag) -> Result<T, Error> {
  match tag {
    Tag::Raw => Err(Error::UnknownTag("raw".to_string())),
    Tag::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
    Tag::Json => Ok(serde_json::from_slice(bytes)?),
    Tag::PickleEquivalent => {
      serde_pickle::from_slice(bytes, Default::default()).map_err(|e| Error::Pickle(e.to_string()))
    }
  }
}

/// The default tag new installs should use, absent an explicit caller preference: msgpack is
/// compact and unambiguous for the nested graph shapes this system caches.
pub fn default_tag() -> Tag {
  Tag::MsgPack
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Serialize, Deserialize, PartialEq)]
  struct Sample {
    name: String,
    values: Vec<i64>,
  }

  fn sample() -> Sample {
    Sample {
      name: "widget".to_string(),
      values: vec![1, 2, 3],
    }
  }

  #[test]
  fn msgpack_round_trips() {
    let bytes = encode(&sample(), Tag::MsgPack).unwrap();
    let decoded: Sample = decode(&bytes, Tag::MsgPack).unwrap();
    assert_eq!(decoded, sample());
  }

  #[test]
  fn json_round_trips() {
    let bytes = encode(&sample(), Tag::Json).unwrap();
    let decoded: Sample = decode(&bytes, Tag::Json).unwrap();
    assert_eq!(decoded, sample());
  }

  #[test]
  fn pickle_equivalent_round_trips() {
    let bytes = encode(&sample(), Tag::PickleEquivalent).unwrap();
    let decoded: Sample = decode(&bytes, Tag::PickleEquivalent).unwrap();
    assert_eq!(decoded, sample());
  }

  #[test]
  fn raw_tag_is_rejected_for_structured_encode() {
    assert!(encode(&sample(), Tag::Raw).is_err());
  }

  #[test]
  fn tag_round_trips_through_str() {
    for tag in [Tag::Raw, Tag::MsgPack, Tag::Json, Tag::PickleEquivalent] {
      let parsed: Tag = tag.as_str().parse().unwrap();
      assert_eq!(parsed, tag);
    }
  }

  #[test]
  fn unknown_tag_string_is_rejected() {
    assert!("protobuf".parse::<Tag>().is_err());
  }

  #[test]
  fn default_tag_is_msgpack() {
    assert_eq!(default_tag(), Tag::MsgPack);
  }
}
