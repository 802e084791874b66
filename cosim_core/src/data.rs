//! Payload shapes exchanged by `step`, `get_data` and `set_data`.

use serde_json::Value;
use std::collections::BTreeMap;

/// `step` inputs: dest eid -> dest attr -> source full id -> value.
pub type Inputs = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

/// `get_data` request: eid -> attribute names.
pub type OutputRequest = BTreeMap<String, Vec<String>>;

/// `get_data` reply: eid -> attr -> value.
pub type OutputData = BTreeMap<String, BTreeMap<String, Value>>;

/// Remote `get_data` request: full id -> attribute names.
pub type RemoteDataRequest = BTreeMap<String, Vec<String>>;

/// Remote `set_data` payload: source full id -> dest full id -> attr -> value.
pub type SetData = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;
