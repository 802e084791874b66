//! Per-simulator input buffer.
//!
//! Values routed to a simulator wait here until its next step. Each slot is
//! keyed by destination entity, destination attribute and source entity.
//! Plain values replace each other (latest wins). Values arriving over a
//! time-shifted edge are tagged with the time they were produced at and
//! only become visible to steps strictly later than that time, so a slot
//! may carry them over several deliveries.

use crate::data::Inputs;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Slot {
    /// Latest value visible to the next step
    current: Option<(u64, Value)>,

    /// Time-shifted values, ascending by production time
    shifted: Vec<(u64, Value)>,
}

impl Slot {
    fn push_shifted(&mut self, produced_at: u64, value: Value) {
        let idx = self.shifted.partition_point(|(t, _)| *t <= produced_at);
        self.shifted.insert(idx, (produced_at, value));
    }

    /// Removes and returns the value visible at `time`, if any.
    fn take(&mut self, time: u64) -> Option<Value> {
        let visible = self.shifted.partition_point(|(t, _)| *t < time);
        let shifted = self.shifted.drain(..visible).next_back();
        let current = self.current.take();

        match (current, shifted) {
            (Some((tc, vc)), Some((ts, vs))) => Some(if ts > tc { vs } else { vc }),
            (Some((_, v)), None) | (None, Some((_, v))) => Some(v),
            (None, None) => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.current.is_none() && self.shifted.is_empty()
    }
}

/// Pending inputs of one simulator.
#[derive(Debug, Default)]
pub struct InputBuffer {
    slots: BTreeMap<(String, String, String), Slot>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value for `eid.attr` coming from `src`.
    ///
    /// With `shifted` set the value is held back until a step later than
    /// `produced_at`.
    pub fn push(
        &mut self,
        eid: &str,
        attr: &str,
        src: &str,
        value: Value,
        produced_at: u64,
        shifted: bool,
    ) {
        let slot = self
            .slots
            .entry((eid.to_string(), attr.to_string(), src.to_string()))
            .or_default();
        if shifted {
            slot.push_shifted(produced_at, value);
        } else {
            slot.current = Some((produced_at, value));
        }
    }

    /// Drains everything deliverable to a step at `time`.
    pub fn take(&mut self, time: u64) -> Inputs {
        let mut inputs = Inputs::new();
        for ((eid, attr, src), slot) in self.slots.iter_mut() {
            if let Some(value) = slot.take(time) {
                inputs
                    .entry(eid.clone())
                    .or_default()
                    .entry(attr.clone())
                    .or_default()
                    .insert(src.clone(), value);
            }
        }
        self.slots.retain(|_, slot| !slot.is_empty());
        inputs
    }

    /// True if nothing is waiting, including held-back values.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_value_wins() {
        let mut buf = InputBuffer::new();
        buf.push("e", "in", "A-0.x", json!(1), 0, false);
        buf.push("e", "in", "A-0.x", json!(2), 1, false);
        buf.push("e", "in", "B-0.y", json!(9), 1, false);

        let inputs = buf.take(2);
        assert_eq!(inputs["e"]["in"]["A-0.x"], json!(2));
        assert_eq!(inputs["e"]["in"]["B-0.y"], json!(9));
        assert!(buf.is_empty());
        assert!(buf.take(3).is_empty());
    }

    #[test]
    fn test_shifted_value_invisible_at_production_time() {
        let mut buf = InputBuffer::new();
        buf.push("e", "in", "A-0.x", json!("t3"), 3, true);

        assert!(buf.take(3).is_empty());
        assert_eq!(buf.len(), 1);

        let inputs = buf.take(4);
        assert_eq!(inputs["e"]["in"]["A-0.x"], json!("t3"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_shifted_delivers_latest_visible_and_keeps_future() {
        let mut buf = InputBuffer::new();
        for t in [0u64, 1, 2, 3] {
            buf.push("e", "in", "A-0.x", json!(t), t, true);
        }

        let inputs = buf.take(3);
        assert_eq!(inputs["e"]["in"]["A-0.x"], json!(2));

        // The t=3 value is still pending for the next delivery
        let inputs = buf.take(6);
        assert_eq!(inputs["e"]["in"]["A-0.x"], json!(3));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_newer_of_plain_and_shifted() {
        let mut buf = InputBuffer::new();
        buf.push("e", "in", "A-0.x", json!("plain"), 1, false);
        buf.push("e", "in", "A-0.x", json!("shifted"), 2, true);
        assert_eq!(buf.take(5)["e"]["in"]["A-0.x"], json!("shifted"));

        buf.push("e", "in", "A-0.x", json!("shifted"), 1, true);
        buf.push("e", "in", "A-0.x", json!("plain"), 4, false);
        assert_eq!(buf.take(5)["e"]["in"]["A-0.x"], json!("plain"));
    }
}
