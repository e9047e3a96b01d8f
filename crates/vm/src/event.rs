//! Events and the pending-event queue.
//!
//! Event kinds and their bit positions are part of the on-the-wire
//! contract with the compiler: the state table's handled-events masks
//! and the CE/ER/IE registers all use these bits. Major version 1
//! images carry 32-bit masks, so kinds with bit positions past 31 are
//! only reachable from version 2 images.

use std::collections::VecDeque;

use crate::value::ScriptValue;

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

/// The fixed enumeration of script events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum EventKind {
    StateEntry = 0,
    StateExit = 1,
    TouchStart = 2,
    Touch = 3,
    TouchEnd = 4,
    CollisionStart = 5,
    Collision = 6,
    CollisionEnd = 7,
    LandCollisionStart = 8,
    LandCollision = 9,
    LandCollisionEnd = 10,
    Timer = 11,
    Listen = 12,
    Rez = 13,
    Sensor = 14,
    NoSensor = 15,
    Control = 16,
    Money = 17,
    Email = 18,
    AtTarget = 19,
    NotAtTarget = 20,
    AtRotTarget = 21,
    NotAtRotTarget = 22,
    RunTimePermissions = 23,
    Changed = 24,
    Attach = 25,
    Dataserver = 26,
    LinkMessage = 27,
    MovingStart = 28,
    MovingEnd = 29,
    ObjectRez = 30,
    RemoteData = 31,
    /// Version 2 only; the first kind past the 32-bit mask boundary.
    HttpResponse = 32,
}

impl EventKind {
    /// All kinds in bit order.
    pub const ALL: [EventKind; 33] = [
        Self::StateEntry,
        Self::StateExit,
        Self::TouchStart,
        Self::Touch,
        Self::TouchEnd,
        Self::CollisionStart,
        Self::Collision,
        Self::CollisionEnd,
        Self::LandCollisionStart,
        Self::LandCollision,
        Self::LandCollisionEnd,
        Self::Timer,
        Self::Listen,
        Self::Rez,
        Self::Sensor,
        Self::NoSensor,
        Self::Control,
        Self::Money,
        Self::Email,
        Self::AtTarget,
        Self::NotAtTarget,
        Self::AtRotTarget,
        Self::NotAtRotTarget,
        Self::RunTimePermissions,
        Self::Changed,
        Self::Attach,
        Self::Dataserver,
        Self::LinkMessage,
        Self::MovingStart,
        Self::MovingEnd,
        Self::ObjectRez,
        Self::RemoteData,
        Self::HttpResponse,
    ];

    /// The mask bit for this kind.
    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// The lowest-numbered kind present in a mask, if any.
    pub fn first_in_mask(mask: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| mask & kind.bit() != 0)
    }

    /// Lower-case name for logs and traces.
    pub fn name(self) -> &'static str {
        match self {
            Self::StateEntry => "state_entry",
            Self::StateExit => "state_exit",
            Self::TouchStart => "touch_start",
            Self::Touch => "touch",
            Self::TouchEnd => "touch_end",
            Self::CollisionStart => "collision_start",
            Self::Collision => "collision",
            Self::CollisionEnd => "collision_end",
            Self::LandCollisionStart => "land_collision_start",
            Self::LandCollision => "land_collision",
            Self::LandCollisionEnd => "land_collision_end",
            Self::Timer => "timer",
            Self::Listen => "listen",
            Self::Rez => "rez",
            Self::Sensor => "sensor",
            Self::NoSensor => "no_sensor",
            Self::Control => "control",
            Self::Money => "money",
            Self::Email => "email",
            Self::AtTarget => "at_target",
            Self::NotAtTarget => "not_at_target",
            Self::AtRotTarget => "at_rot_target",
            Self::NotAtRotTarget => "not_at_rot_target",
            Self::RunTimePermissions => "run_time_permissions",
            Self::Changed => "changed",
            Self::Attach => "attach",
            Self::Dataserver => "dataserver",
            Self::LinkMessage => "link_message",
            Self::MovingStart => "moving_start",
            Self::MovingEnd => "moving_end",
            Self::ObjectRez => "object_rez",
            Self::RemoteData => "remote_data",
            Self::HttpResponse => "http_response",
        }
    }
}

/// One pending event and its typed argument tuple.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Event {
    pub kind: EventKind,
    pub args: Vec<ScriptValue>,
}

impl Event {
    /// An event with no arguments.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
        }
    }

    /// An event with arguments.
    pub fn with_args(kind: EventKind, args: Vec<ScriptValue>) -> Self {
        Self { kind, args }
    }
}

/// FIFO of pending events with one out-of-order access path: the
/// scheduler searches for a `rez` event ahead of queue order.
#[derive(Debug, Default)]
pub struct EventQueue {
    entries: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push_back(&mut self, event: Event) {
        self.entries.push_back(event);
    }

    /// Removes and returns the oldest event.
    pub fn pop_front(&mut self) -> Option<Event> {
        self.entries.pop_front()
    }

    /// Removes and returns the oldest event matching a predicate,
    /// leaving the rest in order.
    pub fn remove_first_matching<F>(&mut self, predicate: F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let index = self.entries.iter().position(predicate)?;
        self.entries.remove(index)
    }

    /// Discards every pending event (state changes are flushes).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_match_positions() {
        assert_eq!(EventKind::StateEntry.bit(), 1);
        assert_eq!(EventKind::StateExit.bit(), 2);
        assert_eq!(EventKind::TouchStart.bit(), 4);
        assert_eq!(EventKind::HttpResponse.bit(), 1u64 << 32);
    }

    #[test]
    fn first_in_mask_prefers_low_bits() {
        let mask = EventKind::Timer.bit() | EventKind::TouchStart.bit();
        assert_eq!(EventKind::first_in_mask(mask), Some(EventKind::TouchStart));
        assert_eq!(EventKind::first_in_mask(0), None);
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let mut queue = EventQueue::new();
        queue.push_back(Event::new(EventKind::Timer));
        queue.push_back(Event::new(EventKind::TouchStart));
        assert_eq!(queue.pop_front().unwrap().kind, EventKind::Timer);
        assert_eq!(queue.pop_front().unwrap().kind, EventKind::TouchStart);
        assert!(queue.pop_front().is_none());
    }

    #[cfg(feature = "serde-types")]
    #[test]
    fn events_round_trip_through_json() {
        use crate::value::ScriptValue;

        let event = Event::with_args(
            EventKind::Listen,
            vec![ScriptValue::Integer(4), ScriptValue::String("hey".into())],
        );
        let json = serde_json::to_string(&event).expect("serializes");
        let back: Event = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, event);
    }

    #[test]
    fn mixed_position_dequeue() {
        let mut queue = EventQueue::new();
        queue.push_back(Event::new(EventKind::Timer));
        queue.push_back(Event::new(EventKind::Rez));
        queue.push_back(Event::new(EventKind::Listen));

        let rez = queue
            .remove_first_matching(|event| event.kind == EventKind::Rez)
            .unwrap();
        assert_eq!(rez.kind, EventKind::Rez);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().kind, EventKind::Timer);
        assert_eq!(queue.pop_front().unwrap().kind, EventKind::Listen);
    }
}
