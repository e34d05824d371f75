//! Single-flight action queue for one peripheral session
//!
//! Actions run strictly one at a time in FIFO order. The head action is
//! "in flight" from dispatch until its outcome is reported; a failed head is
//! re-dispatched up to `max_retries` times before it is dropped. Retry state
//! lives on the head action itself, so it resets whenever the head changes.

use super::types::{CharacteristicRef, DeviceAddress, GattStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Default number of re-dispatches after a failed attempt
pub const DEFAULT_MAX_RETRIES: u8 = 2;

/// Default age after which an in-flight action is considered stuck
pub const DEFAULT_STUCK_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Stable identity of one enqueued action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u64);

/// Discriminant of an action, used for naming and deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionTag {
    Connect,
    DiscoverServices,
    CreateBond,
    ChangeMtu,
    WriteCharacteristic,
    ReadCharacteristic,
    SetNotification,
    ReadRemoteRssi,
}

impl ActionTag {
    /// Human-readable name used in logs and snapshots
    pub fn name(&self) -> &'static str {
        match self {
            ActionTag::Connect => "connect",
            ActionTag::DiscoverServices => "discover_services",
            ActionTag::CreateBond => "create_bond",
            ActionTag::ChangeMtu => "change_mtu",
            ActionTag::WriteCharacteristic => "write_characteristic",
            ActionTag::ReadCharacteristic => "read_characteristic",
            ActionTag::SetNotification => "set_characteristic_notification",
            ActionTag::ReadRemoteRssi => "read_remote_rssi",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The work an action performs against the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Connect(DeviceAddress),
    DiscoverServices,
    CreateBond(DeviceAddress),
    ChangeMtu(u16),
    /// The payload is owned by the action from enqueue time on
    WriteCharacteristic {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    ReadCharacteristic(CharacteristicRef),
    SetNotification {
        characteristic: CharacteristicRef,
        enabled: bool,
    },
    ReadRemoteRssi,
}

impl ActionKind {
    pub fn tag(&self) -> ActionTag {
        match self {
            ActionKind::Connect(_) => ActionTag::Connect,
            ActionKind::DiscoverServices => ActionTag::DiscoverServices,
            ActionKind::CreateBond(_) => ActionTag::CreateBond,
            ActionKind::ChangeMtu(_) => ActionTag::ChangeMtu,
            ActionKind::WriteCharacteristic { .. } => ActionTag::WriteCharacteristic,
            ActionKind::ReadCharacteristic(_) => ActionTag::ReadCharacteristic,
            ActionKind::SetNotification { .. } => ActionTag::SetNotification,
            ActionKind::ReadRemoteRssi => ActionTag::ReadRemoteRssi,
        }
    }
}

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    /// Failed attempts of this action so far
    pub failures: u8,
    pub last_status: Option<GattStatus>,
}

impl Action {
    pub fn tag(&self) -> ActionTag {
        self.kind.tag()
    }

    /// Name used for diagnostics, e.g. `read_characteristic#4`
    pub fn name(&self) -> String {
        format!("{}#{}", self.tag(), self.id.0)
    }
}

/// Result of the in-flight action as observed from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Retryable failure
    Failure(GattStatus),
    /// Terminal failure; the head is dropped without retrying
    Rejected(GattStatus),
}

/// What the caller must do after an enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was idle; execute this action now
    DispatchNow(Action),
    /// Another action is in flight; this one waits its turn
    Waiting,
    /// The in-flight action exceeded the stuck timeout; the whole queue,
    /// including the action just enqueued, was discarded
    WatchdogReset { stuck: Action },
}

/// What the caller must do after an outcome was recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Head action dropped after exhausting its retries
    pub dropped: Option<Action>,
    /// Next action to execute (a retry of the head or the new head)
    pub next: Option<Action>,
}

impl Completion {
    fn idle() -> Self {
        Self {
            dropped: None,
            next: None,
        }
    }
}

/// FIFO of pending actions plus in-flight bookkeeping
#[derive(Debug)]
pub struct ActionQueue {
    actions: VecDeque<Action>,
    current_started_at: Option<Instant>,
    next_id: u64,
    max_retries: u8,
    stuck_timeout: Duration,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_STUCK_ACTION_TIMEOUT)
    }
}

impl ActionQueue {
    pub fn new(max_retries: u8, stuck_timeout: Duration) -> Self {
        Self {
            actions: VecDeque::new(),
            current_started_at: None,
            next_id: 1,
            max_retries,
            stuck_timeout,
        }
    }

    /// Append an action and decide whether it runs now
    pub fn enqueue(&mut self, kind: ActionKind, now: Instant) -> Enqueued {
        let action = Action {
            id: ActionId(self.next_id),
            kind,
            failures: 0,
            last_status: None,
        };
        self.next_id += 1;
        self.actions.push_back(action);

        match self.current_started_at {
            None => {
                self.current_started_at = Some(now);
                match self.actions.front() {
                    Some(head) => Enqueued::DispatchNow(head.clone()),
                    None => Enqueued::Waiting,
                }
            }
            Some(started) if now.saturating_duration_since(started) >= self.stuck_timeout => {
                let stuck = self.actions.front().cloned();
                self.clear();
                match stuck {
                    Some(stuck) => Enqueued::WatchdogReset { stuck },
                    None => Enqueued::Waiting,
                }
            }
            Some(_) => Enqueued::Waiting,
        }
    }

    /// Record the outcome of the in-flight head and move the queue on
    pub fn complete(&mut self, outcome: Outcome, now: Instant) -> Completion {
        let max_retries = self.max_retries;
        let Some(head) = self.actions.front_mut() else {
            self.current_started_at = None;
            return Completion::idle();
        };

        if let Outcome::Failure(status) = outcome {
            head.failures = head.failures.saturating_add(1);
            head.last_status = Some(status);
            if head.failures <= max_retries {
                return Completion {
                    dropped: None,
                    next: Some(head.clone()),
                };
            }
        }

        if let Outcome::Rejected(status) = outcome {
            head.failures = head.failures.saturating_add(1);
            head.last_status = Some(status);
        }

        let finished = self.actions.pop_front();
        let dropped = match (outcome, finished) {
            (Outcome::Success, _) => None,
            (_, action) => action,
        };

        Completion {
            dropped,
            next: self.start_head(now),
        }
    }

    fn start_head(&mut self, now: Instant) -> Option<Action> {
        match self.actions.front() {
            Some(head) => {
                self.current_started_at = Some(now);
                Some(head.clone())
            }
            None => {
                self.current_started_at = None;
                None
            }
        }
    }

    /// Drop every pending action and return to idle
    pub fn clear(&mut self) {
        self.actions.clear();
        self.current_started_at = None;
    }

    /// Whether an action of this kind is already pending
    pub fn contains(&self, tag: ActionTag) -> bool {
        self.actions.iter().any(|a| a.tag() == tag)
    }

    /// The action currently in flight, if any
    pub fn in_flight(&self) -> Option<&Action> {
        self.current_started_at.and(self.actions.front())
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.current_started_at
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Diagnostic names of all pending actions, head first
    pub fn names(&self) -> Vec<String> {
        self.actions.iter().map(Action::name).collect()
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    pub fn stuck_timeout(&self) -> Duration {
        self.stuck_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(n: u128) -> ActionKind {
        ActionKind::ReadCharacteristic(CharacteristicRef::new(
            uuid::Uuid::from_u128(0x180F),
            uuid::Uuid::from_u128(n),
        ))
    }

    #[test]
    fn test_first_enqueue_dispatches_immediately() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();

        let result = queue.enqueue(ActionKind::DiscoverServices, now);
        match result {
            Enqueued::DispatchNow(action) => {
                assert_eq!(action.tag(), ActionTag::DiscoverServices);
                assert_eq!(action.id, ActionId(1));
            }
            other => panic!("Expected dispatch, got {:?}", other),
        }
        assert_eq!(queue.started_at(), Some(now));
        assert!(queue.in_flight().is_some());
    }

    #[test]
    fn test_second_enqueue_waits() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();

        queue.enqueue(read(1), now);
        assert_eq!(queue.enqueue(read(2), now), Enqueued::Waiting);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_success_pops_and_dispatches_next() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(read(1), now);
        queue.enqueue(read(2), now);

        let later = now + Duration::from_secs(1);
        let completion = queue.complete(Outcome::Success, later);
        assert!(completion.dropped.is_none());
        assert_eq!(completion.next.expect("Next action").id, ActionId(2));
        assert_eq!(queue.started_at(), Some(later));

        let completion = queue.complete(Outcome::Success, later);
        assert_eq!(completion, Completion::idle());
        assert!(queue.is_empty());
        assert!(queue.started_at().is_none());
    }

    #[test]
    fn test_failure_retries_twice_then_drops() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(read(1), now);
        queue.enqueue(read(2), now);

        for attempt in 1..=2u8 {
            let completion = queue.complete(Outcome::Failure(GattStatus(133)), now);
            let retry = completion.next.expect("Retry");
            assert_eq!(retry.id, ActionId(1));
            assert_eq!(retry.failures, attempt);
            assert!(completion.dropped.is_none());
        }

        let completion = queue.complete(Outcome::Failure(GattStatus(133)), now);
        let dropped = completion.dropped.expect("Dropped action");
        assert_eq!(dropped.id, ActionId(1));
        assert_eq!(dropped.last_status, Some(GattStatus(133)));
        assert_eq!(completion.next.expect("Next").id, ActionId(2));
    }

    #[test]
    fn test_retry_state_resets_with_new_head() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(read(1), now);
        queue.enqueue(read(2), now);

        queue.complete(Outcome::Failure(GattStatus::FAILURE), now);
        let completion = queue.complete(Outcome::Success, now);
        let next = completion.next.expect("Next");
        assert_eq!(next.id, ActionId(2));
        assert_eq!(next.failures, 0);

        // A single failure of the new head is retried, not dropped
        let completion = queue.complete(Outcome::Failure(GattStatus::FAILURE), now);
        assert_eq!(completion.next.expect("Retry").id, ActionId(2));
    }

    #[test]
    fn test_rejected_drops_without_retry() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(ActionKind::ChangeMtu(517), now);
        queue.enqueue(read(2), now);

        let completion = queue.complete(Outcome::Rejected(GattStatus::FAILURE), now);
        let dropped = completion.dropped.expect("Dropped action");
        assert_eq!(dropped.tag(), ActionTag::ChangeMtu);
        assert_eq!(dropped.last_status, Some(GattStatus::FAILURE));
        assert_eq!(completion.next.expect("Next").id, ActionId(2));
    }

    #[test]
    fn test_zero_retries_drops_on_first_failure() {
        let mut queue = ActionQueue::new(0, DEFAULT_STUCK_ACTION_TIMEOUT);
        let now = Instant::now();
        queue.enqueue(read(1), now);

        let completion = queue.complete(Outcome::Failure(GattStatus::FAILURE), now);
        assert!(completion.dropped.is_some());
        assert!(completion.next.is_none());
    }

    #[test]
    fn test_watchdog_resets_stuck_queue() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(read(1), now);
        queue.enqueue(read(2), now + Duration::from_secs(59));
        assert_eq!(queue.len(), 2);

        let result = queue.enqueue(read(3), now + Duration::from_secs(60));
        match result {
            Enqueued::WatchdogReset { stuck } => assert_eq!(stuck.id, ActionId(1)),
            other => panic!("Expected watchdog reset, got {:?}", other),
        }
        assert!(queue.is_empty());
        assert!(queue.started_at().is_none());
    }

    #[test]
    fn test_contains_by_tag() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(ActionKind::ReadRemoteRssi, now);

        assert!(queue.contains(ActionTag::ReadRemoteRssi));
        assert!(!queue.contains(ActionTag::ChangeMtu));
    }

    #[test]
    fn test_complete_on_empty_queue_is_idle() {
        let mut queue = ActionQueue::default();
        assert_eq!(
            queue.complete(Outcome::Success, Instant::now()),
            Completion::idle()
        );
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(read(1), now);
        queue.enqueue(read(2), now);

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.in_flight().is_none());
        assert!(matches!(
            queue.enqueue(read(3), now),
            Enqueued::DispatchNow(_)
        ));
    }

    #[test]
    fn test_names_head_first() {
        let mut queue = ActionQueue::default();
        let now = Instant::now();
        queue.enqueue(ActionKind::DiscoverServices, now);
        queue.enqueue(ActionKind::ChangeMtu(247), now);

        assert_eq!(
            queue.names(),
            vec!["discover_services#1".to_string(), "change_mtu#2".to_string()]
        );
    }
}
