// Property tests for the single-flight action queue
//
// Random interleavings of enqueues and transport outcomes must never put more
// than one action in flight, and actions must finish in enqueue order.

use gattlink_core::gatt::action::{ActionId, ActionKind, ActionQueue, Enqueued, Outcome};
use gattlink_core::GattStatus;
use proptest::prelude::*;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Step {
    Enqueue(u16),
    Succeed,
    Fail(i32),
    Reject,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => any::<u16>().prop_map(Step::Enqueue),
        2 => Just(Step::Succeed),
        2 => (1..200i32).prop_map(Step::Fail),
        1 => Just(Step::Reject),
    ]
}

/// Drives a queue the way the session manager does and records dispatches
struct Driver {
    queue: ActionQueue,
    now: Instant,
    outstanding: usize,
    max_outstanding: usize,
    enqueued: Vec<ActionId>,
    finished: Vec<ActionId>,
    dispatches: Vec<ActionId>,
}

impl Driver {
    fn new(max_retries: u8) -> Self {
        Self {
            queue: ActionQueue::new(max_retries, Duration::from_secs(60)),
            now: Instant::now(),
            outstanding: 0,
            max_outstanding: 0,
            enqueued: Vec::new(),
            finished: Vec::new(),
            dispatches: Vec::new(),
        }
    }

    fn dispatch(&mut self, id: ActionId) {
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
        self.dispatches.push(id);
    }

    fn apply(&mut self, step: &Step) {
        match step {
            Step::Enqueue(mtu) => {
                let result = self.queue.enqueue(ActionKind::ChangeMtu(*mtu), self.now);
                let id = ActionId(self.enqueued.len() as u64 + 1);
                self.enqueued.push(id);
                match result {
                    Enqueued::DispatchNow(action) => self.dispatch(action.id),
                    Enqueued::Waiting => {}
                    Enqueued::WatchdogReset { .. } => panic!("Clock never advances"),
                }
            }
            Step::Succeed | Step::Fail(_) | Step::Reject => {
                if self.outstanding == 0 {
                    return;
                }
                let head = self.queue.in_flight().map(|a| a.id);
                let outcome = match step {
                    Step::Succeed => Outcome::Success,
                    Step::Fail(code) => Outcome::Failure(GattStatus(*code)),
                    _ => Outcome::Rejected(GattStatus::FAILURE),
                };
                self.outstanding -= 1;
                let completion = self.queue.complete(outcome, self.now);
                if let Some(head) = head {
                    let retried = completion.next.as_ref().is_some_and(|n| n.id == head);
                    if !retried {
                        self.finished.push(head);
                    }
                }
                if let Some(next) = completion.next {
                    self.dispatch(next.id);
                }
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_at_most_one_action_in_flight(steps in prop::collection::vec(step(), 1..200)) {
        let mut driver = Driver::new(2);
        for step in &steps {
            driver.apply(step);
            prop_assert!(driver.outstanding <= 1);
            prop_assert_eq!(driver.outstanding, driver.queue.in_flight().map_or(0, |_| 1));
        }
        prop_assert!(driver.max_outstanding <= 1);
    }

    #[test]
    fn prop_actions_finish_in_enqueue_order(
        steps in prop::collection::vec(step(), 1..200),
        max_retries in 0u8..4,
    ) {
        let mut driver = Driver::new(max_retries);
        for step in &steps {
            driver.apply(step);
        }
        let finished = driver.finished.len();
        prop_assert_eq!(&driver.finished[..], &driver.enqueued[..finished]);
        prop_assert_eq!(driver.queue.len(), driver.enqueued.len() - finished);
    }

    #[test]
    fn prop_failing_action_dispatched_at_most_retries_plus_one(
        failures in 0usize..8,
        max_retries in 0u8..4,
    ) {
        let mut driver = Driver::new(max_retries);
        driver.apply(&Step::Enqueue(23));
        driver.apply(&Step::Enqueue(247));
        for _ in 0..failures {
            driver.apply(&Step::Fail(133));
        }

        let first = driver.dispatches.iter().filter(|id| **id == ActionId(1)).count();
        prop_assert_eq!(first, 1 + failures.min(max_retries as usize));
        if failures > max_retries as usize {
            prop_assert_eq!(driver.finished.first(), Some(&ActionId(1)));
            prop_assert!(driver.dispatches.contains(&ActionId(2)));
        }
    }
}

#[test]
fn test_retry_then_success_order() {
    // [A, B, C] with A failing twice then succeeding runs A, A, A, B, C
    let mut driver = Driver::new(2);
    for mtu in [23, 185, 247] {
        driver.apply(&Step::Enqueue(mtu));
    }
    driver.apply(&Step::Fail(133));
    driver.apply(&Step::Fail(133));
    for _ in 0..3 {
        driver.apply(&Step::Succeed);
    }

    let order: Vec<u64> = driver.dispatches.iter().map(|id| id.0).collect();
    assert_eq!(order, vec![1, 1, 1, 2, 3]);
    assert!(driver.queue.is_empty());
}
