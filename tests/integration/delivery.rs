#[path = "common/mod.rs"]
mod common;

use std::{
    collections::{HashMap, VecDeque},
    fs,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use notifyg::{
    config::Contact,
    constants::MAX_WATCH_WAIT,
    delivery::{DeliveryLoop, StepOutcome},
    error::{NotifygError, SendError},
    providers::{Provider, ProviderRegistry, Recipient},
    queue::{PersistentQueue, QueueEntry},
    retry::RetryPolicy,
    watcher::{SignalWatcher, WakeupPipe},
};
use tempfile::{tempdir, TempDir};

/// Replays a scripted list of outcomes and records every delivery.
struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<(), SendError>>>,
    deliveries: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedProvider {
    fn new(
        outcomes: Vec<Result<(), SendError>>,
        deliveries: Arc<Mutex<Vec<(String, String)>>>,
    ) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            deliveries,
        }
    }
}

impl Provider for ScriptedProvider {
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError> {
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .push((recipient.name().to_string(), message.to_string()));
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

struct Fixture {
    dir: TempDir,
    retry: Vec<String>,
    delivery: DeliveryLoop,
    deliveries: Arc<Mutex<Vec<(String, String)>>>,
}

fn fixture(retry: &[&str], scripts: Vec<(&str, Vec<Result<(), SendError>>)>) -> Fixture {
    let dir = tempdir().expect("failed to create tempdir");
    let raw: Vec<String> = retry.iter().map(|t| t.to_string()).collect();
    let queue = PersistentQueue::new(dir.path().to_path_buf(), common::policy(retry))
        .expect("queue should open");

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ProviderRegistry::empty();
    for (name, outcomes) in scripts {
        registry.insert(
            name,
            Box::new(ScriptedProvider::new(outcomes, Arc::clone(&deliveries))),
        );
    }

    let contacts: HashMap<String, Contact> =
        HashMap::from([("alice".to_string(), Contact::new())]);
    Fixture {
        dir,
        retry: raw,
        delivery: DeliveryLoop::new(queue, registry, contacts),
        deliveries,
    }
}

impl Fixture {
    /// A parallel queue handle over the same directory, playing the role
    /// of an enqueue client.
    fn queue(&self) -> PersistentQueue {
        let policy = RetryPolicy::parse(&self.retry).expect("policy");
        PersistentQueue::new(self.dir.path().to_path_buf(), policy)
            .expect("queue should open")
    }

    fn committed_count(&self) -> usize {
        self.queue()
            .iter_entries()
            .expect("listing should work")
            .len()
    }

    /// Rewrites the single pending entry's deadline to the epoch so the
    /// next step sees it as overdue, without sleeping through the wait.
    fn force_due(&self) {
        let queue = self.queue();
        let entries = queue.iter_entries().expect("listing should work");
        assert_eq!(entries.len(), 1, "expected exactly one pending entry");
        let entry = &entries[0];
        let due = QueueEntry::parse(&format!("0.{:x}.{}", entry.step(), entry.uid()))
            .expect("forced name should parse");
        fs::rename(
            self.dir.path().join(entry.file_name()),
            self.dir.path().join(due.file_name()),
        )
        .expect("rename should work");
    }
}

#[test]
fn happy_path_single_transport() {
    let mut fixture = fixture(&["mock1"], vec![("mock1", vec![Ok(())])]);
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");

    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert_eq!(
        fixture.deliveries.lock().expect("lock").as_slice(),
        &[("alice".to_string(), "hi".to_string())]
    );
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Empty
    );
}

#[test]
fn temporary_failure_honors_wait_then_succeeds() {
    let mut fixture = fixture(
        &["mock1", "60", "mock1"],
        vec![(
            "mock1",
            vec![Err(SendError::Temporary("scripted".into())), Ok(())],
        )],
    );
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");

    // First tick fails temporarily: the entry advances past the wait
    // token and is scheduled roughly a minute out.
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    let entries = fixture.queue().iter_entries().expect("listing");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step(), 2);
    let wait = entries[0].sleep_duration();
    assert!(wait > Duration::from_secs(50) && wait <= Duration::from_secs(61));

    // Not due yet; the loop would block for the remaining wait.
    match fixture.delivery.step().expect("step should work") {
        StepOutcome::NotDue(d) => assert!(d <= Duration::from_secs(61)),
        other => panic!("expected NotDue, got {other:?}"),
    }

    // After the wait elapses the second attempt delivers.
    fixture.force_due();
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert_eq!(fixture.deliveries.lock().expect("lock").len(), 2);
}

#[test]
fn permanent_failure_skips_the_wait() {
    let mut fixture = fixture(
        &["perm", "3600", "mock1"],
        vec![
            ("perm", vec![Err(SendError::Permanent("scripted".into()))]),
            ("mock1", vec![Ok(())]),
        ],
    );
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");

    // First tick fails permanently and must advance to mock1 without
    // waiting the hour.
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    let entries = fixture.queue().iter_entries().expect("listing");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step(), 2);
    assert!(entries[0].sleep_duration().is_zero());

    // Second tick delivers immediately.
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert_eq!(fixture.deliveries.lock().expect("lock").len(), 2);
}

#[test]
fn exhausted_policy_gives_up() {
    let mut fixture = fixture(
        &["temp", "temp"],
        vec![(
            "temp",
            vec![
                Err(SendError::Temporary("one".into())),
                Err(SendError::Temporary("two".into())),
            ],
        )],
    );
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");

    // Two failing attempts, then the implicit GIVEUP unlinks the entry.
    for _ in 0..3 {
        assert_eq!(
            fixture.delivery.step().expect("step should work"),
            StepOutcome::Processed
        );
    }
    assert_eq!(fixture.committed_count(), 0);
    assert_eq!(fixture.deliveries.lock().expect("lock").len(), 2);
}

#[test]
fn explicit_giveup_policy_drops_on_first_pickup() {
    let mut fixture = fixture(&["GIVEUP"], vec![]);
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert!(fixture.deliveries.lock().expect("lock").is_empty());
}

#[test]
fn wait_only_policy_never_runs_a_provider() {
    let mut fixture = fixture(&["60"], vec![]);
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");
    // The entry sits at the implicit terminator behind a minute of wait.
    fixture.force_due();
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert!(fixture.deliveries.lock().expect("lock").is_empty());
}

#[test]
fn unknown_contact_is_a_permanent_failure() {
    let mut fixture = fixture(
        &["mock1", "3600", "mock1"],
        vec![("mock1", vec![])],
    );
    fixture
        .queue()
        .enqueue("mallory", "hi")
        .expect("enqueue should work");

    // Both provider steps fail as configuration errors without invoking
    // the provider, fast-skipping the wait in between.
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(
        fixture.delivery.step().expect("step should work"),
        StepOutcome::Processed
    );
    assert_eq!(fixture.committed_count(), 0);
    assert!(fixture.deliveries.lock().expect("lock").is_empty());
}

#[test]
fn fatal_provider_error_propagates() {
    let mut fixture = fixture(
        &["broken"],
        vec![("broken", vec![Err(SendError::Fatal("scripted".into()))])],
    );
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");
    assert!(matches!(
        fixture.delivery.step(),
        Err(NotifygError::ProviderFatal { .. })
    ));
    // The entry is left in place for the next daemon run.
    assert_eq!(fixture.committed_count(), 1);
}

#[test]
fn run_loop_delivers_then_shuts_down_cleanly() {
    let mut fixture = fixture(&["mock1"], vec![("mock1", vec![Ok(())])]);
    fixture
        .queue()
        .enqueue("alice", "hi")
        .expect("enqueue should work");

    let wake = WakeupPipe::install().expect("wakeup pipe should install");
    let waker = wake.waker();
    let mut watcher = SignalWatcher::new(wake, MAX_WATCH_WAIT);
    let shutdown = fixture.delivery.shutdown_flag();

    let deliveries = Arc::clone(&fixture.deliveries);
    let mut delivery = fixture.delivery;
    let worker = thread::spawn(move || delivery.run(&mut watcher));

    // Give the loop a moment to drain the queue, then request shutdown.
    for _ in 0..100 {
        if !deliveries.lock().expect("lock").is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    waker.wake();

    worker
        .join()
        .expect("loop thread should join")
        .expect("loop should exit cleanly");
    assert_eq!(deliveries.lock().expect("lock").len(), 1);
    // The lock was released on the way out.
    assert!(!fixture.dir.path().join(".lock").exists());
}
