//! Integration tests for event processor coordination
//!
//! Full processors run against the in-memory hub and ownership store with short
//! coordination intervals.

use async_trait::async_trait;
use pumphouse_core::Error as LinkError;
use pumphouse_metadata::{InMemoryOwnershipStore, OwnershipStore, PartitionOwnership};
use pumphouse_processor::{
    CheckpointManager, CloseReason, EventData, EventProcessor, EventProcessorBuilder,
    EventProcessorState, HandlerError, MemoryEventHub, PartitionContext, PartitionProcessor,
    ProcessorError, ReceivedEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STREAM: &str = "test-eh";
const GROUP: &str = "test-consumer1";

#[derive(Default)]
struct Journal {
    events: HashMap<String, Vec<i64>>,
    errors: HashMap<String, Vec<String>>,
    closes: Vec<(String, CloseReason)>,
    contexts: Vec<(String, String, String)>,
}

impl Journal {
    fn events_for(&self, partition_id: &str) -> Vec<i64> {
        self.events.get(partition_id).cloned().unwrap_or_default()
    }

    fn closed_with(&self, partition_id: &str, reason: CloseReason) -> bool {
        self.closes
            .iter()
            .any(|(p, r)| p == partition_id && *r == reason)
    }
}

#[derive(Clone, Default)]
struct Behavior {
    fail_partitions: Vec<String>,
    /// Checkpoint every event up to and including this sequence number
    checkpoint_through: Option<i64>,
    close_delay: Option<Duration>,
}

struct Recorder {
    context: PartitionContext,
    checkpoints: CheckpointManager,
    journal: Arc<Mutex<Journal>>,
    behavior: Behavior,
}

#[async_trait]
impl PartitionProcessor for Recorder {
    async fn initialize(&mut self) -> Result<(), HandlerError> {
        self.journal.lock().unwrap().contexts.push((
            self.context.partition_id().to_string(),
            self.context.stream_name().to_string(),
            self.context.consumer_group().to_string(),
        ));
        Ok(())
    }

    async fn process_event(&mut self, event: ReceivedEvent) -> Result<(), HandlerError> {
        let partition_id = self.context.partition_id().to_string();
        if self.behavior.fail_partitions.contains(&partition_id) {
            return Err(format!("cannot handle event {}", event.sequence_number).into());
        }

        self.journal
            .lock()
            .unwrap()
            .events
            .entry(partition_id)
            .or_default()
            .push(event.sequence_number);

        if self
            .behavior
            .checkpoint_through
            .is_some_and(|through| event.sequence_number <= through)
        {
            self.checkpoints.update_checkpoint(&event).await?;
        }
        Ok(())
    }

    async fn process_error(&mut self, error: &ProcessorError) {
        self.journal
            .lock()
            .unwrap()
            .errors
            .entry(self.context.partition_id().to_string())
            .or_default()
            .push(error.to_string());
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), HandlerError> {
        if let Some(delay) = self.behavior.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.journal
            .lock()
            .unwrap()
            .closes
            .push((self.context.partition_id().to_string(), reason));
        Ok(())
    }
}

fn processor(
    identifier: &str,
    hub: &MemoryEventHub,
    store: &Arc<InMemoryOwnershipStore>,
    journal: &Arc<Mutex<Journal>>,
    behavior: Behavior,
) -> EventProcessorBuilder {
    let journal = Arc::clone(journal);
    EventProcessor::builder()
        .identifier(identifier)
        .consumer_group(GROUP)
        .load_balancing_interval(Duration::from_millis(100))
        .ownership_expiration(Duration::from_secs(1))
        .shutdown_grace_period(Duration::from_secs(2))
        .event_link(Arc::new(hub.clone()))
        .ownership_store(store.clone())
        .processor_factory(move |context, checkpoints| {
            Box::new(Recorder {
                context,
                checkpoints,
                journal: Arc::clone(&journal),
                behavior: behavior.clone(),
            })
        })
}

/// Log to the test output; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn publish(hub: &MemoryEventHub, partition_id: &str, count: usize) {
    hub.publish(
        partition_id,
        (0..count).map(|i| EventData::new(format!("{partition_id}-{i}"))),
    )
    .await
    .unwrap();
}

/// Poll an (async) condition until it holds, failing the test after 10 seconds.
macro_rules! eventually {
    ($what:expr, $condition:expr) => {{
        let mut reached = false;
        for _ in 0..500 {
            if $condition {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reached, "timed out waiting for: {}", $what);
    }};
}

async fn record(store: &InMemoryOwnershipStore, partition_id: &str) -> Option<PartitionOwnership> {
    store
        .list_ownership(STREAM, GROUP)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.partition_id == partition_id)
}

#[tokio::test]
async fn test_checkpoints_land_on_ownership_record() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["1"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    hub.append_received("1", ReceivedEvent::new("1", 1, 1_000, "first"))
        .await
        .unwrap();
    hub.append_received("1", ReceivedEvent::new("100", 2, 2_000, "second"))
        .await
        .unwrap();

    let behavior = Behavior {
        checkpoint_through: Some(i64::MAX),
        ..Default::default()
    };
    let processor = processor("p1", &hub, &store, &journal, behavior)
        .build()
        .unwrap();
    processor.start().await.unwrap();

    eventually!("two events processed", {
        journal.lock().unwrap().events_for("1").len() == 2
    });
    eventually!("checkpoint at sequence 2", {
        record(&store, "1")
            .await
            .is_some_and(|r| r.sequence_number == Some(2))
    });

    let ownership = record(&store, "1").await.unwrap();
    assert_eq!(ownership.stream_name, STREAM);
    assert_eq!(ownership.consumer_group, GROUP);
    assert_eq!(ownership.owner_id, "p1");
    assert_eq!(ownership.offset.as_deref(), Some("100"));
    assert!(ownership.etag.is_some());

    assert_eq!(
        journal.lock().unwrap().contexts,
        vec![("1".to_string(), STREAM.to_string(), GROUP.to_string())]
    );

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_partition_does_not_affect_siblings() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["1", "2", "3"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    for partition_id in ["1", "2", "3"] {
        publish(&hub, partition_id, 5).await;
    }

    let behavior = Behavior {
        fail_partitions: vec!["1".to_string()],
        ..Default::default()
    };
    let processor = processor("p1", &hub, &store, &journal, behavior)
        .build()
        .unwrap();
    processor.start().await.unwrap();

    eventually!("partitions 2 and 3 fully delivered", {
        let journal = journal.lock().unwrap();
        journal.events_for("2").len() == 5 && journal.events_for("3").len() == 5
    });
    eventually!("partition 1 closed by its handler error", {
        journal
            .lock()
            .unwrap()
            .closed_with("1", CloseReason::ProcessHandlerError)
    });

    {
        let journal = journal.lock().unwrap();
        assert_eq!(journal.events_for("2"), vec![0, 1, 2, 3, 4]);
        assert_eq!(journal.events_for("3"), vec![0, 1, 2, 3, 4]);
        assert!(journal.events_for("1").is_empty());
        assert!(!journal.errors.get("1").unwrap().is_empty());
        assert!(!journal.errors.contains_key("2"));
        assert!(!journal.errors.contains_key("3"));
    }

    // Processor-level state is untouched
    assert!(processor.is_running().await);
    assert!(processor
        .metrics()
        .process_errors
        .with_label_values(&["1", "process_event"])
        .get()
        >= 1);

    // Siblings keep receiving new events
    publish(&hub, "2", 2).await;
    eventually!("new events on partition 2", {
        journal.lock().unwrap().events_for("2").len() == 7
    });

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_after_last_checkpoint() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    publish(&hub, "0", 5).await;

    // First instance processes everything but only checkpoints through sequence 2
    let first_journal = Arc::new(Mutex::new(Journal::default()));
    let behavior = Behavior {
        checkpoint_through: Some(2),
        ..Default::default()
    };
    let first = processor("p1", &hub, &store, &first_journal, behavior)
        .build()
        .unwrap();
    first.start().await.unwrap();

    eventually!("first instance saw all events", {
        first_journal.lock().unwrap().events_for("0").len() == 5
    });
    eventually!("checkpoint at sequence 2", {
        record(&store, "0")
            .await
            .is_some_and(|r| r.sequence_number == Some(2))
    });
    first.stop().await.unwrap();

    let released = record(&store, "0").await.unwrap();
    assert!(released.owner_id.is_empty());
    assert_eq!(released.sequence_number, Some(2));

    let second_journal = Arc::new(Mutex::new(Journal::default()));
    let second = processor("p2", &hub, &store, &second_journal, Behavior::default())
        .build()
        .unwrap();
    second.start().await.unwrap();

    eventually!("second instance redelivered unacknowledged events", {
        second_journal.lock().unwrap().events_for("0").len() == 2
    });
    assert_eq!(second_journal.lock().unwrap().events_for("0"), vec![3, 4]);
    assert_eq!(record(&store, "0").await.unwrap().owner_id, "p2");

    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0", "1"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let processor = processor("p1", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    processor.start().await.unwrap();
    assert_eq!(processor.owned_partitions().await, vec!["0", "1"]);

    processor.stop().await.unwrap();
    let writes_after_first_stop = store.claim_write_count();

    processor.stop().await.unwrap();
    assert_eq!(processor.state().await, EventProcessorState::Stopped);
    assert_eq!(store.claim_write_count(), writes_after_first_stop);

    let journal = journal.lock().unwrap();
    assert_eq!(journal.closes.len(), 2);
    assert!(journal.closed_with("0", CloseReason::Shutdown));
    assert!(journal.closed_with("1", CloseReason::Shutdown));
    drop(journal);

    assert_eq!(hub.open_receivers(), 0);
    for r in store.list_ownership(STREAM, GROUP).await.unwrap() {
        assert!(r.owner_id.is_empty(), "partition {} still owned", r.partition_id);
    }
}

#[tokio::test]
async fn test_start_while_stopping_is_rejected() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let behavior = Behavior {
        close_delay: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let processor = Arc::new(
        processor("p1", &hub, &store, &journal, behavior)
            .build()
            .unwrap(),
    );
    processor.start().await.unwrap();

    let stopping = Arc::clone(&processor);
    let stop_task = tokio::spawn(async move { stopping.stop().await });

    eventually!("processor stopping", {
        processor.state().await == EventProcessorState::Stopping
    });

    let result = processor.start().await;
    assert!(matches!(result, Err(ProcessorError::IllegalState(_))));

    stop_task.await.unwrap().unwrap();
    assert_eq!(processor.state().await, EventProcessorState::Stopped);

    // A stopped processor can start again
    processor.start().await.unwrap();
    assert_eq!(processor.owned_partitions().await, vec!["0"]);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_processors_split_partitions() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0", "1", "2", "3"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let first = processor("p1", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    first.start().await.unwrap();
    assert_eq!(first.owned_partitions().await.len(), 4);

    let second = processor("p2", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    second.start().await.unwrap();

    eventually!("two partitions each", {
        first.owned_partitions().await.len() == 2 && second.owned_partitions().await.len() == 2
    });

    let mut owned = first.owned_partitions().await;
    owned.extend(second.owned_partitions().await);
    owned.sort();
    assert_eq!(owned, vec!["0", "1", "2", "3"]);

    let records = store.list_ownership(STREAM, GROUP).await.unwrap();
    assert_eq!(records.len(), 4);
    for r in &records {
        let expected = if first.owned_partitions().await.contains(&r.partition_id) {
            "p1"
        } else {
            "p2"
        };
        assert_eq!(r.owner_id, expected, "partition {}", r.partition_id);
    }

    // Events published after balancing reach exactly one processor each
    for partition_id in ["0", "1", "2", "3"] {
        publish(&hub, partition_id, 3).await;
    }
    eventually!("every partition delivered", {
        let journal = journal.lock().unwrap();
        ["0", "1", "2", "3"]
            .iter()
            .all(|p| journal.events_for(p).len() >= 3)
    });

    // Once one instance leaves, the other picks its partitions up
    second.stop().await.unwrap();
    eventually!("first instance owns everything again", {
        first.owned_partitions().await.len() == 4
    });

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_simultaneous_start_has_single_owner() {
    init_tracing();
    for _ in 0..10 {
        let hub = MemoryEventHub::new(STREAM, ["0"]);
        let store = Arc::new(InMemoryOwnershipStore::new());
        let journal = Arc::new(Mutex::new(Journal::default()));

        let first = processor("p1", &hub, &store, &journal, Behavior::default())
            .load_balancing_interval(Duration::from_secs(1))
            .ownership_expiration(Duration::from_secs(5))
            .build()
            .unwrap();
        let second = processor("p2", &hub, &store, &journal, Behavior::default())
            .load_balancing_interval(Duration::from_secs(1))
            .ownership_expiration(Duration::from_secs(5))
            .build()
            .unwrap();

        let (a, b) = tokio::join!(first.start(), second.start());
        a.unwrap();
        b.unwrap();

        let first_owned = first.owned_partitions().await;
        let second_owned = second.owned_partitions().await;
        assert_eq!(first_owned.len() + second_owned.len(), 1);

        let winner = if first_owned.is_empty() { "p2" } else { "p1" };
        assert_eq!(record(&store, "0").await.unwrap().owner_id, winner);

        eventually!("winner opened its receiver", { hub.receivers_opened() == 1 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.receivers_opened(), 1);

        first.stop().await.unwrap();
        second.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_store_outage_keeps_pumps_running() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0", "1"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let processor = processor("p1", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    processor.start().await.unwrap();

    store.set_unavailable(true);
    eventually!("a cycle skipped", {
        processor.stats().await.cycles_skipped >= 1
    });

    publish(&hub, "0", 3).await;
    eventually!("events delivered during the outage", {
        journal.lock().unwrap().events_for("0").len() == 3
    });
    assert_eq!(processor.owned_partitions().await, vec!["0", "1"]);
    assert!(journal.lock().unwrap().closes.is_empty());

    store.set_unavailable(false);
    let ok_before = processor
        .metrics()
        .coordination_cycles
        .with_label_values(&["ok"])
        .get();
    eventually!("cycles succeed again", {
        processor
            .metrics()
            .coordination_cycles
            .with_label_values(&["ok"])
            .get()
            > ok_before
    });
    assert_eq!(processor.owned_partitions().await, vec!["0", "1"]);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_end_of_life_partition_is_not_reclaimed() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0", "1"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let processor = processor("p1", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    processor.start().await.unwrap();

    hub.inject_error("1", LinkError::PartitionNotFound("1".to_string()))
        .await;

    eventually!("partition 1 at end of life", {
        processor.end_of_life_partitions().await == vec!["1".to_string()]
    });

    // Several more cycles; partition 1 stays unowned here
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(processor.owned_partitions().await, vec!["0"]);
    assert_eq!(hub.receivers_opened(), 2);

    {
        let journal = journal.lock().unwrap();
        assert!(journal.closed_with("1", CloseReason::Eol));
        assert_eq!(journal.errors.get("1").map(Vec::len), Some(1));
    }

    eventually!("partition 1 relinquished", {
        record(&store, "1")
            .await
            .is_some_and(|r| r.owner_id.is_empty())
    });

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_link_error_reopens_partition() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let processor = processor("p1", &hub, &store, &journal, Behavior::default())
        .build()
        .unwrap();
    processor.start().await.unwrap();

    hub.inject_error("0", LinkError::Transport("connection reset".to_string()))
        .await;

    eventually!("pump closed as ownership lost", {
        journal
            .lock()
            .unwrap()
            .closed_with("0", CloseReason::OwnershipLost)
    });
    eventually!("receiver reopened", { hub.receivers_opened() == 2 });

    publish(&hub, "0", 2).await;
    eventually!("events delivered after reopen", {
        journal.lock().unwrap().events_for("0").len() == 2
    });
    assert!(processor.end_of_life_partitions().await.is_empty());

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_fails_start() {
    init_tracing();
    let hub = MemoryEventHub::new(STREAM, ["0"]);
    let store = Arc::new(InMemoryOwnershipStore::new());
    let journal = Arc::new(Mutex::new(Journal::default()));

    let processor = processor("p1", &hub, &store, &journal, Behavior::default())
        .consumer_group("")
        .build()
        .unwrap();

    let result = processor.start().await;
    assert!(matches!(result, Err(ProcessorError::Config(_))));
    assert_eq!(processor.state().await, EventProcessorState::Stopped);
    assert_eq!(hub.receivers_opened(), 0);
}
