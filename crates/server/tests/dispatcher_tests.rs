//! End-to-end dispatcher tests with a recording broker double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use retz_adapters::Store;
use retz_core::{Application, Job, JobState, JobTransition, Offer, ResourceQuantity, User};
use retz_planner::{FifoPlanner, Planner, PriorityPlanner};
use retz_server::{
    BrokerError, DispatchError, Dispatcher, OfferSnapshot, ResourceBroker, RetentionGc,
    StatusReporter, TaskLaunch, TaskStatus,
};

/// Records every broker interaction; can be armed to reject launches.
#[derive(Default)]
struct MockBroker {
    launches: Mutex<Vec<(TaskLaunch, Offer)>>,
    declines: Mutex<Vec<String>>,
    kills: Mutex<Vec<String>>,
    reconciles: Mutex<Vec<Vec<String>>>,
    reject_launches: AtomicBool,
}

impl MockBroker {
    fn launched_job_ids(&self) -> Vec<i64> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(launch, _)| launch.job_id)
            .collect()
    }
}

#[async_trait]
impl ResourceBroker for MockBroker {
    async fn launch(&self, launch: &TaskLaunch, offer: &Offer) -> Result<(), BrokerError> {
        if self.reject_launches.load(Ordering::SeqCst) {
            return Err(BrokerError::LaunchRejected {
                task_id: launch.task_id.clone(),
                reason: "armed to fail".to_string(),
            });
        }
        self.launches
            .lock()
            .unwrap()
            .push((launch.clone(), offer.clone()));
        Ok(())
    }

    async fn decline(&self, offer_id: &str) -> Result<(), BrokerError> {
        self.declines.lock().unwrap().push(offer_id.to_string());
        Ok(())
    }

    async fn kill(&self, task_id: &str) -> Result<(), BrokerError> {
        self.kills.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn reconcile(&self, task_ids: &[String]) -> Result<(), BrokerError> {
        self.reconciles.lock().unwrap().push(task_ids.to_vec());
        Ok(())
    }
}

struct Harness {
    store: Store,
    broker: Arc<MockBroker>,
    dispatcher: Dispatcher,
    offers: OfferSnapshot,
}

async fn harness(planner: Arc<dyn Planner>) -> Harness {
    let store = Store::open_memory().await.expect("in-memory store");
    store
        .add_user(&User::new("u1", "secret", true, ""))
        .await
        .unwrap();
    assert!(store
        .add_application(&Application::new("app1", "u1"))
        .await
        .unwrap());

    let broker = Arc::new(MockBroker::default());
    let offers = OfferSnapshot::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        planner,
        broker.clone(),
        offers.clone(),
    );
    Harness {
        store,
        broker,
        dispatcher,
        offers,
    }
}

async fn enqueue(store: &Store, id: i64, priority: i32, cpu: i32, mem_mb: i32) {
    let job = Job::new(
        id,
        "app1",
        format!("job-{id}"),
        "echo hello",
        priority,
        ResourceQuantity::new(cpu, mem_mb),
        Utc::now(),
    );
    store.safe_add_job(&job).await.unwrap();
}

fn offer(id: &str, agent: &str, cpu: i32, mem_mb: i32) -> Offer {
    Offer::new(id, agent, ResourceQuantity::new(cpu, mem_mb))
}

#[tokio::test]
async fn happy_path_from_offer_to_finished() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 2, 512).await;

    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 4, 1024)])
        .await
        .unwrap();

    let starting = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(starting.state, JobState::Starting);
    let task_id = starting.task_id.clone().expect("task id assigned");
    assert_eq!(h.broker.launched_job_ids(), vec![1]);
    let (launch, used_offer) = h.broker.launches.lock().unwrap()[0].clone();
    assert_eq!(launch.task_id, task_id);
    assert_eq!(launch.cmd, "echo hello");
    assert_eq!(used_offer.id, "o1");

    // the broker confirms STARTING; that is a no-op for us
    h.dispatcher
        .on_status_update(&task_id, TaskStatus::Starting)
        .await
        .unwrap();
    assert_eq!(
        h.store.get_job(1).await.unwrap().unwrap().state,
        JobState::Starting
    );

    h.dispatcher
        .on_status_update(
            &task_id,
            TaskStatus::Started {
                url: Some("http://sandbox/1".to_string()),
            },
        )
        .await
        .unwrap();
    let started = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(started.state, JobState::Started);
    assert_eq!(started.url.as_deref(), Some("http://sandbox/1"));

    h.dispatcher
        .on_status_update(&task_id, TaskStatus::Finished { exit_code: 0 })
        .await
        .unwrap();
    let finished = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Finished);
    assert_eq!(finished.exit_code, Some(0));
    assert!(finished.finished.is_some());
}

#[tokio::test]
async fn priority_planner_launches_most_urgent_first() {
    let h = harness(Arc::new(PriorityPlanner)).await;
    for (id, priority) in [(1, 10), (2, 1), (3, 5)] {
        enqueue(&h.store, id, priority, 1, 128).await;
    }

    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 8, 4096)])
        .await
        .unwrap();
    assert_eq!(h.broker.launched_job_ids(), vec![2, 3, 1]);
}

#[tokio::test]
async fn fifo_planner_launches_in_submission_order() {
    let h = harness(Arc::new(FifoPlanner)).await;
    for (id, priority) in [(1, 10), (2, 1), (3, 5)] {
        enqueue(&h.store, id, priority, 1, 128).await;
    }

    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 8, 4096)])
        .await
        .unwrap();
    assert_eq!(h.broker.launched_job_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn rejected_launches_return_the_job_to_the_queue() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;
    h.broker.reject_launches.store(true, Ordering::SeqCst);

    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 4, 1024)])
        .await
        .unwrap();

    let job = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert!(job.task_id.is_none());
    assert_eq!(h.store.count_queued().await.unwrap(), 1);
}

#[tokio::test]
async fn unused_offers_are_declined() {
    let h = harness(Arc::new(FifoPlanner)).await;

    h.dispatcher
        .on_offers(vec![
            offer("o1", "agent-1", 2, 1024),
            offer("o2", "agent-2", 2, 1024),
        ])
        .await
        .unwrap();

    let mut declined = h.broker.declines.lock().unwrap().clone();
    declined.sort();
    assert_eq!(declined, vec!["o1".to_string(), "o2".to_string()]);
}

#[tokio::test]
async fn stale_status_updates_are_dropped() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;
    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 4, 1024)])
        .await
        .unwrap();
    let task_id = h
        .store
        .get_job(1)
        .await
        .unwrap()
        .unwrap()
        .task_id
        .unwrap();

    h.dispatcher
        .on_status_update(&task_id, TaskStatus::Finished { exit_code: 0 })
        .await
        .unwrap();

    // a late STARTED for an already finished job changes nothing
    h.dispatcher
        .on_status_update(&task_id, TaskStatus::Started { url: None })
        .await
        .unwrap();
    let job = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.exit_code, Some(0));
}

#[tokio::test]
async fn unknown_task_updates_are_dropped() {
    let h = harness(Arc::new(FifoPlanner)).await;
    h.dispatcher
        .on_status_update("retz-999-none", TaskStatus::Started { url: None })
        .await
        .unwrap();
    assert_eq!(h.store.count_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_and_lost_tasks_are_killed_with_a_reason() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;
    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 4, 1024)])
        .await
        .unwrap();
    let task_id = h
        .store
        .get_job(1)
        .await
        .unwrap()
        .unwrap()
        .task_id
        .unwrap();

    h.dispatcher
        .on_status_update(&task_id, TaskStatus::Failed { reason: None })
        .await
        .unwrap();
    let job = h.store.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Killed);
    assert_eq!(job.reason.as_deref(), Some("task failed"));
}

#[tokio::test]
async fn reregistration_guards_the_framework_id() {
    let h = harness(Arc::new(FifoPlanner)).await;

    h.dispatcher.on_reregistered("fw-1").await.unwrap();
    assert_eq!(
        h.store.get_framework_id().await.unwrap().as_deref(),
        Some("fw-1")
    );

    // same id again is fine
    h.dispatcher.on_reregistered("fw-1").await.unwrap();

    // a different id would adopt someone else's tasks
    let err = h.dispatcher.on_reregistered("fw-2").await.unwrap_err();
    assert!(matches!(err, DispatchError::FrameworkIdMismatch { .. }));
    assert_eq!(
        h.store.get_framework_id().await.unwrap().as_deref(),
        Some("fw-1")
    );
}

#[tokio::test]
async fn killing_a_queued_job_is_immediate() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;

    let killed = h
        .dispatcher
        .kill_job(1, Some("operator request".to_string()))
        .await
        .unwrap();
    assert_eq!(killed.state, JobState::Killed);
    assert!(h.broker.kills.lock().unwrap().is_empty());
}

#[tokio::test]
async fn killing_a_launched_job_goes_through_the_broker() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;
    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 4, 1024)])
        .await
        .unwrap();
    let task_id = h
        .store
        .get_job(1)
        .await
        .unwrap()
        .unwrap()
        .task_id
        .unwrap();

    h.dispatcher.kill_job(1, None).await.unwrap();
    assert_eq!(h.broker.kills.lock().unwrap().clone(), vec![task_id.clone()]);

    // still STARTING until the broker confirms the kill
    assert_eq!(
        h.store.get_job(1).await.unwrap().unwrap().state,
        JobState::Starting
    );
    h.dispatcher
        .on_status_update(
            &task_id,
            TaskStatus::Killed {
                reason: Some("killed by scheduler".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        h.store.get_job(1).await.unwrap().unwrap().state,
        JobState::Killed
    );
}

#[tokio::test]
async fn reconcile_sends_every_running_task_id() {
    let h = harness(Arc::new(FifoPlanner)).await;
    enqueue(&h.store, 1, 0, 1, 128).await;
    enqueue(&h.store, 2, 0, 1, 128).await;
    h.dispatcher
        .on_offers(vec![offer("o1", "agent-1", 8, 4096)])
        .await
        .unwrap();

    h.dispatcher.reconcile().await.unwrap();
    let batches = h.broker.reconciles.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);

    // nothing running, nothing to reconcile
    let idle = harness(Arc::new(FifoPlanner)).await;
    idle.dispatcher.reconcile().await.unwrap();
    assert!(idle.broker.reconciles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn status_reflects_queue_running_and_offers() {
    let h = harness(Arc::new(FifoPlanner)).await;
    let reporter = StatusReporter::new(h.store.clone(), h.offers.clone());

    enqueue(&h.store, 1, 0, 2, 512).await;
    enqueue(&h.store, 2, 0, 1, 128).await;

    let before = reporter.report().await.unwrap();
    assert_eq!(before.queue_length, 2);
    assert_eq!(before.running_length, 0);
    assert_eq!(before.offers, 0);
    assert!(!before.version.is_empty());

    // one offer hosts both jobs and is consumed; the spare stays cached
    h.dispatcher
        .on_offers(vec![
            offer("o1", "agent-1", 8, 4096),
            offer("o2", "agent-2", 2, 256),
        ])
        .await
        .unwrap();

    let after = reporter.report().await.unwrap();
    assert_eq!(after.queue_length, 0);
    assert_eq!(after.running_length, 2);
    assert_eq!(after.total_used, ResourceQuantity::new(3, 640));
    assert_eq!(after.offers, 1);
    assert_eq!(after.num_slaves, 1);
    assert_eq!(after.total_offered, ResourceQuantity::new(2, 256));
}

#[tokio::test]
async fn retention_gc_purges_only_old_terminal_jobs() {
    let h = harness(Arc::new(FifoPlanner)).await;

    enqueue(&h.store, 1, 0, 1, 128).await;
    let mut old = h
        .store
        .update_job(1, &JobTransition::Killed { reason: None })
        .await
        .unwrap();
    old.finished = Some(Utc::now() - ChronoDuration::seconds(3600));
    h.store.update_jobs(&[old]).await.unwrap();

    enqueue(&h.store, 2, 0, 1, 128).await;
    h.store
        .update_job(2, &JobTransition::Killed { reason: None })
        .await
        .unwrap();

    enqueue(&h.store, 3, 0, 1, 128).await;

    let gc = RetentionGc::new(
        h.store.clone(),
        Duration::from_secs(1800),
        Duration::from_secs(600),
    );
    assert_eq!(gc.run_once().await.unwrap(), 1);
    assert!(h.store.get_job(1).await.unwrap().is_none());
    assert!(h.store.get_job(2).await.unwrap().is_some());
    assert!(h.store.get_job(3).await.unwrap().is_some());

    // a second pass finds nothing
    assert_eq!(gc.run_once().await.unwrap(), 0);
}
