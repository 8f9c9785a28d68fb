//! Work queue dispatch.
//!
//! Every reconciled kind has its own [`WorkQueue`] drained by
//! `concurrent_syncs` workers. Instances and bindings also get a polling
//! queue: keys whose broker operation is still running wait there and are
//! handed back to the main queue when their poll delay expires.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Kind, Outcome, Reconciler};
use crate::workqueue::WorkQueue;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The queues shared by watchers, workers and the reconciler
#[derive(Debug)]
pub struct Queues {
    /// Broker keys
    pub broker: Arc<WorkQueue>,
    /// Class keys
    pub class: Arc<WorkQueue>,
    /// Plan keys
    pub plan: Arc<WorkQueue>,
    /// Instance keys
    pub instance: Arc<WorkQueue>,
    /// Binding keys; the reconciler also pushes bindings blocked on an instance here
    pub binding: Arc<WorkQueue>,
    /// Instances waiting for their next last-operation poll
    pub instance_polling: Arc<WorkQueue>,
    /// Bindings waiting for their next last-operation poll
    pub binding_polling: Arc<WorkQueue>,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    /// Fresh, empty queues for every kind
    pub fn new() -> Self {
        Self {
            broker: WorkQueue::new("service-broker"),
            class: WorkQueue::new("service-class"),
            plan: WorkQueue::new("service-plan"),
            instance: WorkQueue::new("service-instance"),
            binding: WorkQueue::new("service-binding"),
            instance_polling: WorkQueue::new("instance-poller"),
            binding_polling: WorkQueue::new("binding-poller"),
        }
    }

    /// Main queue of `kind`
    pub fn for_kind(&self, kind: Kind) -> &Arc<WorkQueue> {
        match kind {
            Kind::Broker => &self.broker,
            Kind::Class => &self.class,
            Kind::Plan => &self.plan,
            Kind::Instance => &self.instance,
            Kind::Binding => &self.binding,
        }
    }

    /// Queue that holds keys of `kind` between last-operation polls
    pub fn polling_for(&self, kind: Kind) -> Option<&Arc<WorkQueue>> {
        match kind {
            Kind::Instance => Some(&self.instance_polling),
            Kind::Binding => Some(&self.binding_polling),
            _ => None,
        }
    }

    /// Stop every queue; idle workers return once their queue is drained
    pub fn shut_down(&self) {
        for kind in Kind::ALL {
            self.for_kind(kind).shut_down();
        }
        self.instance_polling.shut_down();
        self.binding_polling.shut_down();
    }
}

/// Drives reconciliation passes off the queues
pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    queues: Arc<Queues>,
    metrics: Arc<Metrics>,
    workers: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queues", &self.queues)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher running `workers` workers per kind; at least one.
    pub fn new(reconciler: Arc<Reconciler>, queues: Arc<Queues>, metrics: Arc<Metrics>, workers: usize) -> Self {
        Self {
            reconciler,
            queues,
            metrics,
            workers: workers.max(1),
        }
    }

    /// Queues the workers drain
    pub fn queues(&self) -> &Arc<Queues> {
        &self.queues
    }

    /// Spawn the worker pools and polling forwarders into `tasks`
    pub fn spawn(self: &Arc<Self>, tasks: &mut JoinSet<()>) {
        for kind in Kind::ALL {
            info!(kind = %kind, workers = self.workers, "starting workers");
            for _ in 0..self.workers {
                tasks.spawn(Arc::clone(self).run_worker(kind));
            }
            if let Some(polling) = self.queues.polling_for(kind) {
                tasks.spawn(forward_polled(Arc::clone(polling), Arc::clone(self.queues.for_kind(kind))));
            }
        }
    }

    async fn run_worker(self: Arc<Self>, kind: Kind) {
        let queue = Arc::clone(self.queues.for_kind(kind));
        while let Some(key) = queue.get().await {
            self.process_key(kind, &queue, &key).await;
        }
        debug!(kind = %kind, "worker stopped");
    }

    /// One reconcile pass over a key taken from `queue`
    async fn process_key(&self, kind: Kind, queue: &Arc<WorkQueue>, key: &str) {
        let result = self.reconciler.reconcile_key(kind, key).await;
        let label = apply_result(queue, self.queues.polling_for(kind), key, &result);
        self.metrics.record_reconcile(kind.as_str(), label);
        match &result {
            Ok(outcome) => debug!(kind = %kind, key, ?outcome, "reconciled"),
            Err(e) if e.is_terminal() => warn!(kind = %kind, key, error = %e, "giving up on key"),
            Err(e) => warn!(kind = %kind, key, error = %e, "reconcile failed, retrying with backoff"),
        }
        queue.done(key);
    }
}

/// Requeue `key` according to the pass result; returns the metric label
pub(crate) fn apply_result(
    queue: &Arc<WorkQueue>,
    polling: Option<&Arc<WorkQueue>>,
    key: &str,
    result: &Result<Outcome, ControllerError>,
) -> &'static str {
    match result {
        Ok(Outcome::Done) => {
            queue.forget(key);
            "success"
        }
        Ok(Outcome::RequeueNow) => {
            queue.forget(key);
            queue.add(key);
            "requeue"
        }
        Ok(Outcome::RequeueAfter(delay)) => {
            queue.forget(key);
            queue.add_after(key, *delay);
            "requeue"
        }
        Ok(Outcome::Poll(delay)) => {
            queue.forget(key);
            polling.unwrap_or(queue).add_after(key, *delay);
            "poll"
        }
        Err(e) if e.is_terminal() => {
            queue.forget(key);
            "terminal"
        }
        Err(_) => {
            queue.add_rate_limited(key);
            "error"
        }
    }
}

/// Move keys whose poll delay expired back onto the main queue
async fn forward_polled(polling: Arc<WorkQueue>, target: Arc<WorkQueue>) {
    while let Some(key) = polling.get().await {
        target.add(key.as_str());
        polling.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;
    use std::time::Duration;
    use tokio::time::timeout;

    const KEY: &str = "default/db";

    #[test]
    fn test_queue_lookup() {
        let queues = Queues::new();
        assert_eq!(queues.for_kind(Kind::Broker).name(), "service-broker");
        assert_eq!(queues.for_kind(Kind::Binding).name(), "service-binding");
        assert!(queues.polling_for(Kind::Plan).is_none());
        assert_eq!(queues.polling_for(Kind::Instance).map(|q| q.name()), Some("instance-poller"));
    }

    #[tokio::test]
    async fn test_done_forgets_key() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited(KEY);
        assert_eq!(queue.num_requeues(KEY), 1);

        assert_eq!(apply_result(&queue, None, KEY, &Ok(Outcome::Done)), "success");
        assert_eq!(queue.num_requeues(KEY), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_now_adds_immediately() {
        let queue = WorkQueue::new("test");
        assert_eq!(apply_result(&queue, None, KEY, &Ok(Outcome::RequeueNow)), "requeue");
        assert_eq!(queue.drain(), vec![KEY.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_goes_through_polling_queue() {
        let queue = WorkQueue::new("test");
        let polling = WorkQueue::new("test-poller");
        let label = apply_result(&queue, Some(&polling), KEY, &Ok(Outcome::Poll(Duration::from_secs(5))));
        assert_eq!(label, "poll");
        assert!(polling.is_empty(), "Poll delay has not expired yet");

        let polled = timeout(Duration::from_secs(10), polling.get()).await.unwrap();
        assert_eq!(polled.as_deref(), Some(KEY));
        assert!(queue.is_empty(), "Main queue only sees the key after forwarding");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarder_moves_keys_back() {
        let queue = WorkQueue::new("test");
        let polling = WorkQueue::new("test-poller");
        let forwarder = tokio::spawn(forward_polled(Arc::clone(&polling), Arc::clone(&queue)));

        polling.add(KEY);
        let key = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(key.as_deref(), Some(KEY));

        polling.shut_down();
        forwarder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_rate_limited_unless_terminal() {
        let queue = WorkQueue::new("test");
        let retriable = Err(ControllerError::operation("ErrorFetchingCatalog", "connection refused"));
        assert_eq!(apply_result(&queue, None, KEY, &retriable), "error");
        assert_eq!(queue.num_requeues(KEY), 1);
        let key = timeout(Duration::from_secs(60), queue.get()).await.unwrap();
        assert_eq!(key.as_deref(), Some(KEY));
        queue.done(KEY);

        let terminal = Err(ControllerError::terminal("ProvisionCallFailed", "400"));
        assert_eq!(apply_result(&queue, None, KEY, &terminal), "terminal");
        assert_eq!(queue.num_requeues(KEY), 0, "Terminal failures reset the backoff");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_worker_pass_counts_reconcile_once() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new(Arc::clone(&env.reconciler), Arc::new(Queues::new()), Arc::clone(&env.metrics), 1);
        let queue = Arc::clone(dispatcher.queues().for_kind(Kind::Instance));
        queue.add(KEY);
        let key = queue.get().await.expect("key should be queued");

        dispatcher.process_key(Kind::Instance, &queue, &key).await;
        assert_eq!(env.metrics.reconcile_count("ServiceInstance", "success"), 1.0);
        assert_eq!(env.metrics.reconcile_count("ServiceInstance", "error"), 0.0);
        assert!(queue.is_empty(), "A deleted object needs no further passes");

        queue.add(KEY);
        let key = queue.get().await.expect("key should be queued again");
        dispatcher.process_key(Kind::Instance, &queue, &key).await;
        assert_eq!(env.metrics.reconcile_count("ServiceInstance", "success"), 2.0);
    }

    #[tokio::test]
    async fn test_shut_down_stops_every_queue() {
        let queues = Queues::new();
        queues.shut_down();
        for kind in Kind::ALL {
            assert!(queues.for_kind(kind).is_shutting_down());
        }
        assert!(queues.binding_polling.is_shutting_down());
        assert_eq!(queues.instance.get().await, None);
    }
}
