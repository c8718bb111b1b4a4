use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use annolab_common::model::{Project, ProjectName};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::{ControllerConfig, WatchdogConfig};
use crate::metrics;
use crate::model::{TaskSpec, WorkflowDocument};
use crate::repo::labeling::LabelingRepo;
use crate::repo::project::ProjectRepo;
use crate::service::controller::{AiController, WorkflowRef};
use crate::service::tracker::WorkflowTracker;
use crate::workflow::defaults::default_autotrain_workflow;
use crate::workflow::graph::{QUEUE_AI_CONTROLLER, QUEUE_AI_WORKER};

/// Dynamic polling back-off: long waits when the project is stagnant or
/// already close to the threshold, short waits amid active labeling.
pub fn next_wait(
    count: i64,
    last_count: i64,
    threshold: i64,
    min_wait: Duration,
    max_wait: Duration,
) -> Duration {
    let progress = (count as f64 / threshold.max(1) as f64).clamp(0.0, 1.0);
    let delta = (count - last_count) as f64 / (count + last_count).max(1) as f64;
    let frac = 0.8 * (1.0 - progress.powi(4)) + 0.2 * (1.0 - delta.powi(2));
    let wait = max_wait.as_secs_f64() * frac;
    Duration::from_secs_f64(wait.clamp(min_wait.as_secs_f64(), max_wait.as_secs_f64()))
}

/// Per-project loop that watches annotation progress and auto-launches the
/// project's default workflow when the configured threshold is reached.
/// Started lazily on the first status request; stops itself when the
/// project's schema disappears.
pub struct AnnotationWatchdog {
    shared: Arc<WatchdogShared>,
}

struct WatchdogShared {
    project: ProjectName,
    config: WatchdogConfig,
    launch_caps: ControllerConfig,
    project_repo: Arc<dyn ProjectRepo>,
    labeling_repo: Arc<dyn LabelingRepo>,
    tracker: Arc<WorkflowTracker>,
    broker: Arc<dyn BrokerClient>,
    controller: Weak<AiController>,
    stop: AtomicBool,
    notify: Notify,
    reload_properties: AtomicBool,
    current_wait_millis: AtomicU64,
    last_count: AtomicI64,
    properties: StdRwLock<Option<Project>>,
}

impl AnnotationWatchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        project: ProjectName,
        config: WatchdogConfig,
        launch_caps: ControllerConfig,
        project_repo: Arc<dyn ProjectRepo>,
        labeling_repo: Arc<dyn LabelingRepo>,
        tracker: Arc<WorkflowTracker>,
        broker: Arc<dyn BrokerClient>,
        controller: Weak<AiController>,
    ) -> Self {
        let min_wait_millis = config.min_wait.as_millis() as u64;
        let shared = Arc::new(WatchdogShared {
            project,
            config,
            launch_caps,
            project_repo,
            labeling_repo,
            tracker,
            broker,
            controller,
            stop: AtomicBool::new(false),
            notify: Notify::new(),
            reload_properties: AtomicBool::new(false),
            current_wait_millis: AtomicU64::new(min_wait_millis),
            last_count: AtomicI64::new(0),
            properties: StdRwLock::new(None),
        });
        tokio::spawn(Self::run(shared.clone()));
        AnnotationWatchdog { shared }
    }

    /// Shortens the next wait to the minimum ("someone is looking at the
    /// interface").
    pub fn nudge(&self) {
        self.shared
            .current_wait_millis
            .store(self.shared.config.min_wait.as_millis() as u64, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Reloads project properties on the next wake, then nudges.
    pub fn recheck_autotrain_settings(&self) {
        self.shared.reload_properties.store(true, Ordering::SeqCst);
        self.nudge();
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> i64 {
        self.shared
            .properties
            .read()
            .expect("watchdog properties lock")
            .as_ref()
            .map(|project| i64::from(project.numimages_autotrain))
            .unwrap_or(-1)
    }

    pub fn autotrain_enabled(&self) -> bool {
        self.shared
            .properties
            .read()
            .expect("watchdog properties lock")
            .as_ref()
            .map(|project| project.ai_model_enabled)
            .unwrap_or(false)
    }

    pub fn last_count(&self) -> i64 {
        self.shared.last_count.load(Ordering::SeqCst)
    }

    async fn load_properties(shared: &WatchdogShared) -> bool {
        match shared.project_repo.get(&shared.project).await {
            Ok(Some(project)) => {
                *shared.properties.write().expect("watchdog properties lock") = Some(project);
                true
            }
            Ok(None) => false,
            Err(repo_error) => {
                warn!(
                    project = %shared.project,
                    "Watchdog could not load project properties: {repo_error}"
                );
                true
            }
        }
    }

    /// The auto-train workflow parameterised with the project's caps, used
    /// when the project has no default workflow set.
    fn parameterised_default(shared: &WatchdogShared, project: &Project) -> WorkflowDocument {
        let mut document = default_autotrain_workflow();
        if let Some(TaskSpec::Node(train)) = document.tasks.get_mut(0) {
            train
                .kwargs
                .insert("min_anno_per_image".to_string(), json!(project.minnumannoperimage));
            train
                .kwargs
                .insert("max_num_images".to_string(), json!(project.maxnumimages_train));
            train.kwargs.insert(
                "max_num_workers".to_string(),
                json!(shared.launch_caps.max_num_workers_train),
            );
        }
        if let Some(TaskSpec::Node(inference)) = document.tasks.get_mut(1) {
            inference.kwargs.insert(
                "max_num_images".to_string(),
                json!(project.maxnumimages_inference),
            );
            inference.kwargs.insert(
                "max_num_workers".to_string(),
                json!(shared.launch_caps.max_num_workers_inference),
            );
        }
        document
    }

    async fn launch_default_workflow(shared: &WatchdogShared, project: &Project) {
        let Some(controller) = shared.controller.upgrade() else {
            return;
        };
        let workflow = match shared.project_repo.default_workflow_id(&shared.project).await {
            Ok(Some(id)) => WorkflowRef::Id(id),
            Ok(None) => WorkflowRef::Document(Self::parameterised_default(shared, project)),
            Err(repo_error) => {
                warn!(
                    project = %shared.project,
                    "Watchdog could not resolve default workflow: {repo_error}"
                );
                return;
            }
        };
        match controller
            .launch_task(&shared.project, workflow, None)
            .await
        {
            Ok(workflow_id) => {
                info!(
                    project = %shared.project,
                    workflow_id = %workflow_id,
                    "Auto-launched training workflow"
                );
            }
            Err(launch_error) => {
                // admission races with user launches; try again next tick
                debug!(
                    project = %shared.project,
                    "Auto-launch skipped: {launch_error}"
                );
            }
        }
    }

    async fn tick(shared: &WatchdogShared) {
        if shared.reload_properties.swap(false, Ordering::SeqCst)
            && !Self::load_properties(shared).await
        {
            shared.stop.store(true, Ordering::SeqCst);
            return;
        }

        match shared.project_repo.project_exists(&shared.project).await {
            Ok(true) => {}
            Ok(false) => {
                info!(project = %shared.project, "Project gone, stopping watchdog");
                shared.stop.store(true, Ordering::SeqCst);
                return;
            }
            Err(repo_error) => {
                warn!(
                    project = %shared.project,
                    "Watchdog could not probe project schema: {repo_error}"
                );
                return;
            }
        }

        let tasks_running = match shared.tracker.reconcile(&shared.project).await {
            Ok(tasks_running) => tasks_running,
            Err(reconcile_error) => {
                warn!(
                    project = %shared.project,
                    "Watchdog reconciliation failed: {reconcile_error}"
                );
                return;
            }
        };

        let properties = shared
            .properties
            .read()
            .expect("watchdog properties lock")
            .clone();
        let Some(project) = properties else {
            return;
        };
        let threshold = i64::from(project.numimages_autotrain);
        if !project.ai_model_enabled || threshold <= 0 {
            return;
        }

        let has_workers = match shared.broker.inspect().await {
            Ok(snapshot) => {
                snapshot.count_queue_consumers(QUEUE_AI_CONTROLLER) > 0
                    && snapshot.count_queue_consumers(QUEUE_AI_WORKER) > 0
            }
            Err(_) => false,
        };

        let count = match shared
            .labeling_repo
            .annotated_image_count(&shared.project, i64::from(project.minnumannoperimage))
            .await
        {
            Ok(count) => count,
            Err(repo_error) => {
                warn!(
                    project = %shared.project,
                    "Watchdog could not count annotated images: {repo_error}"
                );
                return;
            }
        };

        if tasks_running.is_empty() && count >= threshold && has_workers {
            Self::launch_default_workflow(shared, &project).await;
        } else {
            let wait = next_wait(
                count,
                shared.last_count.load(Ordering::SeqCst),
                threshold,
                shared.config.min_wait,
                shared.config.max_wait,
            );
            shared
                .current_wait_millis
                .store(wait.as_millis() as u64, Ordering::SeqCst);
            shared.last_count.store(count, Ordering::SeqCst);
        }
    }

    async fn run(shared: Arc<WatchdogShared>) {
        metrics::record_watchdog_started();
        Self::load_properties(&shared).await;

        loop {
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            Self::tick(&shared).await;

            // sleep in slices so nudges and stops stay responsive; a nudge
            // lowers the wait target mid-sleep
            let mut waited = Duration::ZERO;
            loop {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                let target =
                    Duration::from_millis(shared.current_wait_millis.load(Ordering::SeqCst));
                if waited >= target {
                    break;
                }
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(shared.config.slice) => {
                        waited += shared.config.slice;
                    }
                }
            }
        }
        metrics::record_watchdog_stopped();
    }
}

impl Drop for AnnotationWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
