pub mod control_tasks;
pub mod controller;
pub mod dispatcher;
pub mod task_monitor;
pub mod tracker;
pub mod watchdog;

use std::sync::Arc;

use crate::broker::BrokerClient;
use crate::config::AiServiceConfig;
use crate::db;
use crate::registry::ModelRegistry;
use crate::repo::history::DbWorkflowHistoryRepo;
use crate::repo::labeling::DbLabelingRepo;
use crate::repo::model_state::DbModelStateRepo;
use crate::repo::project::DbProjectRepo;
use crate::repo::workflow::DbWorkflowRepo;
use crate::service::control_tasks::ControlTasks;
use crate::service::controller::AiController;

/// Wired-up service graph of the AI orchestration core. The broker client
/// and the model registry come from the embedding process; everything else
/// is built from the configuration.
#[derive(Clone)]
pub struct Services {
    pub controller: Arc<AiController>,
    pub control_tasks: Arc<ControlTasks>,
}

impl Services {
    pub async fn new(
        config: &AiServiceConfig,
        broker: Arc<dyn BrokerClient>,
        registry: Arc<ModelRegistry>,
    ) -> Result<Services, String> {
        let db_pool = Arc::new(
            db::create_postgres_pool(&config.db)
                .await
                .map_err(|e| e.to_string())?,
        );

        let project_repo = Arc::new(DbProjectRepo::new(db_pool.clone()));
        let workflow_repo = Arc::new(DbWorkflowRepo::new(db_pool.clone()));
        let history_repo = Arc::new(DbWorkflowHistoryRepo::new(db_pool.clone()));
        let model_state_repo = Arc::new(DbModelStateRepo::new(db_pool.clone()));
        let labeling_repo = Arc::new(DbLabelingRepo::new(db_pool.clone()));

        let controller = AiController::new(
            config.controller.clone(),
            config.watchdog.clone(),
            config.task_monitor.clone(),
            project_repo.clone(),
            workflow_repo,
            history_repo,
            model_state_repo.clone(),
            labeling_repo.clone(),
            broker,
            registry,
        );
        let control_tasks = Arc::new(ControlTasks::new(
            project_repo,
            labeling_repo,
            model_state_repo,
        ));

        Ok(Services {
            controller,
            control_tasks,
        })
    }
}
