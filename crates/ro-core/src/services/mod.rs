pub mod config_loader;
pub mod deploy_log;
pub mod maintenance;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod rollback;
pub mod smoke;
pub mod supervisor;
