pub mod autoresponder;
pub mod batch;
pub mod classifier;
pub mod configuration;
pub mod domain;
pub mod engine;
pub mod log_store;
pub mod loop_guard;
pub mod mail_gateway;
pub mod message_log;
pub mod report;
pub mod router;
pub mod startup;
pub mod telemetry;
pub mod template_store;
