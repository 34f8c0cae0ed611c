//! Core application container
//!
//! This module wires the configuration, the conversation store and the model
//! gateway together and hands out session engines.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    config::Config,
    llm::{GlmGateway, ModelGateway},
    session::SessionEngine,
    store::{Database, DEFAULT_TITLE},
};

/// Main application structure
pub struct App {
    config: Config,
    store: Database,
    gateway: Arc<dyn ModelGateway>,
}

impl App {
    /// Create the application with the configured GLM gateway
    pub async fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let gateway = GlmGateway::new(config.gateway_settings())?;
        Self::with_gateway(config, Arc::new(gateway)).await
    }

    /// Create the application around an existing gateway
    pub async fn with_gateway(config: Config, gateway: Arc<dyn ModelGateway>) -> Result<Self> {
        debug!("Creating new App instance");

        // Ensure data directory exists
        if !config.data_dir.exists() {
            tokio::fs::create_dir_all(&config.data_dir).await?;
        }

        let store = Database::open(config.database_path()).await?;
        info!(
            "Using {} model {} with database {}",
            gateway.name(),
            gateway.model(),
            store.path().display()
        );

        Ok(Self {
            config,
            store,
            gateway,
        })
    }

    /// Open the conversation store without a gateway, for read-only commands
    pub async fn open_store(config: &Config) -> Result<Database> {
        if !config.data_dir.exists() {
            tokio::fs::create_dir_all(&config.data_dir).await?;
        }
        Ok(Database::open(config.database_path()).await?)
    }

    /// Start a new conversation and open a session for it
    pub async fn new_session(&self) -> Result<SessionEngine> {
        let conversation = self.store.create_conversation(DEFAULT_TITLE).await?;
        info!("Created conversation {}", conversation.id);
        self.open_session(&conversation.id).await
    }

    /// Open a session for an existing conversation
    pub async fn open_session(&self, conversation_id: &str) -> Result<SessionEngine> {
        let session = SessionEngine::open(
            self.store.clone(),
            self.gateway.clone(),
            self.config.session_settings(),
            conversation_id,
        )
        .await?;
        Ok(session)
    }

    /// Shutdown the application gracefully
    pub fn shutdown(&self) {
        info!("Shutting down application");
        self.gateway.shutdown();
    }
}
