//! Main proxy server implementation.
//!
//! Accepts Postgres wire protocol connections, rewrites each statement for
//! the encrypted physical layout and forwards it to the upstream server.

use crate::error::ProxyError;
use crate::handler::{PasswordStartupHandler, SessionContext, TdeQueryHandler, TdeServerHandlers};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tde_core::config::{ProxyConfig, TdeConfig, UpstreamConfig};
use tde_core::ColumnCatalog;
use tde_crypto::KeyedCodec;
use tde_sql::{PipelineOptions, QueryPipeline};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// The TDE proxy server.
pub struct TdeProxy {
    config: ProxyConfig,
    upstream: UpstreamConfig,
    pipeline: Arc<QueryPipeline>,
    password: Option<Arc<String>>,
}

impl TdeProxy {
    /// Create a new proxy around an already built pipeline.
    pub fn new(config: ProxyConfig, upstream: UpstreamConfig, pipeline: QueryPipeline) -> Self {
        let password = config.password.clone().map(Arc::new);
        Self {
            config,
            upstream,
            pipeline: Arc::new(pipeline),
            password,
        }
    }

    /// Build the catalog, codec and pipeline described by `config`.
    pub fn from_config(config: &TdeConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let catalog = ColumnCatalog::from_config(&config.catalog)?;
        let codec = KeyedCodec::from_config(&config.encryption)?;
        tracing::debug!(
            tables = catalog.len(),
            join_key_size = codec.join_key_size(),
            "Loaded column catalog"
        );

        let pipeline = QueryPipeline::with_options(
            Arc::new(catalog),
            Arc::new(codec),
            PipelineOptions::from(&config.sql),
        );

        Ok(Self::new(
            config.proxy.clone(),
            config.upstream.clone(),
            pipeline,
        ))
    }

    /// Get a reference to the proxy configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The statement pipeline shared by all connections.
    pub fn pipeline(&self) -> &Arc<QueryPipeline> {
        &self.pipeline
    }

    /// Create handlers for a new connection.
    /// The session context is shared between the startup handler and the
    /// query handler of the same connection.
    fn create_connection_handlers(&self, pool: PgPool) -> Arc<TdeServerHandlers> {
        let session = Arc::new(RwLock::new(SessionContext::default()));

        let startup_handler = Arc::new(PasswordStartupHandler::new(
            self.password.clone(),
            session.clone(),
        ));
        let query_handler = Arc::new(TdeQueryHandler::new(
            self.pipeline.clone(),
            pool,
            session,
        ));

        Arc::new(TdeServerHandlers::new(query_handler, startup_handler))
    }

    /// Run the proxy server.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listen_addr = self.config.bind_address();

        tracing::info!(
            listen_addr = %listen_addr,
            upstream = %self.upstream.display_target(),
            tde_tables = self.pipeline.catalog().len(),
            "Starting TDE proxy server"
        );

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(u64::from(self.config.connection_timeout)))
            .connect(&self.upstream.connection_string())
            .await
            .map_err(|e| ProxyError::UpstreamConnectionFailed(e.to_string()))?;

        tracing::info!("Connected to upstream PostgreSQL");

        let listener = TcpListener::bind(&listen_addr).await.map_err(|e| {
            ProxyError::BindFailed {
                address: listen_addr.clone(),
                source: e,
            }
        })?;

        tracing::info!(address = %listen_addr, "Proxy server listening");

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            tracing::debug!(peer = %peer_addr, "New connection");

            let handlers = self.create_connection_handlers(pool.clone());

            tokio::spawn(async move {
                if let Err(e) = pgwire::tokio::process_socket(socket, None, handlers).await {
                    tracing::error!(peer = %peer_addr, error = ?e, "Connection error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tde_crypto::MasterKey;

    #[test]
    fn test_proxy_creation() {
        let codec = KeyedCodec::new(MasterKey::generate(), 2).unwrap();
        let pipeline = QueryPipeline::new(Arc::new(ColumnCatalog::empty()), Arc::new(codec));
        let config = ProxyConfig {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 6433,
            password: Some("secret".to_string()),
            ..ProxyConfig::default()
        };

        let proxy = TdeProxy::new(config, UpstreamConfig::default(), pipeline);
        assert_eq!(proxy.config().listen_port, 6433);
        assert_eq!(proxy.password.as_deref().map(String::as_str), Some("secret"));
        assert!(proxy.pipeline().catalog().is_empty());
    }
}
