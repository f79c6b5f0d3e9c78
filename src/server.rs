use crate::background::BackgroundTaskTracker;
use crate::config::Config;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::handlers::{health_check, not_found, send_notification, AppState};
use crate::identity::ClientIdentityResolver;
use crate::middleware::{handle_panic, json_error_envelope, rate_limit_middleware, RateLimitGate};
use crate::registry::ClientRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignals, ShutdownTrigger};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
///
/// Layers, outermost first: panic recovery, request tracing, JSON error
/// envelope, rate limiting, body size limit, request timeout.
pub fn create_app(state: AppState, gate: Arc<RateLimitGate>) -> Router {
    let request_timeout = state.config.request_timeout;
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/v1/healthcheck", get(health_check))
        .route("/v1/notifications", post(send_notification))
        .fallback(not_found)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(TraceLayer::new_for_http())
                .layer(middleware::map_response_with_state(
                    body_limit,
                    json_error_envelope,
                ))
                .layer(middleware::from_fn_with_state(gate, rate_limit_middleware))
                .layer(RequestBodyLimitLayer::new(body_limit))
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

/// Owns the process-scoped components and wires them to the HTTP layer.
pub struct Server {
    config: Arc<Config>,
    registry: Arc<ClientRegistry>,
    tracker: BackgroundTaskTracker,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Server {
    pub fn new(config: Config) -> ThrottlerResult<Self> {
        config.validate()?;

        let registry = Arc::new(ClientRegistry::from_config(&config));
        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_drain_deadline));

        Ok(Self {
            config: Arc::new(config),
            registry,
            tracker: BackgroundTaskTracker::new(),
            coordinator,
        })
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn tracker(&self) -> BackgroundTaskTracker {
        self.tracker.clone()
    }

    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            tracker: self.tracker.clone(),
        };
        let gate = Arc::new(RateLimitGate::new(
            Arc::clone(&self.registry),
            ClientIdentityResolver::new(self.config.trust_proxy_headers),
        ));

        create_app(state, gate)
    }

    /// Bind the configured address and serve until a termination signal has
    /// been handled. Fails before serving if the signal handlers cannot be
    /// installed.
    pub async fn run(self) -> ThrottlerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let signals = ShutdownSignals::install()?;

        let coordinator = self.coordinator();
        let forwarder = tokio::spawn(async move {
            if let Err(e) = signals.forward(Arc::clone(&coordinator)).await {
                tracing::error!(error = %e, "signal listener failed, shutting down");
                coordinator.trigger(ShutdownTrigger::Programmatic);
            }
        });
        let result = self.serve(listener).await;
        forwarder.abort();

        result
    }

    /// Serve on `listener` until the coordinator is triggered, then drain.
    pub async fn serve(self, listener: TcpListener) -> ThrottlerResult<()> {
        let addr = listener.local_addr()?;
        let app = self.router();
        let sweeper = self.spawn_sweeper();

        tracing::info!(
            addr = %addr,
            env = %self.config.environment,
            rate_limit_enabled = self.registry.is_enabled(),
            "starting server"
        );

        let coordinator = self.coordinator();
        let mut server = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { coordinator.draining().await })
            .into_future(),
        );

        tokio::select! {
            biased;
            _ = self.coordinator.draining() => {}
            result = &mut server => {
                if let Some(sweeper) = sweeper {
                    sweeper.abort();
                }
                return Err(match result {
                    Ok(Ok(())) => ThrottlerError::InternalError(
                        "server stopped before shutdown was requested".to_string(),
                    ),
                    Ok(Err(e)) => ThrottlerError::Io(e),
                    Err(e) => ThrottlerError::InternalError(format!("server task failed: {}", e)),
                });
            }
        }

        // The listener is closed once the server future observes the
        // trigger, and idle keep-alive connections are closed with it; what
        // is left is finishing already-accepted requests.
        let requests = async move {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "server error while draining"),
                Err(e) => tracing::error!(error = %e, "server task failed while draining"),
            }
        };

        let result = self.coordinator.drain(requests, &self.tracker).await;

        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        result
    }

    /// Start the idle-client sweeper, unless rate limiting is disabled and
    /// the registry never stores a client.
    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.registry.is_enabled().then(|| {
            self.registry.spawn_sweeper(
                self.config.sweep_interval,
                self.config.idle_eviction_threshold,
                self.coordinator.subscribe(),
            )
        })
    }
}
