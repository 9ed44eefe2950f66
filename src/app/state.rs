//! Application state shared across routes

use std::sync::Arc;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::{AuthMode, Config, ConfigError};
use crate::game::reference::ReferenceRules;
use crate::game::{GameRules, MatchRegistry};
use crate::http::auth::{AuthProvider, JwksAuth, SharedSecretAuth};
use crate::matchmaking::{
    FlatRatingProjector, Matchmaker, NoopNotifier, QueueNotifier, RatingProjector, ServerPool,
    StaticServerPool, WebhookNotifier,
};
use crate::persist::{
    AppSyncSink, LambdaFinalizer, MatchFinalizer, MatchLifecycle, SigV4Signer, SnapshotSink,
    StoreFinalizer,
};
use crate::protection::ecs::{EcsAgentProtection, NoopOrchestrator};
use crate::protection::{OrchestratorControl, ProtectionGovernor};
use crate::store::{MatchStore, MemoryMatchStore, RestMatchStore};
use crate::util::rate_limit::{create_limiter, Limiter, MATCHMAKING_RATE_LIMIT};

/// External collaborators the server is wired with
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn MatchStore>,
    pub sink: Arc<dyn SnapshotSink>,
    pub finalizer: Arc<dyn MatchFinalizer>,
    pub orchestrator: Arc<dyn OrchestratorControl>,
    pub auth: Arc<dyn AuthProvider>,
    pub rules: Arc<dyn GameRules>,
    pub servers: Arc<dyn ServerPool>,
    pub notifier: Arc<dyn QueueNotifier>,
    pub ratings: Arc<dyn RatingProjector>,
}

impl Services {
    /// Real collaborators where configured, local stand-ins otherwise.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let client = Client::new();

        let (store, store_sink): (Arc<dyn MatchStore>, Arc<dyn SnapshotSink>) = match &config.store {
            Some(endpoint) => {
                let rest = Arc::new(RestMatchStore::new(
                    client.clone(),
                    endpoint.url.clone(),
                    endpoint.service_key.clone(),
                ));
                (rest.clone() as Arc<dyn MatchStore>, rest as Arc<dyn SnapshotSink>)
            }
            None => {
                warn!("STORE_URL not set, using in-memory match store");
                let memory = Arc::new(MemoryMatchStore::new());
                (memory.clone() as Arc<dyn MatchStore>, memory as Arc<dyn SnapshotSink>)
            }
        };

        let signer = |service: &str| {
            config
                .aws_credentials
                .clone()
                .map(|creds| SigV4Signer::new(creds, config.aws_region.clone(), service))
                .ok_or(ConfigError::Missing("AWS_ACCESS_KEY_ID"))
        };

        let sink: Arc<dyn SnapshotSink> = match &config.appsync_url {
            Some(url) => {
                if let Some(role) = &config.appsync_role_arn {
                    info!(role = %role, "Signing snapshot writes with environment credentials");
                }
                Arc::new(AppSyncSink::new(client.clone(), url.clone(), signer("appsync")?))
            }
            None => store_sink,
        };

        let finalizer: Arc<dyn MatchFinalizer> = match &config.finalizer {
            Some(functions) => Arc::new(LambdaFinalizer::new(
                client.clone(),
                signer("lambda")?,
                config.aws_region.clone(),
                functions.end.clone(),
                functions.abort.clone(),
            )),
            None => {
                info!("No finalizer functions configured, records are logged and bindings released");
                Arc::new(StoreFinalizer::new(store.clone()))
            }
        };

        let orchestrator: Arc<dyn OrchestratorControl> = match &config.ecs_agent_uri {
            Some(uri) => Arc::new(EcsAgentProtection::new(client.clone(), uri.clone())),
            None => Arc::new(NoopOrchestrator),
        };

        let auth: Arc<dyn AuthProvider> = match &config.auth {
            AuthMode::Cognito { region, user_pool_id } => {
                Arc::new(JwksAuth::cognito(client.clone(), region, user_pool_id))
            }
            AuthMode::SharedSecret(secret) => Arc::new(SharedSecretAuth::new(secret.clone())),
        };

        let notifier: Arc<dyn QueueNotifier> = match &config.matchmaking_notify_url {
            Some(url) => Arc::new(WebhookNotifier::new(client, url.clone())),
            None => Arc::new(NoopNotifier),
        };

        Ok(Self {
            store,
            sink,
            finalizer,
            orchestrator,
            auth,
            rules: Arc::new(ReferenceRules),
            servers: Arc::new(StaticServerPool::new(config.public_server_addr.clone())),
            notifier,
            ratings: Arc::new(FlatRatingProjector),
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<MatchRegistry>,
    pub rules: Arc<dyn GameRules>,
    pub auth: Arc<dyn AuthProvider>,
    pub matchmaker: Arc<Matchmaker>,
    pub protection: Arc<ProtectionGovernor>,
    /// Process-wide cap on matchmaking requests
    pub matchmaking_limiter: Arc<Limiter>,
}

impl AppState {
    pub fn new(config: Config, services: Services) -> Self {
        let config = Arc::new(config);

        let protection = ProtectionGovernor::new(services.orchestrator);

        let hooks = Arc::new(MatchLifecycle::new(
            services.store.clone(),
            services.sink,
            services.finalizer,
        ));

        let registry = MatchRegistry::new(
            services.store.clone(),
            services.rules.clone(),
            hooks,
            protection.clone(),
            config.max_lag_forgiven,
        );

        let matchmaker = Arc::new(Matchmaker::new(
            services.store,
            services.servers,
            services.notifier,
            services.ratings,
        ));

        Self {
            config,
            registry,
            rules: services.rules,
            auth: services.auth,
            matchmaker,
            protection,
            matchmaking_limiter: create_limiter(MATCHMAKING_RATE_LIMIT),
        }
    }
}
