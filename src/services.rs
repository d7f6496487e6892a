// Wires the persistence/risk-control/relay stack into one handle shared
// by every route. Built once at startup from `Store::get_risk_control_config`
// so a restart picks up any config rows an operator changed in the DB.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::KiroAdapter;
use crate::auth::AuthManager;
use crate::cache::ModelCache;
use crate::config::Config;
use crate::distributor::{Distributor, ProviderInfo, Strategy};
use crate::http_client::KiroHttpClient;
use crate::metrics::MetricsCollector;
use crate::relay::{AdapterRegistry, Relay};
use crate::resolver::ModelResolver;
use crate::risk_control::{BindingStrategy, ProxyConfig, RiskControl, ScopeLimits};
use crate::store::Store;

/// Provider name the single Kiro backend registers under, both in the
/// adapter registry and in credential rows' `provider_type` column.
pub const KIRO_PROVIDER: &str = "kiro";

pub struct Services {
    pub store: Arc<dyn Store>,
    pub risk: Arc<RiskControl>,
    pub distributor: Arc<Distributor>,
    pub relay: Arc<Relay>,
    pub adapters: AdapterRegistry,
    pub auth_manager: Arc<AuthManager>,
    pub http_client: Arc<KiroHttpClient>,
    pub model_cache: ModelCache,
    pub resolver: ModelResolver,
    pub config: Arc<Config>,
    pub metrics: Arc<MetricsCollector>,
}

fn parse_binding_strategy(raw: &str) -> BindingStrategy {
    match raw.to_ascii_uppercase().as_str() {
        "RANDOM" => BindingStrategy::Random,
        "ROUND_ROBIN" | "ROUNDROBIN" => BindingStrategy::RoundRobin,
        "LEAST_USED" | "LEASTUSED" => BindingStrategy::LeastUsed,
        _ => BindingStrategy::Sticky,
    }
}

impl Services {
    pub async fn new(
        store: Arc<dyn Store>,
        auth_manager: Arc<AuthManager>,
        http_client: Arc<KiroHttpClient>,
        model_cache: ModelCache,
        resolver: ModelResolver,
        config: Arc<Config>,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<Self> {
        let risk_config = store.get_risk_control_config().await?;

        let proxies: Vec<ProxyConfig> = Vec::new();
        let risk = Arc::new(RiskControl::new(
            risk_config.fingerprint_pool_size,
            parse_binding_strategy(&risk_config.proxy_binding_strategy),
            proxies,
        ));

        let limits = ScopeLimits {
            rpm: risk_config.rate_limit_global_rpm,
            tpm: risk_config.rate_limit_global_tpm,
            burst_size: risk_config.rate_limit_burst_size,
            min_interval_ms: risk_config.rate_limit_min_interval_ms,
        };

        let distributor = Arc::new(Distributor::new(Strategy::Priority));

        let kiro_adapter: Arc<dyn crate::relay::ProviderAdapter> =
            Arc::new(KiroAdapter::new(http_client.clone(), risk.clone(), config.clone(), limits));
        let mut adapters: AdapterRegistry = HashMap::new();
        adapters.insert(KIRO_PROVIDER.to_string(), kiro_adapter);

        let relay = Arc::new(Relay::new(store.clone(), risk.clone(), distributor.clone()));

        Ok(Self {
            store,
            risk,
            distributor,
            relay,
            adapters,
            auth_manager,
            http_client,
            model_cache,
            resolver,
            config,
            metrics,
        })
    }

    /// A fully-wired `Services` over an in-memory store, for tests that
    /// exercise routes/middleware without a real Kiro backend or sqlite file.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing() -> Arc<Self> {
        Self::new_for_testing_with_store(Arc::new(crate::store::MemoryStore::new()))
    }

    /// Same as `new_for_testing`, but over a caller-supplied in-memory store
    /// so tests can seed tokens/users/credentials before requests hit it.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing_with_store(store: Arc<crate::store::MemoryStore>) -> Arc<Self> {
        let store: Arc<dyn Store> = store;
        let auth_manager = Arc::new(
            AuthManager::new_for_testing("test-token".to_string(), "us-east-1".to_string(), 300).unwrap(),
        );
        let http_client = Arc::new(KiroHttpClient::new(auth_manager.clone(), 20, 30, 300, 3).unwrap());
        let model_cache = ModelCache::new(3600);
        let resolver = ModelResolver::new(model_cache.clone(), HashMap::new());
        let config = Arc::new(Config::for_testing());
        let metrics = Arc::new(MetricsCollector::new());

        let risk = Arc::new(RiskControl::new(4, BindingStrategy::Sticky, Vec::new()));
        let limits = ScopeLimits::unlimited();
        let distributor = Arc::new(Distributor::new(Strategy::Priority));

        let kiro_adapter: Arc<dyn crate::relay::ProviderAdapter> =
            Arc::new(KiroAdapter::new(http_client.clone(), risk.clone(), config.clone(), limits));
        let mut adapters: AdapterRegistry = HashMap::new();
        adapters.insert(KIRO_PROVIDER.to_string(), kiro_adapter);

        let relay = Arc::new(Relay::new(store.clone(), risk.clone(), distributor.clone()));

        Arc::new(Self {
            store,
            risk,
            distributor,
            relay,
            adapters,
            auth_manager,
            http_client,
            model_cache,
            resolver,
            config,
            metrics,
        })
    }

    /// The only provider this gateway currently drives requests through.
    /// `Store` has no provider registry table (only credential rows keyed
    /// by `provider_type`), so the list the distributor selects over is
    /// built here rather than persisted.
    pub fn providers(&self) -> Vec<ProviderInfo> {
        vec![ProviderInfo {
            name: KIRO_PROVIDER.to_string(),
            enabled: true,
            priority: 1,
            weight: 1,
            models: self.model_cache.get_all_model_ids(),
            total_requests: 0,
            success_rate: 1.0,
            avg_response_time_ms: 0.0,
        }]
    }
}
