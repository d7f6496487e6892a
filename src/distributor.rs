// Model -> provider selection. Candidates are every enabled provider that
// declares support for the requested model; the load balancer then picks
// one, weighted by priority/weight/health.

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub weight: i32,
    pub models: Vec<String>,
    pub total_requests: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
}

impl ProviderInfo {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    fn score(&self) -> f64 {
        let response_penalty = if self.avg_response_time_ms > 0.0 {
            self.avg_response_time_ms / 1000.0
        } else {
            0.0
        };
        let score = self.priority as f64 * 100.0 + self.weight as f64 * 10.0
            + self.success_rate * 5.0
            - response_penalty;
        score.max(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Weighted,
    Priority,
    LeastResponseTime,
    RoundRobin,
}

/// Picks one provider out of a candidate set. Stateless except for the
/// round-robin cursor, which is shared across calls via an atomic counter.
pub struct Distributor {
    strategy: Strategy,
    round_robin_index: std::sync::atomic::AtomicU64,
}

impl Distributor {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            round_robin_index: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Select a provider for `model` out of `providers`, per §4.6: filter to
    /// enabled providers that support the model, then apply the configured
    /// strategy. Returns a descriptive `NoProviderForModel`/`ValidationError`
    /// if nothing qualifies.
    pub fn select<'a>(
        &self,
        model: &str,
        providers: &'a [ProviderInfo],
    ) -> Result<&'a ProviderInfo, ApiError> {
        if model.is_empty() {
            return Err(ApiError::ValidationError("Model name is required".to_string()));
        }

        let supporting: Vec<&ProviderInfo> = providers.iter().filter(|p| p.supports_model(model)).collect();
        if supporting.is_empty() {
            return Err(ApiError::NoProviderForModel(format!(
                "No provider supports model: {model}"
            )));
        }

        let mut candidates: Vec<&ProviderInfo> = supporting.iter().filter(|p| p.enabled).copied().collect();
        if candidates.is_empty() {
            return Err(ApiError::NoProviderForModel(format!(
                "All providers supporting model '{model}' are disabled"
            )));
        }

        candidates.sort_by(|a, b| (b.priority, b.weight).cmp(&(a.priority, a.weight)));

        Ok(self.pick(&candidates))
    }

    fn pick<'a>(&self, candidates: &[&'a ProviderInfo]) -> &'a ProviderInfo {
        if candidates.len() == 1 {
            return candidates[0];
        }
        match self.strategy {
            Strategy::Priority => candidates[0],
            Strategy::RoundRobin => {
                let mut sorted = candidates.to_vec();
                sorted.sort_by_key(|p| p.total_requests);
                sorted[0]
            }
            Strategy::LeastResponseTime => {
                let with_data: Vec<&&ProviderInfo> = candidates.iter().filter(|p| p.total_requests > 0).collect();
                if with_data.is_empty() {
                    return self.weighted_random(candidates);
                }
                let mut sorted = with_data;
                sorted.sort_by(|a, b| {
                    a.avg_response_time_ms
                        .partial_cmp(&b.avg_response_time_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                sorted[0]
            }
            Strategy::Weighted => self.weighted_random(candidates),
        }
    }

    fn weighted_random<'a>(&self, candidates: &[&'a ProviderInfo]) -> &'a ProviderInfo {
        let scores: Vec<f64> = candidates.iter().map(|p| p.score()).collect();
        let total: f64 = scores.iter().sum();
        let mut r = rand::random::<f64>() * total;
        for (i, score) in scores.iter().enumerate() {
            r -= score;
            if r <= 0.0 {
                return candidates[i];
            }
        }
        candidates[candidates.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, enabled: bool, priority: i32, models: &[&str]) -> ProviderInfo {
        ProviderInfo {
            name: name.to_string(),
            enabled,
            priority,
            weight: 1,
            models: models.iter().map(|s| s.to_string()).collect(),
            total_requests: 0,
            success_rate: 1.0,
            avg_response_time_ms: 0.0,
        }
    }

    #[test]
    fn test_empty_model_is_rejected() {
        let dist = Distributor::new(Strategy::Priority);
        let providers = vec![provider("a", true, 1, &["x"])];
        assert!(matches!(
            dist.select("", &providers),
            Err(ApiError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_provider_supports_model() {
        let dist = Distributor::new(Strategy::Priority);
        let providers = vec![provider("a", true, 1, &["other"])];
        assert!(matches!(
            dist.select("gpt-4", &providers),
            Err(ApiError::NoProviderForModel(_))
        ));
    }

    #[test]
    fn test_disabled_providers_excluded() {
        let dist = Distributor::new(Strategy::Priority);
        let providers = vec![provider("a", false, 1, &["gpt-4"])];
        assert!(matches!(
            dist.select("gpt-4", &providers),
            Err(ApiError::NoProviderForModel(_))
        ));
    }

    #[test]
    fn test_priority_strategy_picks_highest_priority() {
        let dist = Distributor::new(Strategy::Priority);
        let providers = vec![
            provider("low", true, 1, &["gpt-4"]),
            provider("high", true, 5, &["gpt-4"]),
        ];
        let selected = dist.select("gpt-4", &providers).unwrap();
        assert_eq!(selected.name, "high");
    }

    #[test]
    fn test_single_candidate_shortcircuits() {
        let dist = Distributor::new(Strategy::Weighted);
        let providers = vec![provider("only", true, 1, &["gpt-4"])];
        let selected = dist.select("gpt-4", &providers).unwrap();
        assert_eq!(selected.name, "only");
    }

    #[test]
    fn test_round_robin_picks_least_used() {
        let dist = Distributor::new(Strategy::RoundRobin);
        let mut a = provider("a", true, 1, &["gpt-4"]);
        a.total_requests = 10;
        let b = provider("b", true, 1, &["gpt-4"]);
        let providers = vec![a, b];
        let selected = dist.select("gpt-4", &providers).unwrap();
        assert_eq!(selected.name, "b");
    }
}
