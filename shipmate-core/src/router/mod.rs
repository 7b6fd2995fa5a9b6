//! Natural-language router — decides whether inbound text is a structured
//! command, needs the costly intent classifier, or passes through to the
//! conversational handler.
//!
//! Resolution is layered: the synchronous pattern layer first, then the
//! passthrough guards, and only for genuinely ambiguous text the bounded
//! classifier call, fronted by an LRU+TTL cache. Classifier failure or
//! deadline always degrades to passthrough; the router never makes a
//! message undeliverable.

mod cache;
mod patterns;

pub use cache::ClassificationCache;
pub use patterns::{guard, GuardVerdict, PatternLayer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapters::{Classification, ProviderAdapter};
use crate::config::{ConfidenceWeights, RouterConfig};
use crate::error::RouterError;
use crate::persistence;
use crate::registry::ChatContext;

/// The router's verdict for one message.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// A canonical command string for the skill runtime's pattern index.
    Command(String),
    /// A classifier verdict for skills that act on intents.
    Classified(Classification),
    /// Hand to the free-form conversational handler untouched.
    Passthrough,
}

/// Snapshot of the live tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterTunables {
    pub ambiguity_threshold: f64,
    pub clarification_threshold: f64,
    pub ai_timeout_ms: u64,
    pub cache_max_size: usize,
    pub cache_max_age_ms: u64,
    pub weights: ConfidenceWeights,
}

/// Counter snapshot plus derived rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub pattern_hits: u64,
    pub ai_hits: u64,
    pub passthroughs: u64,
    pub cache_hits: u64,
    pub total: u64,
    pub cache_hit_rate: f64,
    pub pattern_rate: f64,
    pub learned_patterns: usize,
}

/// One externally supplied correction, kept as telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub original_intent: String,
    pub corrected: String,
    pub at: DateTime<Utc>,
}

/// The natural-language router.
pub struct NLRouter {
    patterns: PatternLayer,
    classifier: Option<Arc<dyn ProviderAdapter>>,
    cache: Mutex<ClassificationCache>,
    tunables: RwLock<RouterTunables>,
    corrections: Mutex<Vec<Correction>>,
    corrections_path: Option<std::path::PathBuf>,

    pattern_hits: AtomicU64,
    ai_hits: AtomicU64,
    passthroughs: AtomicU64,
    cache_hits: AtomicU64,
    total: AtomicU64,
}

impl NLRouter {
    pub fn new(config: &RouterConfig, classifier: Option<Arc<dyn ProviderAdapter>>) -> Self {
        Self {
            patterns: PatternLayer::with_defaults(),
            classifier,
            cache: Mutex::new(ClassificationCache::new(
                config.cache_max_size,
                Duration::from_millis(config.cache_max_age_ms),
            )),
            tunables: RwLock::new(RouterTunables {
                ambiguity_threshold: config.ambiguity_threshold,
                clarification_threshold: config.clarification_threshold,
                ai_timeout_ms: config.ai_timeout_ms,
                cache_max_size: config.cache_max_size,
                cache_max_age_ms: config.cache_max_age_ms,
                weights: config.weights.clone(),
            }),
            corrections: Mutex::new(Vec::new()),
            corrections_path: None,
            pattern_hits: AtomicU64::new(0),
            ai_hits: AtomicU64::new(0),
            passthroughs: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Persist corrections to a sidecar file (loaded back at startup).
    pub fn with_corrections_path(mut self, path: std::path::PathBuf) -> Self {
        if let Ok(saved) = persistence::load_json_or_default::<Vec<Correction>>(&path) {
            *self.corrections.lock().expect("corrections lock poisoned") = saved;
        }
        self.corrections_path = Some(path);
        self
    }

    /// Route one message.
    pub async fn route(&self, text: &str, ctx: &ChatContext) -> RouteDecision {
        self.total.fetch_add(1, Ordering::Relaxed);

        // Layer 1: the pattern layer, synchronous and free.
        if let Some(command) = self.patterns.resolve(text) {
            self.pattern_hits.fetch_add(1, Ordering::Relaxed);
            debug!(command, "pattern layer resolved");
            return RouteDecision::Command(command);
        }

        // Layer 2: the guards.
        match guard(text) {
            GuardVerdict::Command => {
                self.pattern_hits.fetch_add(1, Ordering::Relaxed);
                return RouteDecision::Command(text.trim().to_string());
            }
            GuardVerdict::Passthrough => {
                self.passthroughs.fetch_add(1, Ordering::Relaxed);
                return RouteDecision::Passthrough;
            }
            GuardVerdict::Ambiguous => {}
        }

        // Layer 3: cache, then the bounded classifier.
        let key = ClassificationCache::key(text, ctx.repo.as_deref());
        if let Some(hit) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return RouteDecision::Classified(hit);
        }

        let Some(classifier) = self.classifier.clone() else {
            self.passthroughs.fetch_add(1, Ordering::Relaxed);
            return RouteDecision::Passthrough;
        };

        let (timeout_ms, thresholds) = {
            let t = self.tunables.read().expect("tunables lock poisoned");
            (t.ai_timeout_ms, t.clone())
        };
        let context = serde_json::json!({
            "repo": ctx.repo,
            "company": ctx.company,
            "hq": ctx.hq,
        });

        let verdict = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            classifier.classify(text, &context),
        )
        .await;

        match verdict {
            Ok(Ok(mut classification)) => {
                self.ai_hits.fetch_add(1, Ordering::Relaxed);
                self.apply_thresholds(&mut classification, &thresholds);
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .insert(key, classification.clone());
                RouteDecision::Classified(classification)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "classifier failed, degrading to passthrough");
                self.passthroughs.fetch_add(1, Ordering::Relaxed);
                RouteDecision::Passthrough
            }
            Err(_) => {
                warn!(timeout_ms, "classifier deadline reached, degrading to passthrough");
                self.passthroughs.fetch_add(1, Ordering::Relaxed);
                RouteDecision::Passthrough
            }
        }
    }

    /// Recompose confidence from the reported factors and flag ambiguity
    /// and clarification per the live thresholds.
    fn apply_thresholds(&self, c: &mut Classification, t: &RouterTunables) {
        let factors = &c.confidence_factors;
        if !factors.is_empty() {
            let w = &t.weights;
            let composed = w.keyword_match * factors.get("keyword_match").copied().unwrap_or(0.0)
                + w.context_match * factors.get("context_match").copied().unwrap_or(0.0)
                + w.history_match * factors.get("history_match").copied().unwrap_or(0.0)
                + w.specificity * factors.get("specificity").copied().unwrap_or(0.0);
            c.confidence = composed.clamp(0.0, 1.0);
        }
        if c.confidence < t.ambiguity_threshold {
            c.ambiguous = true;
        }
        if c.confidence < t.clarification_threshold && c.clarifying_questions.is_empty() {
            c.clarifying_questions.push(format!(
                "I'm not sure what you meant by \"{}\" — which project is this about?",
                c.intent
            ));
        }
    }

    /// Set a live tunable by its chat-surface name.
    pub fn set_tunable(&self, param: &str, value: f64) -> Result<(), RouterError> {
        let mut t = self.tunables.write().expect("tunables lock poisoned");
        match param {
            "ambiguity" => {
                validate_range(param, value, 0.0, 1.0)?;
                t.ambiguity_threshold = value;
            }
            "clarification" => {
                validate_range(param, value, 0.0, 1.0)?;
                t.clarification_threshold = value;
            }
            "ai-timeout" => {
                validate_range(param, value, 500.0, 30_000.0)?;
                t.ai_timeout_ms = value as u64;
            }
            "cache-ttl" => {
                validate_range(param, value, 0.0, 3_600_000.0)?;
                t.cache_max_age_ms = value as u64;
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .reconfigure(t.cache_max_size, Duration::from_millis(t.cache_max_age_ms));
            }
            "cache-size" => {
                validate_range(param, value, 10.0, 10_000.0)?;
                t.cache_max_size = value as usize;
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .reconfigure(t.cache_max_size, Duration::from_millis(t.cache_max_age_ms));
            }
            other => {
                return Err(RouterError::InvalidTunable {
                    param: other.to_string(),
                    message: "expected ambiguity, clarification, ai-timeout, cache-ttl, or cache-size"
                        .into(),
                })
            }
        }
        Ok(())
    }

    /// Current tunables.
    pub fn tunables(&self) -> RouterTunables {
        self.tunables.read().expect("tunables lock poisoned").clone()
    }

    /// Counter snapshot with derived rates.
    pub fn metrics(&self) -> RouterMetrics {
        let pattern_hits = self.pattern_hits.load(Ordering::Relaxed);
        let ai_hits = self.ai_hits.load(Ordering::Relaxed);
        let passthroughs = self.passthroughs.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        RouterMetrics {
            pattern_hits,
            ai_hits,
            passthroughs,
            cache_hits,
            total,
            cache_hit_rate: rate(cache_hits),
            pattern_rate: rate(pattern_hits),
            learned_patterns: self.corrections.lock().expect("corrections lock poisoned").len(),
        }
    }

    /// Number of live cache entries.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").len()
    }

    /// Drop every cached classification.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    /// Record an externally supplied correction. Telemetry only: the count
    /// feeds metrics, and the log is saved for offline tuning. Never on
    /// the request path.
    pub fn record_correction(&self, original_intent: &str, corrected: &str) {
        let correction = Correction {
            original_intent: original_intent.to_string(),
            corrected: corrected.to_string(),
            at: Utc::now(),
        };
        let snapshot = {
            let mut corrections = self.corrections.lock().expect("corrections lock poisoned");
            corrections.push(correction);
            self.corrections_path.as_ref().map(|_| corrections.clone())
        };
        if let (Some(path), Some(list)) = (&self.corrections_path, snapshot) {
            if let Err(e) = persistence::save_json(path, &list) {
                warn!(error = %e, "failed to persist corrections");
            }
        }
    }
}

fn validate_range(param: &str, value: f64, min: f64, max: f64) -> Result<(), RouterError> {
    if !value.is_finite() || value < min || value > max {
        return Err(RouterError::InvalidTunable {
            param: param.to_string(),
            message: format!("{value} outside [{min}, {max}]"),
        });
    }
    Ok(())
}
