//! Subcommand handlers.

use anyhow::{Context as _, Result, bail};
use prosegate_core::config::{EXAMPLE_CONFIG, load_config};
use prosegate_core::{
    ContaminationFilter, EngineConfig, GenerationAttempt, ParameterAdvisor, ResultStore,
    WeightLearner, WeightVector,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{Commands, ConfigAction, WeightsAction};

/// Global options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub config_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    fn load_config(&self) -> Result<EngineConfig> {
        let overrides: Vec<(&str, toml::Value)> = self
            .store_path
            .iter()
            .map(|p| ("store.path", toml::Value::String(p.display().to_string())))
            .collect();
        load_config(self.config_path.as_deref(), &overrides).context("Failed to load configuration")
    }

    fn open_store(&self, config: &EngineConfig) -> Result<Arc<ResultStore>> {
        let path = config.store.resolve_path();
        tracing::debug!(path = %path.display(), "Opening result store");
        let store = ResultStore::open(&path)
            .with_context(|| format!("Failed to open result store at {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn learner(&self, config: &EngineConfig, store: &ResultStore) -> Result<WeightLearner> {
        WeightLearner::resume(config.learning.clone(), config.confidence.clone(), store)
            .context("Failed to load the persisted weight vector")
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

pub async fn handle_command(command: Commands, ctx: &Context) -> Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, ctx),
        Commands::Weights { action } => handle_weights(action, ctx).await,
        Commands::Recommend { subject, component } => handle_recommend(&subject, &component, ctx),
        Commands::Sweep => handle_sweep(ctx),
        Commands::Audit {
            subject,
            excluded_only,
            limit,
        } => handle_audit(subject.as_deref(), excluded_only, limit, ctx),
    }
}

fn handle_config(action: ConfigAction, ctx: &Context) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => init_config(&path, force),
        ConfigAction::Check => {
            let config = ctx.load_config()?;
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Configuration OK\n");
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Configuration file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created configuration at: {}", path.display());
    Ok(())
}

async fn handle_weights(action: WeightsAction, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store(&config)?;
    match action {
        WeightsAction::Show => {
            let learner = ctx.learner(&config, &store)?;
            let current = learner.current();
            ctx.emit(&*current, || describe_vector(&current))
        }
        WeightsAction::Recompute => {
            let learner = ctx.learner(&config, &store)?;
            let before = learner.current().version;
            let vector = learner.recompute(&store).context("Weight recomputation failed")?;
            if vector.version == before && !ctx.json {
                println!("Weights unchanged.");
            }
            ctx.emit(&*vector, || describe_vector(&vector))
        }
        WeightsAction::History { limit } => {
            let history = store.weight_history(limit)?;
            ctx.emit(&history, || {
                if history.is_empty() {
                    return "No weight vectors published yet.".to_string();
                }
                history
                    .iter()
                    .map(describe_vector)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        WeightsAction::Watch { interval } => {
            if interval == 0 {
                bail!("--interval must be at least 1 second");
            }
            let learner = Arc::new(ctx.learner(&config, &store)?);
            let cancel = CancellationToken::new();
            let handle = Arc::clone(&learner).spawn_periodic(
                Arc::clone(&store),
                Duration::from_secs(interval),
                cancel.clone(),
            );
            println!("Recomputing weights every {interval}s. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            cancel.cancel();
            handle.await.context("Periodic recompute task failed")?;
            let current = learner.current();
            ctx.emit(&*current, || describe_vector(&current))
        }
    }
}

fn handle_recommend(subject: &str, component: &str, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store(&config)?;
    let advisor = ParameterAdvisor::new(config.advisor, config.confidence, store);
    let rec = advisor
        .recommend(subject, component)
        .context("Failed to compute a recommendation")?;
    ctx.emit(&rec, || {
        let mut text = format!(
            "{subject}/{component}: {} (source: {}, confidence: {}, samples: {})",
            rec.parameters, rec.source, rec.confidence, rec.sample_size
        );
        if let Some(id) = rec.based_on {
            text.push_str(&format!("\n  based on attempt {id}"));
        }
        text
    })
}

fn handle_sweep(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store(&config)?;
    let report = ContaminationFilter::new(config.contamination)
        .sweep(&store)
        .context("Contamination sweep failed")?;
    ctx.emit(&report, || {
        let mut text = format!(
            "Examined {} qualifying attempts, excluded {}.",
            report.examined, report.newly_excluded
        );
        for (reason, count) in &report.by_reason {
            text.push_str(&format!("\n  {reason}: {count}"));
        }
        text
    })
}

fn handle_audit(
    subject: Option<&str>,
    excluded_only: bool,
    limit: usize,
    ctx: &Context,
) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store(&config)?;
    let audit = store.audit();
    let attempts = if excluded_only {
        let mut excluded = audit.excluded()?;
        if let Some(subject) = subject {
            excluded.retain(|a| a.subject_key == subject);
        }
        excluded
    } else {
        audit.attempts(subject)?
    };
    let skip = attempts.len().saturating_sub(limit);
    let attempts = attempts[skip..].to_vec();

    ctx.emit(&attempts, || {
        if attempts.is_empty() {
            return "No attempts found.".to_string();
        }
        attempts
            .iter()
            .map(describe_attempt)
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn describe_vector(v: &WeightVector) -> String {
    format!(
        "v{} detection={:.4} subjective={:.4} readability={:.4} (confidence: {}, samples: {}, updated: {})",
        v.version,
        v.weights.detection,
        v.weights.subjective,
        v.weights.readability,
        v.confidence,
        v.sample_size,
        v.last_updated.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn describe_attempt(a: &GenerationAttempt) -> String {
    let status = match &a.exclusion_reason {
        Some(reason) => format!("excluded: {reason}"),
        None if a.success => "accepted".to_string(),
        None => "rejected".to_string(),
    };
    format!(
        "{} {} {}/{} #{} composite={:.3} detection={:.1} ({}) subjective={:.2} readability={:.1} [{}]",
        a.created_at.format("%Y-%m-%d %H:%M:%S"),
        a.id,
        a.subject_key,
        a.component_type,
        a.attempt_number,
        a.composite_score,
        a.detection_score,
        a.detection_method,
        a.subjective_score,
        a.readability_score,
        status,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prosegate_core::{Confidence, DetectionMethod, ExclusionReason, GenerationParameters};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn context(dir: &TempDir) -> Context {
        let config_path = dir.path().join("prosegate.toml");
        std::fs::write(&config_path, EXAMPLE_CONFIG).unwrap();
        Context {
            config_path: Some(config_path),
            store_path: Some(dir.path().join("results.db")),
            json: false,
        }
    }

    fn attempt(subject: &str, detection: f64, method: DetectionMethod) -> GenerationAttempt {
        GenerationAttempt {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            subject_key: subject.into(),
            component_type: "description".into(),
            attempt_number: 1,
            parameters: GenerationParameters::new(1).with("temperature", 0.8),
            content: "text".into(),
            detection_score: detection,
            detection_method: method,
            subjective_score: 8.0,
            readability_score: 60.0,
            composite_score: 0.7,
            success: false,
            exclusion_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_config_init_writes_loadable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("prosegate.toml");
        init_config(&path, false).unwrap();

        let config = load_config(Some(&path), &[]).unwrap();
        assert_eq!(config.controller.max_attempts, 3);
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prosegate.toml");
        std::fs::write(&path, "# mine").unwrap();

        assert!(init_config(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");

        init_config(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXAMPLE_CONFIG);
    }

    #[test]
    fn test_store_override_is_applied() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let config = ctx.load_config().unwrap();
        assert_eq!(config.store.resolve_path(), dir.path().join("results.db"));
    }

    #[tokio::test]
    async fn test_sweep_annotates_store() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let config = ctx.load_config().unwrap();
        let store = ctx.open_store(&config).unwrap();

        let perfect = attempt("Aluminum", 100.0, DetectionMethod::Heuristic);
        store.insert(&perfect).unwrap();
        for score in [20.0, 55.0, 90.0] {
            store
                .insert(&attempt("Steel", score, DetectionMethod::Authoritative))
                .unwrap();
        }
        store
            .insert(&attempt("Copper", 75.0, DetectionMethod::Authoritative))
            .unwrap();

        handle_command(Commands::Sweep, &ctx).await.unwrap();

        let excluded = store.audit().excluded().unwrap();
        assert_eq!(excluded.len(), 4);
        let perfect_after = store.audit().get_attempt(perfect.id).unwrap().unwrap();
        assert_eq!(
            perfect_after.exclusion_reason,
            Some(ExclusionReason::SuspiciousPerfectScore)
        );
        assert_eq!(store.count_qualifying().unwrap(), 1);

        handle_command(
            Commands::Audit {
                subject: Some("Steel".into()),
                excluded_only: true,
                limit: 10,
            },
            &ctx,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_weights_recompute_below_minimum_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let config = ctx.load_config().unwrap();
        let store = ctx.open_store(&config).unwrap();
        for i in 0..12 {
            store
                .insert(&attempt(&format!("S{i}"), 80.0, DetectionMethod::Authoritative))
                .unwrap();
        }

        handle_command(
            Commands::Weights {
                action: WeightsAction::Recompute,
            },
            &ctx,
        )
        .await
        .unwrap();

        let latest = store.latest_weight_vector().unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.sample_size, 12);
        assert_eq!(latest.confidence, Confidence::Low);
        assert_eq!(latest.weights, config.learning.default_weights);
    }

    #[tokio::test]
    async fn test_recommend_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        ctx.json = true;
        handle_command(
            Commands::Recommend {
                subject: "Aluminum".into(),
                component: "description".into(),
            },
            &ctx,
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_describe_attempt_marks_exclusion() {
        let mut a = attempt("Steel", 100.0, DetectionMethod::Heuristic);
        a.exclusion_reason = Some(ExclusionReason::SuspiciousPerfectScore);
        let line = describe_attempt(&a);
        assert!(line.contains("Steel/description"));
        assert!(line.ends_with("[excluded: suspicious-perfect-score]"));
    }
}
