//! In-process load simulation.
//!
//! Registers one mock agent per type, submits a mixed batch of tasks and
//! drives them through assignment and completion until every task has
//! settled. Every fifth attempt fails so the retry and dead-letter paths
//! are exercised.

use coindaily_core::{CoinDailyError, CoinDailyResult};
use coindaily_orchestrator::{
    Agent, AgentConfig, AgentType, ContentGenerationPayload, MarketAnalysisPayload, MarketContext,
    ModerationPayload, Orchestrator, OrchestratorConfig, QualityReviewPayload,
    SentimentAnalysisPayload, SystemMetrics, Task, TaskOutcome, TaskPayload, TaskPriority,
    TaskResult, TaskStatus, TranslationPayload,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

const MAX_ROUNDS: usize = 1_000;
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Counts of what happened to the submitted tasks, plus final metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub submitted: usize,
    pub rejected: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub metrics: SystemMetrics,
}

/// Run the simulation against a fresh in-memory orchestrator.
pub async fn run(config: OrchestratorConfig, task_count: usize) -> CoinDailyResult<SimulationReport> {
    let priorities: Vec<(AgentType, Vec<TaskPriority>)> = AgentType::ALL
        .iter()
        .map(|t| {
            let levels = config
                .queue(*t)
                .map(|q| q.priority_levels.clone())
                .unwrap_or_default();
            (*t, levels)
        })
        .collect();
    let agent_configs: Vec<(AgentType, AgentConfig)> = AgentType::ALL
        .iter()
        .map(|t| {
            let agent_config = config
                .agents
                .get(t)
                .map(|pool| pool.config.clone())
                .unwrap_or_default();
            (*t, agent_config)
        })
        .collect();

    let orchestrator = Orchestrator::new(config)?;
    orchestrator.start().await?;

    for (agent_type, agent_config) in agent_configs {
        let agent = Agent::new(format!("{agent_type}-agent-1"), agent_type, agent_config)
            .with_capabilities(vec![agent_type.to_string()]);
        orchestrator.register_agent(agent).await?;
    }

    let mut report = SimulationReport {
        submitted: 0,
        rejected: 0,
        completed: 0,
        failed: 0,
        retried: 0,
        metrics: SystemMetrics::default(),
    };

    for i in 0..task_count {
        let (agent_type, levels) = &priorities[i % priorities.len()];
        let Some(priority) = levels.get(i % levels.len().max(1)).copied() else {
            report.rejected += 1;
            continue;
        };
        let task = Task::new(priority, sample_payload(*agent_type, i));
        match orchestrator.queue_task(task).await {
            Ok(_) => report.submitted += 1,
            Err(CoinDailyError::QueueSizeExceeded { .. } | CoinDailyError::PriorityNotAccepted { .. }) => {
                report.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(submitted = report.submitted, rejected = report.rejected, "Tasks submitted");

    let mut attempt: u64 = 0;
    for round in 0..MAX_ROUNDS {
        let mut progressed = false;
        for agent_type in AgentType::ALL {
            while let Some(assignment) = orchestrator.assign_task(agent_type).await? {
                progressed = true;
                attempt += 1;
                let processing_time_ms = 50 + (attempt % 10) * 25;
                let (status, result) = if attempt % 5 == 0 {
                    (
                        TaskStatus::Failed,
                        TaskResult::failure("Simulated agent processing error")
                            .with_processing_time(processing_time_ms),
                    )
                } else {
                    (
                        TaskStatus::Completed,
                        TaskResult::success(serde_json::json!({
                            "agent_id": assignment.agent_id,
                            "attempt": attempt,
                        }))
                        .with_processing_time(processing_time_ms),
                    )
                };
                let outcome = orchestrator
                    .update_task_status(&assignment.task.id, status, Some(result))
                    .await?;
                match outcome {
                    Some(TaskOutcome::Completed) => report.completed += 1,
                    Some(TaskOutcome::Requeued { .. }) => report.retried += 1,
                    Some(TaskOutcome::DeadLettered | TaskOutcome::Discarded) => report.failed += 1,
                    None => {}
                }
            }
        }

        if report.completed + report.failed >= report.submitted {
            debug!(rounds = round + 1, "Simulation settled");
            break;
        }
        if !progressed {
            // Remaining tasks are waiting out their retry backoff.
            tokio::time::sleep(IDLE_WAIT).await;
        }
    }

    report.metrics = orchestrator.get_system_metrics().await;
    orchestrator.shutdown().await?;
    Ok(report)
}

fn sample_context(i: usize) -> Option<MarketContext> {
    let (region, country, timezone, provider) = match i % 3 {
        0 => ("west", "Nigeria", "Africa/Lagos", "OPay"),
        1 => ("east", "Kenya", "Africa/Nairobi", "M-Pesa"),
        _ => ("south", "South Africa", "Africa/Johannesburg", "SnapScan"),
    };
    Some(MarketContext {
        region: region.to_string(),
        countries: vec![country.to_string()],
        languages: vec!["en".to_string()],
        exchanges: vec!["Luno".to_string(), "Quidax".to_string()],
        mobile_money_providers: vec![provider.to_string()],
        timezone: timezone.to_string(),
        cultural_context: Default::default(),
    })
}

fn sample_payload(agent_type: AgentType, i: usize) -> TaskPayload {
    let market_context = sample_context(i);
    match agent_type {
        AgentType::ContentGeneration => TaskPayload::ContentGeneration(ContentGenerationPayload {
            topic: format!("Market update #{i}"),
            target_languages: vec!["en".into(), "sw".into()],
            content_type: "article".into(),
            keywords: vec!["bitcoin".into(), "stablecoins".into()],
            market_context,
        }),
        AgentType::MarketAnalysis => TaskPayload::MarketAnalysis(MarketAnalysisPayload {
            symbols: vec!["BTC".into(), "ETH".into(), "USDT".into()],
            exchanges: vec!["Binance".into(), "Luno".into()],
            analysis_type: "price_movement".into(),
            time_range: None,
            market_context,
        }),
        AgentType::QualityReview => TaskPayload::QualityReview(QualityReviewPayload {
            content_id: format!("content-{i}"),
            content: "Bitcoin adoption grows across mobile money corridors.".into(),
            content_type: "article".into(),
            review_criteria: vec!["accuracy".into(), "bias".into()],
            requires_fact_check: i % 2 == 0,
            market_context,
        }),
        AgentType::Translation => TaskPayload::Translation(TranslationPayload {
            content_id: Some(format!("content-{i}")),
            text: "Bitcoin price rises above key resistance".into(),
            source_language: "en".into(),
            target_languages: vec!["sw".into(), "yo".into(), "ha".into()],
            market_context,
        }),
        AgentType::SentimentAnalysis => {
            TaskPayload::SentimentAnalysis(SentimentAnalysisPayload {
                content: "Traders are optimistic about the new exchange listing.".into(),
                market_context,
            })
        }
        AgentType::Moderation => TaskPayload::Moderation(ModerationPayload {
            content: "Guaranteed 10x returns, send funds now!".into(),
            rules: vec!["spam_detection".into(), "scam_detection".into()],
            market_context,
        }),
    }
}
