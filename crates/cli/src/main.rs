//! Runs one scripted generation job end to end and prints its status view.
//!
//! Usage: `contentforge [prompt...]`. `CONTENTFORGE_DEMO_BALANCE` sets the
//! starting token balance; the `CONTENTFORGE_*` pipeline variables apply.

use std::sync::Arc;

use anyhow::Context;

use contentforge_ai::ScriptedGenerator;
use contentforge_auth::Principal;
use contentforge_core::{AgencyId, CampaignId, ClientId, StepKind};
use contentforge_infra::{Pipeline, PipelineConfig, TokenLedger};
use contentforge_jobs::JobRequest;

const DEFAULT_BALANCE: u64 = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    contentforge_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let balance = match std::env::var("CONTENTFORGE_DEMO_BALANCE") {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("CONTENTFORGE_DEMO_BALANCE is not a number: {raw}"))?,
        Err(_) => DEFAULT_BALANCE,
    };
    let prompt = {
        let words: Vec<String> = std::env::args().skip(1).collect();
        if words.is_empty() {
            "Autumn launch for a neighbourhood coffee roastery".to_string()
        } else {
            words.join(" ")
        }
    };

    let generator = StepKind::ALL
        .iter()
        .fold(ScriptedGenerator::new(), |g, step| g.with_cost(*step, config.step_estimates.get(*step)));
    let pipeline = Pipeline::in_memory(config, Arc::new(generator));

    let agency = AgencyId::new();
    let principal = Principal::owner(agency);
    pipeline.ledger.credit(agency, balance)?;

    let request = JobRequest::full_pipeline(ClientId::new(), prompt).with_campaign(CampaignId::new());
    let job = pipeline.orchestrator.submit(&principal, request).await?;
    tracing::info!(job_id = %job.id, "demo job submitted");

    let job = pipeline.orchestrator.wait_for(&principal, job.id).await?;
    let view = pipeline.query.get_job_status(&principal, job.id)?;

    println!("{}", serde_json::to_string_pretty(&view)?);
    println!("remaining balance: {}", pipeline.ledger.balance_of(agency)?);
    Ok(())
}
