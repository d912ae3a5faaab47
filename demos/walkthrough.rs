//! Walks one request through its recommender and a three member chain.
//!
//! Reads `nfa.toml` from the working directory when present, otherwise runs
//! against a throwaway database.
use nfa_approval::{
    Action, ApprovalEngine, EngineConfig, Priority, RequestDraft, SledDirectory, telemetry,
};
use std::path::Path;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let config_path = Path::new("nfa.toml");
    let scratch = tempfile::tempdir()?;
    let config = if config_path.exists() {
        EngineConfig::from_file(config_path)?
    } else {
        EngineConfig {
            db_path: scratch.path().join("walkthrough.db"),
            ..EngineConfig::default()
        }
    };
    telemetry::init_tracing(&config.log_filter)?;

    let db = config.open_db()?;
    // same trees the engine resolves users and sessions from
    let directory = SledDirectory::new(&db)?;
    let engine = ApprovalEngine::with_config(Arc::clone(&db), &config)?;

    let initiator = directory.register_user("Priya (site engineer)")?;
    let recommender = directory.register_user("Tomasz (project manager)")?;
    let approvers = [
        directory.register_user("Anna (finance)")?,
        directory.register_user("Ben (procurement)")?,
        directory.register_user("Chidi (director)")?,
    ];

    let mut draft = RequestDraft::new()
        .set_recommender(recommender.clone())
        .set_subject("Replace tower crane slewing ring")
        .set_description("Bearing wear found in the weekly inspection")
        .set_priority(Priority::Urgent)
        .set_project(42);
    for approver in &approvers[..2] {
        draft = draft.add_approver(approver.clone());
    }
    let request = engine.create_request(&initiator, draft)?;

    let session = directory.open_session(&recommender)?;
    engine.act_with_session(&session, &request.id, Action::Approve, None)?;

    // the director joins the chain late
    engine.insert_approver(&request.id, &approvers[2], 3)?;

    for approver in &approvers {
        let token = directory.open_session(approver)?;
        let receipt = engine.act_with_session(
            &token,
            &request.id,
            Action::Approve,
            Some("ok".to_string()),
        )?;
        println!("{:?} acted, request is {}", receipt.role, receipt.request.status);
    }

    for view in engine.get_chain(&request.id)? {
        println!(
            "{}. {} {}",
            view.member.position,
            view.approver_name.as_deref().unwrap_or("?"),
            view.member.status
        );
    }

    engine.verify_history(&request.id)?;
    print!("{}", engine.history(&request.id)?);

    Ok(())
}
