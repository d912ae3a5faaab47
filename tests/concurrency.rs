//! Racing callers against one database
use nfa_approval::{
    Action, ApprovalEngine, ChainError, MemberStatus, Request, RequestDraft, RequestStatus,
    UserId,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn engine(db: Arc<sled::Db>) -> anyhow::Result<ApprovalEngine> {
    Ok(ApprovalEngine::open(db)?)
}

fn started_request(
    engine: &ApprovalEngine,
    recommender: &UserId,
    approvers: &[UserId],
) -> anyhow::Result<Request> {
    let mut draft = RequestDraft::new()
        .set_recommender(recommender.clone())
        .set_subject("Scaffold hire extension");
    for approver in approvers {
        draft = draft.add_approver(approver.clone());
    }
    let request = engine.create_request(&"user_init".into(), draft)?;
    Ok(engine.recommender_act(&request.id, recommender, Action::Approve, None)?)
}

/// Two simultaneous approvals by the same actor: exactly one wins.
#[test]
fn double_approval_applies_once() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("race.db"))?);
    let engine = Arc::new(engine(db)?);

    let recommender = UserId::from("user_rec");
    let a = UserId::from("user_a");
    let b = UserId::from("user_b");

    for _ in 0..20 {
        let request = started_request(&engine, &recommender, &[a.clone(), b.clone()])?;
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                let request_id = request.id.clone();
                let a = a.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.approve_step(&request_id, &a, None)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("approver thread panicked"))
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one approval should commit");
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(ChainError::NotAuthorized { .. }))),
            "the loser should see that A is no longer active"
        );

        let chain = engine.store().load_chain(&request.id)?;
        chain.check_invariants()?;
        assert_eq!(chain.member_of(&a).map(|m| m.status), Some(MemberStatus::Approved));
        assert_eq!(chain.member_of(&b).map(|m| m.status), Some(MemberStatus::Pending));
        assert_eq!(engine.history(&request.id)?.len(), 3);
    }
    Ok(())
}

/// Transitions on different requests do not get in each other's way.
#[test]
fn independent_requests_progress_in_parallel() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("parallel.db"))?);
    let engine = Arc::new(engine(db)?);

    let recommender = UserId::from("user_rec");
    let approvers: Vec<UserId> = (0..3).map(|i| UserId::from(format!("user_{i}"))).collect();
    let requests = (0..8)
        .map(|_| started_request(&engine, &recommender, &approvers))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let handles: Vec<_> = requests
        .iter()
        .map(|request| {
            let engine = Arc::clone(&engine);
            let request_id = request.id.clone();
            let approvers = approvers.clone();
            thread::spawn(move || -> Result<Request, ChainError> {
                let mut last = None;
                for approver in &approvers {
                    last = Some(engine.approve_step(&request_id, approver, None)?);
                }
                last.ok_or(ChainError::RequestNotFound(request_id))
            })
        })
        .collect();

    for handle in handles {
        let request = handle.join().expect("worker panicked")?;
        assert_eq!(request.status, RequestStatus::Completed);
    }
    Ok(())
}

/// A removal racing an approval never leaves two members active.
#[test]
fn removal_racing_approval_keeps_one_active_member() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("remove.db"))?);
    let engine = Arc::new(engine(db)?);

    let recommender = UserId::from("user_rec");
    let chain: Vec<UserId> = ["user_a", "user_b", "user_c"].map(UserId::from).to_vec();

    for _ in 0..20 {
        let request = started_request(&engine, &recommender, &chain)?;
        let barrier = Arc::new(Barrier::new(2));

        let approve = {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let request_id = request.id.clone();
            let a = chain[0].clone();
            thread::spawn(move || {
                barrier.wait();
                engine.approve_step(&request_id, &a, None).map(|_| ())
            })
        };
        let remove = {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let request_id = request.id.clone();
            let b = chain[1].clone();
            thread::spawn(move || {
                barrier.wait();
                engine.remove_approver(&request_id, &b).map(|_| ())
            })
        };

        approve.join().expect("approve thread panicked")?;
        remove.join().expect("remove thread panicked")?;

        // whichever order they committed in, A is done and C is the one active member
        let stored = engine.store().load_chain(&request.id)?;
        stored.check_invariants()?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.active().map(|m| m.approver_id.clone()), Some(chain[2].clone()));
    }
    Ok(())
}
