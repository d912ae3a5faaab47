//! Property-based tests for the approval chain transitions
//!
//! Random sequences of activate / approve / reject / insert / remove are
//! thrown at a chain, first directly and then through the engine and its
//! store. Whatever the sequence, the structural invariants must hold after
//! every step, and a refused operation must leave the chain exactly as it
//! was.

use nfa_approval::{
    Action, ApprovalEngine, Chain, ChainError, MemberStatus, RequestDraft, RequestStatus,
    SledDirectory, TimeStamp, UserId, store::ChainStore,
};
use proptest::prelude::*;
use std::sync::Arc;

const POOL: [&str; 6] = ["user_a", "user_b", "user_c", "user_d", "user_e", "user_f"];

#[derive(Debug, Clone)]
enum Op {
    Activate,
    /// Approve by whoever is active.
    ApproveActive,
    Approve(usize),
    Reject(usize),
    Insert(usize, u32),
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Activate),
        3 => Just(Op::ApproveActive),
        1 => (0..POOL.len()).prop_map(Op::Approve),
        1 => (0..POOL.len()).prop_map(Op::Reject),
        2 => (0..POOL.len(), 0u32..8).prop_map(|(who, at)| Op::Insert(who, at)),
        1 => (0..POOL.len()).prop_map(Op::Remove),
    ]
}

fn user(index: usize) -> UserId {
    UserId::from(POOL[index])
}

fn initial_chain(len: usize) -> Chain {
    let approvers: Vec<UserId> = (0..len).map(user).collect();
    Chain::from_approvers("nfa_prop".into(), &approvers).expect("pool has no duplicates")
}

fn apply(chain: &mut Chain, op: &Op) -> Result<(), ChainError> {
    let now = TimeStamp::new();
    match op {
        Op::Activate => {
            chain.activate_first(&now);
            Ok(())
        }
        Op::ApproveActive => match chain.active().map(|m| m.approver_id.clone()) {
            Some(active) => chain.approve(&active, None, &now).map(|_| ()),
            None => Ok(()),
        },
        Op::Approve(who) => chain.approve(&user(*who), None, &now).map(|_| ()),
        Op::Reject(who) => chain.reject(&user(*who), None, &now).map(|_| ()),
        Op::Insert(who, at) => chain.insert(user(*who), *at, &now).map(|_| ()),
        Op::Remove(who) => chain.remove(&user(*who), &now).map(|_| ()),
    }
}

fn pending_count(chain: &Chain) -> usize {
    chain
        .members()
        .iter()
        .filter(|m| m.status == MemberStatus::Pending)
        .count()
}

proptest! {
    /// Property: positions stay 1..N and at most one member is Pending after any sequence
    #[test]
    fn prop_invariants_hold_after_every_step(
        len in 0usize..=4,
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let mut chain = initial_chain(len);

        for op in &ops {
            let _ = apply(&mut chain, op);

            prop_assert!(chain.check_invariants().is_ok(), "invariants broken after {:?}", op);
            prop_assert!(pending_count(&chain) <= 1, "more than one Pending after {:?}", op);
            let positions: Vec<u32> = chain.members().iter().map(|m| m.position).collect();
            let expected: Vec<u32> = (1..=chain.len() as u32).collect();
            prop_assert_eq!(positions, expected, "positions not contiguous after {:?}", op);
        }
    }

    /// Property: a refused operation leaves the chain untouched
    #[test]
    fn prop_refused_operations_change_nothing(
        len in 0usize..=4,
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let mut chain = initial_chain(len);

        for op in &ops {
            let before = chain.clone();
            if apply(&mut chain, op).is_err() {
                prop_assert_eq!(&chain, &before, "{:?} failed but changed the chain", op);
            }
        }
    }

    /// Property: started and completed timestamps follow the member status
    #[test]
    fn prop_timestamps_track_status(
        len in 0usize..=4,
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let mut chain = initial_chain(len);
        for op in &ops {
            let _ = apply(&mut chain, op);
        }

        for member in chain.members() {
            match member.status {
                MemberStatus::Waiting => {
                    prop_assert!(member.started.is_none() && member.completed.is_none());
                }
                MemberStatus::Pending => {
                    prop_assert!(member.started.is_some() && member.completed.is_none());
                }
                MemberStatus::Approved | MemberStatus::Rejected | MemberStatus::Complete => {
                    prop_assert!(member.started.is_some() && member.completed.is_some());
                }
            }
        }
    }

    /// Property: approving in order walks the whole chain and only the last member is Complete
    #[test]
    fn prop_approving_everyone_exhausts_the_chain(len in 1usize..=6) {
        let mut chain = initial_chain(len);
        chain.activate_first(&TimeStamp::new());

        for index in 0..len {
            prop_assert!(!chain.is_exhausted());
            let advance = chain.approve(&user(index), None, &TimeStamp::new());
            prop_assert!(advance.is_ok());
        }

        prop_assert!(chain.is_exhausted());
        prop_assert_eq!(chain.members()[len - 1].status, MemberStatus::Complete);
        prop_assert!(chain.members()[..len - 1].iter().all(|m| m.status == MemberStatus::Approved));
    }
}

#[derive(Debug, Clone)]
enum EngineOp {
    Recommender(Action),
    Gate(usize, Action),
    Insert(usize, u32),
    Remove(usize),
}

fn engine_op_strategy() -> impl Strategy<Value = EngineOp> {
    let action = prop_oneof![4 => Just(Action::Approve), 1 => Just(Action::Reject)];
    prop_oneof![
        1 => action.clone().prop_map(EngineOp::Recommender),
        4 => (0..POOL.len(), action).prop_map(|(who, a)| EngineOp::Gate(who, a)),
        1 => (0..POOL.len(), 0u32..8).prop_map(|(who, at)| EngineOp::Insert(who, at)),
        1 => (0..POOL.len()).prop_map(EngineOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: stored state stays consistent through the engine, and terminal requests stay put
    #[test]
    fn prop_engine_keeps_request_and_chain_consistent(
        len in 0usize..=4,
        ops in prop::collection::vec(engine_op_strategy(), 0..25),
    ) {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(sled::open(temp_dir.path().join("prop.db")).expect("open db"));
        let directory = SledDirectory::new(&db).expect("directory");
        let engine = ApprovalEngine::new(ChainStore::new(db).expect("store"), Arc::new(directory));

        let recommender = UserId::from("user_rec");
        let mut draft = RequestDraft::new()
            .set_recommender(recommender.clone())
            .set_subject("Generator refuel");
        for index in 0..len {
            draft = draft.add_approver(user(index));
        }
        let request = engine.create_request(&"user_init".into(), draft).expect("create");

        let mut applied = 1;
        for op in &ops {
            let before = engine.get_request(&request.id).expect("load").status;
            let res = match op {
                EngineOp::Recommender(action) => engine
                    .recommender_act(&request.id, &recommender, *action, None)
                    .map(|_| ()),
                EngineOp::Gate(who, action) => engine
                    .approve_or_reject(&request.id, &user(*who), *action, None)
                    .map(|_| ()),
                EngineOp::Insert(who, at) => engine
                    .insert_approver(&request.id, &user(*who), *at)
                    .map(|_| ()),
                EngineOp::Remove(who) => engine
                    .remove_approver(&request.id, &user(*who))
                    .map(|_| ()),
            };
            if res.is_ok() {
                applied += 1;
            }

            let stored = engine.get_request(&request.id).expect("load");
            let chain = engine.store().load_chain(&request.id).expect("chain");
            prop_assert!(chain.check_invariants().is_ok(), "invariants broken after {:?}", op);
            if before.is_terminal() {
                prop_assert!(res.is_err(), "{:?} succeeded on a {} request", op, before);
                prop_assert_eq!(stored.status, before);
            }
            if stored.status == RequestStatus::Initiated {
                prop_assert!(chain.active().is_some(), "Initiated without an active member");
            }
        }

        let history = engine.history(&request.id).expect("history");
        prop_assert_eq!(history.len(), applied, "one history entry per committed transition");
        prop_assert!(history.verify().is_ok());
    }
}
