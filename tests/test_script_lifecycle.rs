//! Script lifecycle through the orchestrator facade: concurrent attach
//! exclusivity, day-boundary code rotation, quota behavior.

use std::sync::Arc;

use econ_sim_core_rs::{
    registry::ScriptRegistry, sandbox::SandboxExecutor, store::StateStore, AgentKind, MemoryCache,
    Orchestrator, SimulationError, SqliteStore, WorldConfig,
};

const CODE: &str = "def generate_decisions(context):\n    return {}\n";

fn test_config() -> WorldConfig {
    let mut config = WorldConfig::default();
    config.simulation.ticks_per_day = 3;
    config.simulation.num_households = 3;
    config.simulation.global_rng_seed = 42;
    config.store.durable_retry_base_ms = 1;
    config
}

fn build_orchestrator(config: WorldConfig) -> Orchestrator {
    let cache = Arc::new(MemoryCache::new());
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let store = StateStore::new(cache, durable.clone(), config.store.clone());
    let registry = Arc::new(ScriptRegistry::new(Some(durable), None));
    let sandbox = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
    Orchestrator::new(config, store, registry, sandbox).unwrap()
}

#[tokio::test]
async fn test_concurrent_attach_exactly_one_winner() {
    let orch = Arc::new(build_orchestrator(test_config()));
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    // ten users, ten library scripts, all racing for household 000
    let mut scripts = Vec::new();
    for i in 0..10 {
        let user = format!("user-{i}");
        let meta = orch
            .register_script(&user, CODE, AgentKind::Household, Some("000".into()), None, None)
            .await
            .unwrap();
        scripts.push((user, meta.script_id));
    }

    let mut handles = Vec::new();
    for (user, script_id) in scripts {
        let orch = Arc::clone(&orch);
        handles.push(tokio::spawn(async move {
            orch.attach_script(&script_id, &user, "sim-1", None).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(SimulationError::ConflictingBinding(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 9);

    let bound = orch.list_simulation_scripts("sim-1").await.unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].entity_id, "000");
}

#[tokio::test]
async fn test_code_rotation_only_at_day_boundary() {
    let orch = build_orchestrator(test_config());
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    let meta = orch
        .register_script(
            "alice",
            CODE,
            AgentKind::Household,
            Some("000".into()),
            Some("sim-1".into()),
            None,
        )
        .await
        .unwrap();

    // mid-day (tick 2 of 3): rotation refused
    orch.run_tick("sim-1", None).await.unwrap();
    orch.run_tick("sim-1", None).await.unwrap();
    let err = orch
        .update_script_code(&meta.script_id, "alice", CODE, None)
        .await
        .unwrap_err();
    match err {
        SimulationError::NotAtDayBoundary { tick, .. } => assert_eq!(tick, 2),
        other => panic!("expected NotAtDayBoundary, got {other}"),
    }

    // at the boundary (tick 3): rotation succeeds and bumps the version
    orch.run_tick("sim-1", None).await.unwrap();
    let updated = orch
        .update_script_code(
            &meta.script_id,
            "alice",
            "def generate_decisions(context):\n    return {\"households\": {}}\n",
            None,
        )
        .await
        .unwrap();
    assert_ne!(updated.code_version, meta.code_version);
    assert_eq!(updated.entity_id, "000");
    assert_eq!(updated.simulation_id.as_deref(), Some("sim-1"));

    // entity state is preserved across the rotation
    let world = orch.get_state("sim-1").await.unwrap();
    assert!(world.households.contains_key("000"));
}

#[tokio::test]
async fn test_library_script_updates_any_time() {
    let orch = build_orchestrator(test_config());
    let meta = orch
        .register_script("alice", CODE, AgentKind::Household, Some("007".into()), None, None)
        .await
        .unwrap();
    // unbound: no day-boundary constraint applies
    let updated = orch
        .update_script_code(&meta.script_id, "alice", CODE, Some("v2".into()))
        .await
        .unwrap();
    assert_ne!(updated.code_version, meta.code_version);
    assert_eq!(updated.description.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_upload_validation_through_facade() {
    let orch = build_orchestrator(test_config());
    let err = orch
        .register_script(
            "alice",
            "import socket\n\ndef generate_decisions(context):\n    return {}\n",
            AgentKind::Firm,
            None,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SimulationError::InvalidScript(_)));
    assert_eq!(err.code(), 1001);
}

#[tokio::test]
async fn test_registry_state_survives_reopen_on_same_store() {
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(ScriptRegistry::new(Some(durable.clone()), None));

    let meta = registry
        .register_script(
            "alice",
            CODE,
            AgentKind::Household,
            Some("000".to_string()),
            Some("sim-1".to_string()),
            None,
        )
        .await
        .unwrap();

    // a second registry over the same durable store sees the binding
    let reopened = ScriptRegistry::new(Some(durable.clone()), None);
    let scripts = reopened.list_simulation_scripts("sim-1").await.unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].script_id, meta.script_id);

    // and refuses a conflicting registration
    let err = reopened
        .register_script(
            "bob",
            CODE,
            AgentKind::Household,
            Some("000".to_string()),
            Some("sim-1".to_string()),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        econ_sim_core_rs::RegistryError::ConflictingBinding { .. }
    ));
}
