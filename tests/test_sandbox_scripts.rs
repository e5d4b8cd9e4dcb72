//! End-to-end script execution through real sandbox workers.
//!
//! These tests spawn Python interpreter subprocesses; they skip
//! themselves on machines without `python3` on the PATH.

use std::sync::Arc;

use econ_sim_core_rs::{
    registry::ScriptRegistry, sandbox::SandboxExecutor, store::StateStore, AgentKind, MemoryCache,
    Orchestrator, SqliteStore, WorldConfig,
};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn test_config() -> WorldConfig {
    let mut config = WorldConfig::default();
    config.simulation.ticks_per_day = 3;
    config.simulation.num_households = 2;
    config.simulation.global_rng_seed = 42;
    config.sandbox.script_timeout_seconds = 0.75;
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
async fn test_script_override_reaches_world_state() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let orch = build_orchestrator(test_config());
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    let code = "def generate_decisions(context):\n    return {\"firm\": {\"price\": 42.0}}\n";
    orch.register_script("bob", code, AgentKind::Firm, None, Some("sim-1".into()), None)
        .await
        .unwrap();

    let result = orch.run_tick("sim-1", None).await.unwrap();
    assert_eq!(result.script_failures, 0);

    let world = orch.get_state("sim-1").await.unwrap();
    assert_eq!(world.firm.price, 42.0);
}

#[tokio::test]
async fn test_timeout_script_falls_back_and_tick_completes() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let orch = build_orchestrator(test_config());
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    // spins past the 0.75s wall-clock budget
    let code = "def generate_decisions(context):\n    while True:\n        pass\n";
    orch.register_script(
        "mallory",
        code,
        AgentKind::Household,
        Some("000".into()),
        Some("sim-1".into()),
        None,
    )
    .await
    .unwrap();

    let result = orch.run_tick("sim-1", None).await.unwrap();
    assert_eq!(result.new_tick, 1);
    assert_eq!(result.script_failures, 1);

    let failure = result
        .logs
        .iter()
        .find(|l| l.message == "script_failure")
        .expect("script failure logged");
    assert_eq!(failure.context["kind"], "Timeout");
    assert_eq!(failure.context["entity_id"], "000");

    // the next tick proceeds normally as well
    let result = orch.run_tick("sim-1", None).await.unwrap();
    assert_eq!(result.new_tick, 2);
}

#[tokio::test]
async fn test_invalid_return_shape_falls_back() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let orch = build_orchestrator(test_config());
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    let code =
        "def generate_decisions(context):\n    return {\"firm\": {\"sabotage\": true}}\n";
    // `true` is invalid python; use a runtime-valid but schema-invalid dict
    let code = code.replace("true", "True");
    orch.register_script("bob", &code, AgentKind::Firm, None, Some("sim-1".into()), None)
        .await
        .unwrap();

    let result = orch.run_tick("sim-1", None).await.unwrap();
    assert_eq!(result.script_failures, 1);
    let failure = result
        .logs
        .iter()
        .find(|l| l.message == "script_failure")
        .unwrap();
    assert_eq!(failure.context["kind"], "InvalidReturn");
}

#[tokio::test]
async fn test_household_script_sees_only_itself() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let orch = build_orchestrator(test_config());
    orch.create_simulation(Some("sim-1".into()), None, None)
        .await
        .unwrap();

    // raises if the trimmed context leaks the households map
    let code = concat!(
        "def generate_decisions(context):\n",
        "    ws = context[\"world_state\"]\n",
        "    if \"households\" in ws:\n",
        "        raise RuntimeError(\"visibility leak\")\n",
        "    if context[\"entity_state\"][\"id\"] != context[\"entity_id\"]:\n",
        "        raise RuntimeError(\"wrong entity\")\n",
        "    return {\"households\": {context[\"entity_id\"]: {\"savings_rate\": 0.5}}}\n",
    );
    orch.register_script(
        "alice",
        code,
        AgentKind::Household,
        Some("000".into()),
        Some("sim-1".into()),
        None,
    )
    .await
    .unwrap();

    let result = orch.run_tick("sim-1", None).await.unwrap();
    assert_eq!(result.script_failures, 0);
}

#[tokio::test]
async fn test_deterministic_replay_with_scripts() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let code = concat!(
        "import math\n",
        "def generate_decisions(context):\n",
        "    tick = context[\"world_state\"][\"tick\"]\n",
        "    price = 10.0 + math.sin(tick) * 2.0\n",
        "    return {\"firm\": {\"price\": price}}\n",
    );

    let mut worlds = Vec::new();
    for _ in 0..2 {
        let orch = build_orchestrator(test_config());
        orch.create_simulation(Some("replay".into()), None, None)
            .await
            .unwrap();
        orch.register_script("bob", code, AgentKind::Firm, None, Some("replay".into()), None)
            .await
            .unwrap();
        for _ in 0..4 {
            orch.run_tick("replay", None).await.unwrap();
        }
        let world = orch.get_state("replay").await.unwrap();
        worlds.push(serde_json::to_string(&world).unwrap());
    }
    assert_eq!(worlds[0], worlds[1]);
}
