//! End-to-end lifecycle coverage through the public supervisor API,
//! using short-lived shell commands in place of real tunnels.

use std::sync::Arc;
use std::time::Duration;

use tunneltop::config::Config;
use tunneltop::registry::TunnelHealth;
use tunneltop::supervisor::{reconcile, TunnelSupervisor};

const BASE: &str = r#"
[tunnel.alpha]
address = "127.0.0.1"
port = 1111
command = "sleep 30"
test_command = "echo ready"
test_command_result = "ready"
test_interval = 1000
test_timeout = 5

[tunnel.beta]
address = "127.0.0.1"
port = 2222
command = "sleep 30"
"#;

fn supervisor_with(config: &str) -> Arc<TunnelSupervisor> {
    TunnelSupervisor::new(Config::parse(config).unwrap())
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn tunnels_come_up_and_probe_to_up() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;
    assert!(sup.snapshot().iter().all(|row| row.live));

    sup.tick_once().await;
    wait_for(|| {
        sup.snapshot()
            .iter()
            .find(|row| row.name == "alpha")
            .is_some_and(|row| row.health == TunnelHealth::Up)
    })
    .await;

    let rows = sup.snapshot();
    let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
    assert_eq!(alpha.stdout, "ready");
    // beta has no test command and stays unknown
    let beta = rows.iter().find(|row| row.name == "beta").unwrap();
    assert_eq!(beta.health, TunnelHealth::Unknown);

    sup.shutdown().await;
}

#[tokio::test]
async fn restart_and_toggle_round_trip() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;

    sup.restart("alpha").await;
    let rows = sup.snapshot();
    assert!(rows.iter().find(|row| row.name == "alpha").unwrap().live);

    sup.toggle("alpha").await;
    let rows = sup.snapshot();
    let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
    assert!(!alpha.live);
    assert!(alpha.disabled);

    sup.toggle("alpha").await;
    let rows = sup.snapshot();
    let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
    assert!(alpha.live);
    assert!(!alpha.disabled);

    sup.shutdown().await;
}

#[tokio::test]
async fn stopped_tunnel_is_revived_by_the_next_tick() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;

    sup.stop("beta").await;
    assert!(!sup
        .snapshot()
        .iter()
        .find(|row| row.name == "beta")
        .unwrap()
        .live);

    sup.tick_once().await;
    let rows = sup.snapshot();
    assert!(rows.iter().find(|row| row.name == "beta").unwrap().live);

    sup.shutdown().await;
}

#[tokio::test]
async fn disabled_tunnel_is_exempt_from_revival() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;

    sup.toggle("beta").await;
    sup.tick_once().await;

    let rows = sup.snapshot();
    let beta = rows.iter().find(|row| row.name == "beta").unwrap();
    assert!(!beta.live);
    assert!(beta.disabled);

    sup.shutdown().await;
}

#[tokio::test]
async fn reconcile_applies_change_addition_and_removal() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;

    // alpha's command changes, beta disappears, gamma is new
    let new = Config::parse(
        r#"
[tunnel.alpha]
address = "127.0.0.1"
port = 1111
command = "sleep 60"
test_command = "echo ready"
test_command_result = "ready"
test_interval = 1000
test_timeout = 5

[tunnel.gamma]
address = "127.0.0.1"
port = 3333
command = "sleep 30"
test_command = "echo fresh"
test_command_result = "fresh"
test_interval = 1000
test_timeout = 5
"#,
    )
    .unwrap();
    reconcile::apply(&sup, new).await;

    let rows = sup.snapshot();
    let names: Vec<&str> = rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, ["alpha", "gamma"]);
    assert!(rows.iter().all(|row| row.live));

    // gamma's probe is due immediately
    sup.tick_once().await;
    wait_for(|| {
        sup.snapshot()
            .iter()
            .find(|row| row.name == "gamma")
            .is_some_and(|row| row.health == TunnelHealth::Up)
    })
    .await;

    sup.shutdown().await;
}

#[tokio::test]
async fn no_probes_run_after_shutdown() {
    let sup = supervisor_with(BASE);
    sup.start_all().await;
    sup.shutdown().await;

    sup.tick_once().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // alpha's probe was due at tick zero, but shutdown preempted it
    let rows = sup.snapshot();
    let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
    assert_eq!(alpha.health, TunnelHealth::Unknown);
}
