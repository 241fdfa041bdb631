mod common;

use std::time::Duration;

use tokio::sync::watch;

use common::{autostart, config, tick_line, Harness};
use finstream_core::core::Telemetry;
use finstream_core::sysbus::{AssetState, MarketState, SysEvent};

#[tokio::test(start_paused = true)]
async fn test_telemetry_tick_reports_engine_snapshot() {
    let mut h = Harness::start(config(vec![autostart("SPY")]));
    h.recorder.until("SPY", AssetState::Running).await;
    // Let the supervisor publish a view with the process in it.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut events = h.bus.subscribe("telemetry-test");
    let (_market_tx, market_rx) = watch::channel(Some(MarketState::AfterHours));
    let telemetry = Telemetry::new(
        h.arena.clone(),
        h.supervisor.clone(),
        h.dispatcher.clone(),
        market_rx,
        h.bus.clone(),
        Duration::from_secs(5),
    );

    let direct = telemetry.snapshot();
    assert_eq!(direct.market, Some(MarketState::AfterHours));
    assert_eq!(direct.assets.len(), 1);
    assert_eq!(direct.states.get("Running"), Some(&1));

    tokio::spawn(telemetry.run(h.shutdown.clone()));
    let payload = loop {
        match events.recv().await {
            Some(SysEvent::TelemetryTick(payload)) => break payload,
            Some(_) => continue,
            None => panic!("bus closed"),
        }
    };
    assert_eq!(payload["market"], "AfterHours");
    assert_eq!(payload["assets"][0]["id"], "SPY");
    assert_eq!(payload["assets"][0]["state"], "Running");
    assert_eq!(payload["ranking"]["sources"].as_array().map(Vec::len), Some(0));
    assert_eq!(payload["busDropped"], 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_payload_carries_ranking() {
    let mut h = Harness::start(config(vec![autostart("QQQ")]));
    h.recorder.until("QQQ", AssetState::Running).await;
    let now_ms = chrono::Utc::now().timestamp_millis();
    h.launcher.latest("QQQ").write_line(&tick_line("512.75", now_ms)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.arena.query().await.contains("QQQ"));

    let (_market_tx, market_rx) = watch::channel(None);
    let telemetry = Telemetry::new(
        h.arena.clone(),
        h.supervisor.clone(),
        h.dispatcher.clone(),
        market_rx,
        h.bus.clone(),
        Duration::from_secs(5),
    );

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.ranking.sources.len(), 1);
    assert_eq!(snapshot.degraded_count, snapshot.ranking.degraded_count);

    let payload = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(payload["ranking"]["sources"][0]["assetId"], "QQQ");
    assert_eq!(payload["ranking"]["sources"][0]["price"], "512.75");
    assert_eq!(payload["ranking"]["degradedCount"], 0);
    assert!(payload["market"].is_null());
    h.stop().await;
}
