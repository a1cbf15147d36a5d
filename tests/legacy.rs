use std::time::Duration;

use aqmp::legacy::{QemuMonitorProtocol, Wait};
use aqmp::mock::{MockScript, MockServer, ReplayServer, Transcript};
use aqmp::{Error, Runstate};

fn script() -> MockScript {
    MockScript::new()
        .reply_return("query-status", serde_json::json!({"status": "running"}))
        .reply_error("stop", "GenericError", "refused")
        .post_event(serde_json::json!({"event": "RESUME"}))
}

#[test]
fn blocking_round_trip() {
    // The mock peer lives on its own runtime; the wrapper brings its own.
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start_tcp(script())).unwrap();

    let qmp = QemuMonitorProtocol::new(server.endpoint(), false, Some("legacy".into())).unwrap();
    let greeting = qmp.connect(true).unwrap().expect("greeting");
    assert_eq!(greeting.qmp.version.qemu.major, 8);

    let status = qmp.command("query-status", None).unwrap();
    assert_eq!(status["status"], "running");

    let err = qmp.command("stop", None).unwrap_err();
    assert!(matches!(err, Error::Qmp { .. }), "{err:?}");

    let reply = qmp
        .cmd("query-status", None, Some(serde_json::json!("legacy-1")))
        .unwrap();
    assert_eq!(reply.get_str("id"), Some("legacy-1"));

    let event = qmp
        .pull_event(Wait::Timeout(Duration::from_secs(5)))
        .unwrap()
        .expect("RESUME");
    assert_eq!(event.event_name(), Some("RESUME"));
    assert!(qmp.pull_event(Wait::No).unwrap().is_none());
    assert!(qmp.get_events(false).unwrap().is_empty());

    let err = qmp
        .pull_event(Wait::Timeout(Duration::from_millis(20)))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");

    qmp.close().unwrap();
    assert_eq!(qmp.client().runstate(), Runstate::Idle);
    rt.block_on(server.shutdown());
}

#[test]
fn blocking_server_mode() {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut qmp = QemuMonitorProtocol::new(
        QemuMonitorProtocol::parse_address("127.0.0.1:0").unwrap(),
        true,
        None,
    )
    .unwrap();
    qmp.set_timeout(Some(Duration::from_secs(5)));
    let endpoint = qmp.client().server_endpoint().expect("listening");

    let server = {
        let _guard = rt.enter();
        MockServer::dial(endpoint, script())
    };

    let greeting = qmp.accept(Some(Duration::from_secs(5))).unwrap();
    assert!(greeting.has_capability("oob"));

    let events = qmp.get_events(Wait::Timeout(Duration::from_secs(5))).unwrap();
    assert_eq!(events.len(), 1);
    qmp.clear_events();

    qmp.close().unwrap();
    rt.block_on(server.shutdown());
}

fn silent_peer() -> Transcript {
    let lines = [
        r#"{"dir":"server","msg":{"QMP":{"version":{"qemu":{"major":9,"minor":0,"micro":0},"package":""},"capabilities":[]}}}"#,
        r#"{"dir":"client","msg":{"execute":"qmp_capabilities","id":"__qmp#00000"}}"#,
        r#"{"dir":"server","msg":{"return":{},"id":"__qmp#00000"}}"#,
        r#"{"dir":"client","msg":{"execute":"slow","id":"x"}}"#,
        r#"{"dir":"client","msg":{"execute":"query-status","id":"x"}}"#,
        r#"{"dir":"server","msg":{"return":{"status":"running"},"id":"x"}}"#,
        r#"{"dir":"client","msg":{"execute":"never"}}"#,
    ];
    Transcript::from_jsonl_str(&lines.join("\n")).unwrap()
}

#[test]
fn command_timeout_follows_set_timeout() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(ReplayServer::start_tcp(silent_peer())).unwrap();

    let mut qmp = QemuMonitorProtocol::new(server.endpoint(), false, None).unwrap();
    qmp.connect(true).unwrap();
    assert_eq!(qmp.client().default_timeout(), None);

    qmp.set_timeout(Some(Duration::from_millis(100)));
    let err = qmp
        .cmd("slow", None, Some(serde_json::json!("x")))
        .unwrap_err();
    assert!(
        matches!(err, Error::Timeout { timeout } if timeout == Duration::from_millis(100)),
        "{err:?}"
    );

    // The timed-out id is free again.
    qmp.set_timeout(Some(Duration::from_secs(5)));
    let reply = qmp
        .cmd("query-status", None, Some(serde_json::json!("x")))
        .unwrap();
    assert_eq!(reply.get_str("id"), Some("x"));

    qmp.close().unwrap();
    rt.block_on(server.shutdown());
}
