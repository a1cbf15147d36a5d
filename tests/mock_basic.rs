use std::time::Duration;

use aqmp::mock::{MockScript, MockServer};
use aqmp::types::Event;
use aqmp::{CallOptions, CancelToken, Client, Error, Message, Runstate};

fn status_script() -> MockScript {
    MockScript::new().reply_return(
        "query-status",
        serde_json::json!({"running": true, "singlestep": false, "status": "running"}),
    )
}

#[tokio::test]
async fn client_can_execute_and_receive_events() -> aqmp::Result<()> {
    let script = status_script().post_event(serde_json::json!({
        "event": "STOP",
        "data": {"reason": "pause"},
        "timestamp": {"seconds": 0, "microseconds": 0}
    }));

    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder().name("vm0").connect(&server.endpoint()).await?;
    assert_eq!(client.runstate(), Runstate::Running);

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(
        status.get("status").and_then(|v| v.as_str()),
        Some("running")
    );

    let msg = tokio::time::timeout(Duration::from_secs(5), client.events().get())
        .await
        .expect("event");
    let ev = Event::try_from(&msg)?;
    assert_eq!(ev.name, "STOP");
    assert_eq!(ev.data["reason"], "pause");

    client.disconnect().await?;
    assert_eq!(client.runstate(), Runstate::Idle);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handshake_results_are_exposed() -> aqmp::Result<()> {
    let server = MockServer::start_tcp(MockScript::new()).await?;
    let client = Client::default();
    assert!(client.greeting().is_none());

    client.connect(&server.endpoint()).await?;
    let greeting = client.greeting().expect("greeting");
    assert_eq!(greeting.qmp.version.package, "mock");
    assert_eq!(client.negotiated_capabilities(), vec!["oob".to_string()]);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn error_reply_maps_to_qmp_error() -> aqmp::Result<()> {
    let script = MockScript::new().reply_error("stop", "GenericError", "not now");
    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;

    let err = client
        .execute::<(), serde_json::Value>("stop", None)
        .await
        .unwrap_err();
    match err {
        Error::Qmp {
            command,
            class,
            desc,
        } => {
            assert_eq!(command, "stop");
            assert_eq!(class, "GenericError");
            assert_eq!(desc, "not now");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The session survives a command error.
    assert_eq!(client.runstate(), Runstate::Running);
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn typed_return_reports_path_on_mismatch() -> aqmp::Result<()> {
    #[derive(Debug, serde::Deserialize)]
    #[allow(dead_code)]
    struct Status {
        running: bool,
        status: u32,
    }

    let server = MockServer::start_tcp(status_script()).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;

    let err = client
        .execute::<(), Status>("query-status", None)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Protocol { message } if message.contains("status")),
        "{err:?}"
    );

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn named_listener_sees_only_its_events() -> aqmp::Result<()> {
    let script = MockScript::new()
        .post_event(serde_json::json!({"event": "STOP"}))
        .post_event(serde_json::json!({"event": "SHUTDOWN", "data": {"guest": true}}))
        .post_event(serde_json::json!({"event": "RESUME"}));
    let server = MockServer::start_tcp(script).await?;

    let client = Client::default();
    let guard = client.listener(["SHUTDOWN"])?;
    client.connect(&server.endpoint()).await?;

    let shutdown = tokio::time::timeout(Duration::from_secs(5), guard.listener().get())
        .await
        .expect("SHUTDOWN");
    assert_eq!(shutdown.event_name(), Some("SHUTDOWN"));

    // The default listener sees everything, in wire order.
    let mut names = Vec::new();
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.events().get())
            .await
            .expect("event");
        names.push(msg.event_name().map(str::to_string));
    }
    assert_eq!(
        names,
        [
            Some("STOP".to_string()),
            Some("SHUTDOWN".to_string()),
            Some("RESUME".to_string())
        ]
    );

    assert!(guard.listener().empty());
    assert_eq!(guard.listener().history().len(), 1);
    drop(guard);
    assert_eq!(client.event_registry().len(), 1);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn hangup_fails_pending_command_and_surfaces_on_disconnect() -> aqmp::Result<()> {
    let server = MockServer::start_tcp(MockScript::new().hangup_on("quit")).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;

    let err = client
        .execute::<(), serde_json::Value>("quit", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected), "{err:?}");

    let mut states = client.subscribe_runstate();
    states
        .wait_for(|s| *s == Runstate::Disconnecting)
        .await
        .expect("runstate");

    // New commands are refused without touching the socket.
    let err = client
        .execute::<(), serde_json::Value>("query-status", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::State { .. }), "{err:?}");

    let err = client.disconnect().await.unwrap_err();
    assert!(matches!(err, Error::Eof), "{err:?}");
    assert_eq!(client.runstate(), Runstate::Idle);

    // Reported once; further calls are no-ops.
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn client_is_reusable_after_disconnect() -> aqmp::Result<()> {
    let client = Client::default();

    for _ in 0..2 {
        let server = MockServer::start_tcp(status_script()).await?;
        client.connect(&server.endpoint()).await?;
        let _: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
        client.disconnect().await?;
        assert_eq!(client.runstate(), Runstate::Idle);
    }
    Ok(())
}

#[tokio::test]
async fn raw_messages_keep_custom_ids() -> aqmp::Result<()> {
    let server = MockServer::start_tcp(status_script()).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;

    let msg = Message::from_value(serde_json::json!({
        "execute": "query-status",
        "id": "mine"
    }))?;
    let reply = client.raw(msg, false).await?;
    assert_eq!(reply.get_str("id"), Some("mine"));
    assert_eq!(reply.get("return").map(|r| r["status"].clone()), Some(serde_json::json!("running")));

    let reserved = Message::from_value(serde_json::json!({
        "execute": "query-status",
        "id": "__qmp#00099"
    }))?;
    let err = client.raw(reserved, false).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err:?}");

    let value = client
        .execute_msg(Message::from_value(serde_json::json!({"execute": "query-status"}))?)
        .await?;
    assert_eq!(value["status"], "running");

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_call_leaves_session_running() -> aqmp::Result<()> {
    let server = MockServer::start_tcp(status_script()).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = client
        .execute_with_options::<(), serde_json::Value>(
            "query-status",
            None,
            CallOptions {
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await;
    // The reply may win the race against the already-cancelled token.
    if let Err(err) = err {
        assert!(matches!(err, Error::Cancelled), "{err:?}");
    }
    assert_eq!(client.runstate(), Runstate::Running);

    client.disconnect().await?;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_endpoint() -> aqmp::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qmp.sock");

    let server = MockServer::start_unix(&path, status_script()).await?;
    let client = Client::builder().connect(&server.endpoint()).await?;
    let v: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(v["running"], true);

    client.disconnect().await?;
    Ok(())
}
