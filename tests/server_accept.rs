use std::time::Duration;

use aqmp::mock::{MockScript, MockServer};
use aqmp::{Client, Endpoint, Error, Runstate};

fn status_script() -> MockScript {
    MockScript::new()
        .reply_return("query-status", serde_json::json!({"status": "paused"}))
        .post_event(serde_json::json!({"event": "STOP"}))
}

#[tokio::test]
async fn accept_over_tcp() -> aqmp::Result<()> {
    let client = Client::builder().name("listener").build();
    client.start_server(&Endpoint::tcp("127.0.0.1", 0)).await?;
    assert_eq!(client.runstate(), Runstate::Connecting);

    let endpoint = client.server_endpoint().expect("listening");
    let qemu = MockServer::dial(endpoint, status_script());

    client.accept(Some(Duration::from_secs(5))).await?;
    assert_eq!(client.runstate(), Runstate::Running);
    assert!(client.server_endpoint().is_none());

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(status["status"], "paused");

    let stop = tokio::time::timeout(Duration::from_secs(5), client.events().get())
        .await
        .expect("STOP");
    assert_eq!(stop.event_name(), Some("STOP"));

    client.disconnect().await?;
    qemu.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn accept_over_unix_socket() -> aqmp::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qmp.sock");
    let endpoint = Endpoint::unix(&path);

    let client = Client::default();
    client.start_server(&endpoint).await?;
    assert!(path.exists());

    let qemu = MockServer::dial(endpoint, status_script());
    client.accept(None).await?;
    // The socket file goes away once the peer is accepted.
    assert!(!path.exists());

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(status["status"], "paused");

    client.disconnect().await?;
    qemu.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn accept_timeout_does_not_change_state() -> aqmp::Result<()> {
    let client = Client::default();
    client.start_server(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let err = client
        .accept(Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    assert_eq!(client.runstate(), Runstate::Connecting);
    assert!(client.server_endpoint().is_some());

    client.disconnect().await?;
    assert_eq!(client.runstate(), Runstate::Idle);
    assert!(client.server_endpoint().is_none());
    Ok(())
}

#[tokio::test]
async fn start_server_twice_is_a_state_error() -> aqmp::Result<()> {
    let client = Client::default();
    client.start_server(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let err = client
        .start_server(&Endpoint::tcp("127.0.0.1", 0))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::State {
                state: Runstate::Connecting,
                required: Runstate::Idle
            }
        ),
        "{err:?}"
    );

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn connect_failure_is_wrapped() -> aqmp::Result<()> {
    // Grab a free port, then close it again.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let client = Client::default();
    let err = client
        .connect(&Endpoint::tcp("127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Connect { message, source }
            if message == "Failed to establish connection" && matches!(**source, Error::Io { .. })),
        "{err:?}"
    );
    assert_eq!(client.runstate(), Runstate::Idle);
    Ok(())
}
