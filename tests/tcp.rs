mod support;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

use remotelink::tcp::{TcpRemote, TcpRemoteListener};
use remotelink::{MessagePump, Receiver, RemoteError, RemoteOptions};

use support::{Chat, CollectReceiver, Login2Gate, Login2GateResult, LoginReceiver, MismatchReceiver, SilentReceiver};

fn login() -> Login2Gate {
    Login2Gate { account: "u".to_string(), password: "p".to_string() }
}

/// Binds a listener that starts every accepted session with `receiver`.
async fn bind_server(receiver: Arc<dyn Receiver>, options: RemoteOptions) -> SocketAddr {
    let listener = TcpRemoteListener::bind(
        "127.0.0.1:0".parse().expect("literal address"),
        support::test_table(),
        support::spawn_pump(),
        options,
    )
    .await
    .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        while let Ok(session) = listener.listen().await {
            session.set_receiver(Arc::clone(&receiver));
            session.start().expect("start accepted session");
        }
    });
    addr
}

async fn connect(addr: SocketAddr, options: RemoteOptions) -> TcpRemote {
    TcpRemote::connect(
        addr,
        Arc::new(SilentReceiver),
        support::test_table(),
        support::spawn_pump(),
        options,
    )
    .await
    .expect("connect")
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn rpc_round_trip_over_stream() {
    let addr = bind_server(Arc::new(LoginReceiver), RemoteOptions::default()).await;
    let client = connect(addr, RemoteOptions::default()).await;

    let reply = client.rpc_send::<Login2GateResult, _>(&login());
    let result = timeout(Duration::from_secs(5), reply)
        .await
        .expect("reply in time")
        .expect("rpc succeeds");
    assert!(result.is_success);
    assert_eq!(client.rpc_pending(), 0);
    assert!(client.last_receive_elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn lazy_rpc_delivers_through_the_reply_callback() {
    let addr = bind_server(Arc::new(LoginReceiver), RemoteOptions::default()).await;
    let client = connect(addr, RemoteOptions::default()).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.lazy_rpc_send::<Login2GateResult, _, _, _>(
        &login(),
        move |result| {
            let _ = tx.send(result.is_success);
        },
        |err| panic!("lazy rpc failed: {err}"),
    );
    let is_success = timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback in time")
        .expect("reply callback fired");
    assert!(is_success);
}

#[tokio::test]
async fn queued_messages_wait_for_the_application_drain() {
    let (mut pump, handle) = MessagePump::new();
    let listener = TcpRemoteListener::bind(
        "127.0.0.1:0".parse().expect("literal address"),
        support::test_table(),
        handle,
        RemoteOptions::default(),
    )
    .await
    .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");

    let client = connect(addr, RemoteOptions::default()).await;
    let accepted = listener.listen().await.expect("accept");
    let collector = Arc::new(CollectReceiver::default());
    accepted.set_receiver(Arc::<CollectReceiver>::clone(&collector));
    accepted.start().expect("start accepted session");

    client.send(&Chat { text: "tick".to_string() }).expect("send");

    // Nobody drains the pump, so the handler must not have run yet.
    sleep(Duration::from_millis(200)).await;
    assert!(collector.seen.lock().expect("seen mutex").is_empty());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut dispatched = 0;
    while dispatched == 0 {
        assert!(Instant::now() < deadline, "message never reached the pump");
        dispatched += pump.drain(16).await;
        sleep(Duration::from_millis(10)).await;
    }
    let seen = collector.seen.lock().expect("seen mutex").clone();
    assert_eq!(seen, ["tick"]);
}

#[tokio::test]
async fn unanswered_rpc_times_out_and_releases_the_slot() {
    let addr = bind_server(Arc::new(SilentReceiver), RemoteOptions::default()).await;
    let options = RemoteOptions { rpc_timeout_ms: 50, ..RemoteOptions::default() };
    let client = connect(addr, options).await;

    let started = Instant::now();
    let err = timeout(Duration::from_secs(2), client.rpc_send::<Login2GateResult, _>(&login()))
        .await
        .expect("resolves in time")
        .expect_err("no reply must time out");
    assert_eq!(err, RemoteError::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
    assert_eq!(client.rpc_pending(), 0);
}

#[tokio::test]
async fn reply_of_wrong_type_resolves_with_mismatch() {
    let addr = bind_server(Arc::new(MismatchReceiver), RemoteOptions::default()).await;
    let client = connect(addr, RemoteOptions::default()).await;

    let err = timeout(Duration::from_secs(5), client.rpc_send::<Login2GateResult, _>(&login()))
        .await
        .expect("resolves in time")
        .expect_err("mismatched reply");
    assert!(matches!(err, RemoteError::TypeMismatch { .. }));
}

#[tokio::test]
async fn disconnect_drains_pending_rpcs_without_firing_hooks() {
    let addr = bind_server(Arc::new(SilentReceiver), RemoteOptions::default()).await;
    let client = connect(addr, RemoteOptions::default()).await;

    let hook_fired = Arc::new(AtomicBool::new(false));
    {
        let hook_fired = Arc::clone(&hook_fired);
        client.on_disconnect(move |_| hook_fired.store(true, Ordering::SeqCst));
    }

    let first = client.rpc_send::<Login2GateResult, _>(&login());
    let second = client.rpc_send::<Login2GateResult, _>(&login());
    let third = client.rpc_send::<Login2GateResult, _>(&login());
    assert_eq!(client.rpc_pending(), 3);

    client.disconnect();
    for reply in [first, second, third] {
        let err = timeout(Duration::from_secs(1), reply)
            .await
            .expect("drained promptly")
            .expect_err("drained with error");
        assert_eq!(err, RemoteError::Disconnected);
    }
    assert_eq!(client.rpc_pending(), 0);
    assert!(!client.is_valid());

    sleep(Duration::from_millis(100)).await;
    assert!(
        !hook_fired.load(Ordering::SeqCst),
        "user-initiated disconnect must not fire the hook"
    );
}

#[tokio::test]
async fn sends_arrive_in_order() {
    let collector = Arc::new(CollectReceiver::default());
    let addr = bind_server(
        Arc::<CollectReceiver>::clone(&collector),
        RemoteOptions::default(),
    )
    .await;
    let client = connect(addr, RemoteOptions::default()).await;

    for text in ["alpha", "beta", "gamma"] {
        client.send(&Chat { text: text.to_string() }).expect("send");
    }

    wait_until("all three chats", || {
        collector.seen.lock().expect("seen mutex").len() == 3
    })
    .await;
    let seen = collector.seen.lock().expect("seen mutex").clone();
    assert_eq!(seen, ["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn reconnect_inside_the_window_resumes_the_session() {
    let table = support::test_table();
    let pump = support::spawn_pump();
    let listener = TcpRemoteListener::bind(
        "127.0.0.1:0".parse().expect("literal address"),
        Arc::clone(&table),
        pump.clone(),
        RemoteOptions::default(),
    )
    .await
    .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");

    let options = RemoteOptions {
        is_reconnect: true,
        reconnect_window_ms: 5_000,
        ..RemoteOptions::default()
    };
    let client = TcpRemote::connect(addr, Arc::new(SilentReceiver), table, pump, options)
        .await
        .expect("connect");

    let pre_fired = Arc::new(AtomicBool::new(false));
    let success_fired = Arc::new(AtomicBool::new(false));
    {
        let pre_fired = Arc::clone(&pre_fired);
        client.on_pre_reconnect(move || pre_fired.store(true, Ordering::SeqCst));
    }
    {
        let success_fired = Arc::clone(&success_fired);
        client.on_reconnect_success(move || success_fired.store(true, Ordering::SeqCst));
    }

    let first = listener.listen().await.expect("first accept");
    first.set_receiver(Arc::new(LoginReceiver));
    first.start().expect("start first session");

    // Sever from the server side; the client sees an unsolicited loss.
    first.disconnect();

    wait_until("pre-reconnect event", || pre_fired.load(Ordering::SeqCst)).await;

    let second = timeout(Duration::from_secs(5), listener.listen())
        .await
        .expect("client retries inside the window")
        .expect("second accept");
    second.set_receiver(Arc::new(LoginReceiver));
    second.start().expect("start second session");

    wait_until("reconnect-success event", || {
        success_fired.load(Ordering::SeqCst)
    })
    .await;
    assert!(client.is_valid());

    let result = timeout(Duration::from_secs(5), client.rpc_send::<Login2GateResult, _>(&login()))
        .await
        .expect("reply in time")
        .expect("rpc works after reconnect");
    assert!(result.is_success);
}

#[tokio::test]
async fn corrupt_stream_closes_the_session_with_framing_error() {
    let listener = TcpRemoteListener::bind(
        "127.0.0.1:0".parse().expect("literal address"),
        support::test_table(),
        support::spawn_pump(),
        RemoteOptions::default(),
    )
    .await
    .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");

    let mut raw = tokio::net::TcpStream::connect(addr).await.expect("raw connect");
    let accepted = listener.listen().await.expect("accept");
    accepted.set_receiver(Arc::new(SilentReceiver));
    accepted.start().expect("start accepted session");

    let reason: Arc<std::sync::Mutex<Option<RemoteError>>> =
        Arc::new(std::sync::Mutex::new(None));
    {
        let reason = Arc::clone(&reason);
        accepted.on_disconnect(move |err| {
            *reason.lock().expect("reason mutex") = Some(err.clone());
        });
    }

    // A size field below the header length can never be a valid packet.
    use tokio::io::AsyncWriteExt;
    raw.write_all(&[4, 0, 0, 0, 0, 0, 0, 0]).await.expect("write garbage");

    wait_until("framing disconnect", || {
        reason.lock().expect("reason mutex").is_some()
    })
    .await;
    let reason = reason.lock().expect("reason mutex").clone().expect("reason recorded");
    assert!(matches!(reason, RemoteError::FramingError(_)));
    assert!(!accepted.is_valid());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let listener = TcpRemoteListener::bind(
        "127.0.0.1:0".parse().expect("literal address"),
        support::test_table(),
        support::spawn_pump(),
        RemoteOptions::default(),
    )
    .await
    .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");

    let connecting = tokio::spawn(async move {
        TcpRemote::connect(
            addr,
            Arc::new(SilentReceiver),
            support::test_table(),
            support::spawn_pump(),
            RemoteOptions::default(),
        )
        .await
    });
    let accepted = listener.listen().await.expect("accept");
    accepted.set_receiver(Arc::new(SilentReceiver));
    accepted.start().expect("first start");
    assert_eq!(
        accepted.start().expect_err("second start"),
        RemoteError::AlreadyConnected
    );
    connecting.await.expect("join").expect("connect");
}
