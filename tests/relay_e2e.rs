//! End to end: russh client -> proxy -> russh backend, all on loopback

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hub_ssh_proxy::proxy::{
    server_config, LineEndings, ProxyContext, ProxyServer, Route, SessionPolicy,
};
use hub_ssh_proxy::ssh::{BackendConfig, ServiceAccount, SshConnector};
use russh::keys::{decode_secret_key, PublicKey};
use russh::server::{Auth, Msg as ServerMsg, Session};
use russh::{client, server, Channel, ChannelId, ChannelMsg, CryptoVec, Pty};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROXY_KEY: &str = include_str!("fixtures/proxy_host_ed25519");
const BACKEND_KEY: &str = include_str!("fixtures/backend_host_ed25519");

const SERVICE_USER: &str = "jovyan";
const SERVICE_PASSWORD: &str = "service-secret";

/// What the fake pod saw
#[derive(Default)]
struct BackendLog {
    logins: Mutex<Vec<(String, String)>>,
    received: Mutex<Vec<u8>>,
    requests: Mutex<Vec<String>>,
    pty_modes: Mutex<Vec<(Pty, u32)>>,
    closed_sessions: AtomicUsize,
}

/// Fake pod sshd: echoes data, accepts `pty-req` and `env LANG`, answers
/// `shell` with a line and exit status 7
struct FakePod {
    log: Arc<BackendLog>,
}

impl server::Handler for FakePod {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.log
            .logins
            .lock()
            .unwrap()
            .push((user.to_string(), password.to_string()));
        if user == SERVICE_USER && password == SERVICE_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<ServerMsg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.log.received.lock().unwrap().extend_from_slice(data);
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.log
            .requests
            .lock()
            .unwrap()
            .push(format!("pty-req {} {}x{}", term, col_width, row_height));
        *self.log.pty_modes.lock().unwrap() = modes.to_vec();
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.log
            .requests
            .lock()
            .unwrap()
            .push(format!("env {}", variable_name));
        if variable_name == "LANG" {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.log.requests.lock().unwrap().push("shell".to_string());
        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(b"bye\n"));
        let _ = session.exit_status_request(channel, 7);
        let _ = session.eof(channel);
        let _ = session.close(channel);
        Ok(())
    }
}

impl Drop for FakePod {
    fn drop(&mut self) {
        self.log.closed_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

struct StaticPolicy {
    backend: SocketAddr,
}

#[async_trait]
impl SessionPolicy for StaticPolicy {
    async fn resolve_route(&self, username: &str) -> Option<Route> {
        (username == "alice").then(|| Route::new(self.backend.ip(), self.backend.port()))
    }

    async fn verify_credential(&self, username: &str, credential: &str) -> bool {
        credential == format!("{}-token", username)
    }
}

struct AnyKey;

impl client::Handler for AnyKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Harness {
    proxy: SocketAddr,
    log: Arc<BackendLog>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_backend(log: Arc<BackendLog>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        keys: vec![decode_secret_key(BACKEND_KEY, None).unwrap()],
        ..Default::default()
    });

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = FakePod { log: log.clone() };
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(running) = server::run_stream(config, stream, handler).await {
                    let _ = running.await;
                }
            });
        }
    });

    addr
}

async fn start() -> Harness {
    let log = Arc::new(BackendLog::default());
    let backend = spawn_backend(log.clone()).await;

    let connector = SshConnector::new(
        BackendConfig::new(ServiceAccount::new(SERVICE_USER, SERVICE_PASSWORD)).with_timeout(5),
    );
    let ctx = Arc::new(ProxyContext {
        policy: Arc::new(StaticPolicy { backend }),
        connector: Arc::new(connector),
        filter: Arc::new(LineEndings),
        max_channels: Some(4),
    });

    let key = decode_secret_key(PROXY_KEY, None).unwrap();
    let server = ProxyServer::bind("127.0.0.1:0", server_config(key), ctx, None)
        .await
        .unwrap();
    let proxy = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));

    Harness {
        proxy,
        log,
        shutdown,
    }
}

async fn login(proxy: SocketAddr, user: &str, password: &str) -> (client::Handle<AnyKey>, bool) {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, proxy, AnyKey).await.unwrap();
    let auth = handle.authenticate_password(user, password).await.unwrap();
    (handle, auth.success())
}

#[derive(Debug, Default)]
struct Transcript {
    stdout: Vec<u8>,
    exit_status: Option<u32>,
    successes: usize,
    failures: usize,
    /// Success (`true`) and failure replies in arrival order
    replies: Vec<bool>,
    closed: bool,
}

/// Read until `done` says so, the channel closes, or 10 seconds pass
async fn read_until(
    channel: &mut Channel<client::Msg>,
    transcript: &mut Transcript,
    done: impl Fn(&Transcript) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done(transcript) {
        let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(msg) => msg,
            Err(_) => panic!("timed out, transcript so far: {:?}", transcript),
        };
        match msg {
            Some(ChannelMsg::Data { data }) => transcript.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                transcript.exit_status = Some(exit_status)
            }
            Some(ChannelMsg::Success) => {
                transcript.successes += 1;
                transcript.replies.push(true);
            }
            Some(ChannelMsg::Failure) => {
                transcript.failures += 1;
                transcript.replies.push(false);
            }
            Some(ChannelMsg::Close) | None => {
                transcript.closed = true;
                return;
            }
            Some(_) => {}
        }
    }
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_shell_session_relays_data_and_exit_status() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    // Backend was reached with the service account, never the caller's token
    assert_eq!(
        *harness.log.logins.lock().unwrap(),
        vec![(SERVICE_USER.to_string(), SERVICE_PASSWORD.to_string())]
    );

    let mut channel = handle.channel_open_session().await.unwrap();
    let mut transcript = Transcript::default();

    channel.data(&b"ping\n"[..]).await.unwrap();
    read_until(&mut channel, &mut transcript, |t| t.stdout == b"ping\r\n").await;

    // Caller-to-backend bytes are not filtered
    assert_eq!(*harness.log.received.lock().unwrap(), b"ping\n");

    channel.request_shell(true).await.unwrap();
    read_until(&mut channel, &mut transcript, |t| t.closed).await;

    assert_eq!(transcript.stdout, b"ping\r\nbye\r\n");
    assert_eq!(transcript.successes, 1);
    assert_eq!(transcript.exit_status, Some(7));
}

#[tokio::test]
async fn test_pty_then_shell() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let mut channel = handle.channel_open_session().await.unwrap();
    let mut transcript = Transcript::default();

    channel
        .request_pty(true, "xterm-256color", 120, 40, 0, 0, &[(Pty::ECHO, 1)])
        .await
        .unwrap();
    read_until(&mut channel, &mut transcript, |t| t.replies.len() == 1).await;
    assert_eq!(transcript.replies, vec![true]);

    channel.request_shell(true).await.unwrap();
    read_until(&mut channel, &mut transcript, |t| t.closed).await;

    assert_eq!(transcript.replies, vec![true, true]);
    assert_eq!(transcript.stdout, b"bye\r\n");
    assert_eq!(transcript.exit_status, Some(7));
    assert_eq!(
        *harness.log.requests.lock().unwrap(),
        vec!["pty-req xterm-256color 120x40", "shell"]
    );
    assert_eq!(*harness.log.pty_modes.lock().unwrap(), vec![(Pty::ECHO, 1)]);
}

#[tokio::test]
async fn test_pipelined_requests_get_replies_in_order() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let mut channel = handle.channel_open_session().await.unwrap();

    // Sent back to back, without waiting for any reply
    channel
        .request_pty(true, "vt100", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.set_env(false, "LANG", "C.UTF-8").await.unwrap();
    channel.set_env(true, "SECRET", "x").await.unwrap();
    channel.request_shell(true).await.unwrap();

    let mut transcript = Transcript::default();
    read_until(&mut channel, &mut transcript, |t| t.closed).await;

    // pty accepted, SECRET refused, shell accepted; LANG asked for no reply
    assert_eq!(transcript.replies, vec![true, false, true]);
    assert_eq!(transcript.exit_status, Some(7));
    assert_eq!(
        *harness.log.requests.lock().unwrap(),
        vec!["pty-req vt100 80x24", "env LANG", "env SECRET", "shell"]
    );
}

#[tokio::test]
async fn test_pty_then_exec_replies_in_order() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.exec(true, "id").await.unwrap();

    let mut transcript = Transcript::default();
    read_until(&mut channel, &mut transcript, |t| t.replies.len() == 2).await;
    assert_eq!(transcript.replies, vec![true, false]);
    // exec never reached the pod
    assert_eq!(*harness.log.requests.lock().unwrap(), vec!["pty-req xterm 80x24"]);
}

#[tokio::test]
async fn test_bulk_echo_both_ways() {
    const PAYLOAD: usize = 8 << 20;

    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let channel = handle.channel_open_session().await.unwrap();
    let (mut reader, writer) = channel.split();

    // No newlines, so the CRLF filter leaves the echo the same size
    let payload = vec![b'x'; PAYLOAD];
    let upload = tokio::spawn(async move {
        writer.data(&payload[..]).await.unwrap();
        writer
    });

    let mut echoed = 0usize;
    let download = async {
        while echoed < PAYLOAD {
            match reader.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    assert!(data.iter().all(|b| *b == b'x'));
                    echoed += data.len();
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), download)
        .await
        .expect("echo stalled");
    let _writer = tokio::time::timeout(Duration::from_secs(10), upload)
        .await
        .expect("upload stalled")
        .unwrap();

    assert_eq!(echoed, PAYLOAD);
    assert_eq!(harness.log.received.lock().unwrap().len(), PAYLOAD);
}

#[tokio::test]
async fn test_two_channels_do_not_cross_talk() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let mut first = handle.channel_open_session().await.unwrap();
    let mut second = handle.channel_open_session().await.unwrap();

    first.data(&b"one\n"[..]).await.unwrap();
    second.data(&b"two\n"[..]).await.unwrap();

    let mut first_seen = Transcript::default();
    let mut second_seen = Transcript::default();
    read_until(&mut first, &mut first_seen, |t| t.stdout.len() >= 5).await;
    read_until(&mut second, &mut second_seen, |t| t.stdout.len() >= 5).await;

    assert_eq!(first_seen.stdout, b"one\r\n");
    assert_eq!(second_seen.stdout, b"two\r\n");

    // Completing the first pair leaves the second one running
    first.request_shell(true).await.unwrap();
    read_until(&mut first, &mut first_seen, |t| t.closed).await;
    assert_eq!(first_seen.exit_status, Some(7));

    second.data(&b"still\n"[..]).await.unwrap();
    read_until(&mut second, &mut second_seen, |t| t.stdout.ends_with(b"still\r\n")).await;
    assert!(!second_seen.closed);
}

#[tokio::test]
async fn test_exec_is_refused() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "id").await.unwrap();

    let mut transcript = Transcript::default();
    read_until(&mut channel, &mut transcript, |t| t.failures == 1).await;
    assert_eq!(transcript.successes, 0);
}

#[tokio::test]
async fn test_bad_token_never_reaches_backend() {
    let harness = start().await;
    let (_handle, ok) = login(harness.proxy, "alice", "wrong").await;
    assert!(!ok);
    assert!(harness.log.logins.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_user_is_rejected() {
    let harness = start().await;
    // Valid-looking credential, but no pod is routed for this user
    let (_handle, ok) = login(harness.proxy, "bob", "bob-token").await;
    assert!(!ok);
    assert!(harness.log.logins.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_caller_disconnect_releases_backend() {
    let harness = start().await;
    let (handle, ok) = login(harness.proxy, "alice", "alice-token").await;
    assert!(ok);

    let channel = handle.channel_open_session().await.unwrap();
    channel.data(&b"partial"[..]).await.unwrap();

    handle
        .disconnect(russh::Disconnect::ByApplication, "bye", "en")
        .await
        .unwrap();
    drop(channel);
    drop(handle);

    let log = harness.log.clone();
    assert!(
        eventually(|| log.closed_sessions.load(Ordering::SeqCst) == 1).await,
        "backend session was not released"
    );
}
