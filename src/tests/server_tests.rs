use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{self as ssh_server, Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::db::Catalog;
use crate::proxy::SessionRegistry;
use crate::server::BastionServer;
use crate::tests::test_utils::{base_configuration, binding, TestCatalog};

/// Mock downstream SSH server: accepts any public key and echoes session
/// data back to the sender.
#[derive(Default)]
struct EchoHandler {
    channels: Vec<Channel<Msg>>,
}

impl ssh_server::Handler for EchoHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.push(channel);
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(data))?;
        Ok(())
    }
}

async fn spawn_echo_target() -> SocketAddr {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let config = Arc::new(ssh_server::Config {
        keys: vec![key],
        auth_rejection_time: Duration::from_millis(10),
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            tokio::spawn(async move {
                let Ok(session) =
                    ssh_server::run_stream(config, stream, EchoHandler::default()).await
                else {
                    return;
                };
                let _ = session.await;
            });
        }
    });

    address
}

struct RunningBastion {
    address: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    run_handle: JoinHandle<color_eyre::Result<()>>,
    _temp_dir: TempDir,
}

impl RunningBastion {
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = timeout(Duration::from_secs(10), self.run_handle).await;
    }
}

async fn start_bastion(tc: &TestCatalog, restricted: &[&str]) -> RunningBastion {
    let temp_dir = TempDir::new().unwrap();

    let mut configuration = base_configuration();
    configuration.bind_addr = "127.0.0.1".parse().unwrap();
    // Ephemeral port so parallel tests never collide.
    configuration.bind_port = 0;
    configuration.host_key_file = temp_dir.path().join("host_key");
    // Small host key keeps test startup fast.
    configuration.host_key_bits = 1024;
    configuration.connection_timeout = Duration::from_secs(10);
    configuration.restricted_networks = restricted
        .iter()
        .map(|network| network.parse().unwrap())
        .collect();

    let catalog: Arc<dyn Catalog> = tc.catalog.clone();
    let server = BastionServer::bind(&configuration, catalog).await.unwrap();
    let address = server.local_addr();
    let registry = server.registry();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let run_handle = tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));

    RunningBastion {
        address,
        registry,
        shutdown: Some(shutdown_tx),
        run_handle,
        _temp_dir: temp_dir,
    }
}

struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Generates a client key and registers its fingerprint for the target.
fn client_key_with_binding(tc: &TestCatalog, target: SocketAddr, target_user: &str) -> PrivateKey {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
    tc.catalog
        .insert(&binding(
            &fingerprint,
            "127.0.0.1",
            i32::from(target.port()),
            target_user,
        ))
        .unwrap();
    key
}

async fn connect_client(
    address: SocketAddr,
    key: PrivateKey,
    user: &str,
) -> (client::Handle<TrustingClient>, bool) {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, address, TrustingClient)
        .await
        .unwrap();
    let authenticated = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .unwrap()
        .success();
    (handle, authenticated)
}

async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

async fn collect_data(channel: &mut Channel<client::Msg>, expected_len: usize) -> Vec<u8> {
    let mut received = Vec::new();
    while received.len() < expected_len {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => received.extend_from_slice(&data),
            Some(_) => {}
            None => break,
        }
    }
    received
}

#[tokio::test]
async fn relays_bytes_to_target_and_back() {
    let target_address = spawn_echo_target().await;
    let tc = TestCatalog::new();
    let key = client_key_with_binding(&tc, target_address, "tester");
    let bastion = start_bastion(&tc, &[]).await;

    let (handle, authenticated) = connect_client(bastion.address, key, "alice").await;
    assert!(authenticated);

    let mut channel = handle.channel_open_session().await.unwrap();
    let payload = b"ping through the bastion";
    channel.data(&payload[..]).await.unwrap();

    let received = timeout(Duration::from_secs(10), collect_data(&mut channel, payload.len()))
        .await
        .unwrap();
    assert_eq!(received, payload);

    // The session shows up in the live registry and the audit log.
    assert!(wait_for(|| bastion.registry.len() == 1).await);
    assert!(tc.events().iter().any(|event| event.status == "success"));

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "")
        .await;
    assert!(wait_for(|| bastion.registry.is_empty()).await);

    bastion.stop().await;
}

#[tokio::test]
async fn rejects_unknown_key_at_the_transport() {
    let tc = TestCatalog::new();
    let bastion = start_bastion(&tc, &[]).await;

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let (handle, authenticated) = connect_client(bastion.address, key, "alice").await;
    assert!(!authenticated);
    drop(handle);

    assert!(tc.events().iter().any(|event| {
        event.status == "denied"
            && event.error_message.as_deref() == Some("unknown fingerprint")
    }));
    assert!(bastion.registry.is_empty());

    bastion.stop().await;
}

#[tokio::test]
async fn restricted_target_is_denied_before_dialing() {
    let target_address = spawn_echo_target().await;
    let tc = TestCatalog::new();
    let key = client_key_with_binding(&tc, target_address, "tester");
    let bastion = start_bastion(&tc, &["127.0.0.0/8"]).await;

    let (handle, authenticated) = connect_client(bastion.address, key, "alice").await;
    assert!(authenticated);

    // The router rejects after authentication: the channel never carries
    // data and the connection is closed.
    if let Ok(mut channel) = handle.channel_open_session().await {
        let closed_without_data = timeout(Duration::from_secs(5), async {
            loop {
                match channel.wait().await {
                    None => break true,
                    Some(ChannelMsg::Data { .. }) => break false,
                    Some(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(closed_without_data);
    }

    assert!(
        wait_for(|| {
            tc.events().iter().any(|event| {
                event.status == "denied"
                    && event
                        .error_message
                        .as_deref()
                        .is_some_and(|message| message.contains("restricted"))
            })
        })
        .await
    );
    assert!(bastion.registry.is_empty());

    bastion.stop().await;
}

#[tokio::test]
async fn shell_requests_are_refused_but_session_survives() {
    let target_address = spawn_echo_target().await;
    let tc = TestCatalog::new();
    let key = client_key_with_binding(&tc, target_address, "tester");
    let bastion = start_bastion(&tc, &[]).await;

    let (handle, authenticated) = connect_client(bastion.address, key, "alice").await;
    assert!(authenticated);
    let mut channel = handle.channel_open_session().await.unwrap();

    // Wait for the relay to come up so the refusal provably doesn't tear
    // the session down.
    assert!(wait_for(|| bastion.registry.len() == 1).await);

    channel.request_shell(true).await.unwrap();
    let refused = timeout(Duration::from_secs(5), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Failure) => break true,
                Some(ChannelMsg::Success) => break false,
                Some(_) => {}
                None => break false,
            }
        }
    })
    .await
    .unwrap();
    assert!(refused);

    // Tunnelled traffic still flows afterwards.
    let payload = b"still alive";
    channel.data(&payload[..]).await.unwrap();
    let echoed = timeout(Duration::from_secs(10), collect_data(&mut channel, payload.len()))
        .await
        .unwrap();
    assert_eq!(echoed, payload);

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "")
        .await;
    bastion.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_severs_live_sessions() {
    let target_address = spawn_echo_target().await;
    let tc = TestCatalog::new();
    let first_key = client_key_with_binding(&tc, target_address, "tester");
    let second_key = client_key_with_binding(&tc, target_address, "tester");
    let mut bastion = start_bastion(&tc, &[]).await;

    let (first_handle, authenticated) = connect_client(bastion.address, first_key, "alice").await;
    assert!(authenticated);
    let mut first_channel = first_handle.channel_open_session().await.unwrap();
    first_channel.data(&b"one"[..]).await.unwrap();

    let (second_handle, authenticated) = connect_client(bastion.address, second_key, "bob").await;
    assert!(authenticated);
    let mut second_channel = second_handle.channel_open_session().await.unwrap();
    second_channel.data(&b"two"[..]).await.unwrap();

    assert!(wait_for(|| bastion.registry.len() == 2).await);

    let registry = bastion.registry.clone();
    if let Some(shutdown) = bastion.shutdown.take() {
        let _ = shutdown.send(());
    }

    let result = timeout(Duration::from_secs(10), bastion.run_handle)
        .await
        .expect("server should stop within the grace period")
        .unwrap();
    assert!(result.is_ok());
    assert!(registry.is_empty());
}
