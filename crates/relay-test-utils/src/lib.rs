//! In-process daemon and fake client harness for integration tests, in the
//! spirit of the teacher's `MockProvider` test double
//! (`sven-model`'s mock model used by `tests/integration_test.rs`): a
//! lightweight stand-in good enough to drive real protocol flows without a
//! real deployment.

use std::path::PathBuf;
use std::sync::Arc;

use daemon::{
    cloud_sync::NoopCloudSync, config::DaemonConfig, connection, membership::InMemoryMembershipStore,
    router::{Router, RouterHandle},
    storage::InMemoryStorage,
};
use relay_protocol::{
    encode_frame, Capabilities, Codec, Envelope, EnvelopeType, FrameDecoder, FrameMode, HelloPayload,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// A daemon running on a private Unix socket under a temp directory, torn
/// down when dropped.
pub struct TestDaemon {
    pub socket_path: PathBuf,
    pub router: RouterHandle,
    _workdir: tempfile::TempDir,
    accept_task: tokio::task::JoinHandle<()>,
    router_task: tokio::task::JoinHandle<()>,
}

impl TestDaemon {
    /// Start a daemon with in-memory storage/membership and no cloud sync.
    pub async fn start() -> anyhow::Result<Self> {
        let workdir = tempfile::tempdir()?;
        let mut config = DaemonConfig::default();
        config.socket_path = workdir.path().join("daemon.sock");
        config.state_dir = workdir.path().join("state");
        config.state_file_interval = std::time::Duration::from_millis(20);
        config.tracker_tick_interval = std::time::Duration::from_millis(20);

        let storage = Arc::new(InMemoryStorage::default());
        let membership = Arc::new(InMemoryMembershipStore::default());
        let (router, router_task) = Router::spawn(config.clone(), storage.clone(), membership, Arc::new(NoopCloudSync));

        let listener = UnixListener::bind(&config.socket_path)?;
        let config = Arc::new(config);
        let accept_router = router.clone();
        let accept_config = config.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let connection_id = uuid::Uuid::new_v4().to_string();
                        let router = accept_router.clone();
                        let config = accept_config.clone();
                        let storage = storage.clone();
                        tokio::spawn(async move {
                            connection::serve(stream, connection_id, router, config, storage).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            socket_path: config.socket_path.clone(),
            router,
            _workdir: workdir,
            accept_task,
            router_task,
        })
    }

    /// Connect and complete the HELLO/WELCOME handshake for `agent`.
    pub async fn connect(&self, agent: &str) -> anyhow::Result<TestClient> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        TestClient::handshake(stream, agent).await
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.router_task.abort();
    }
}

/// A thin hand-rolled client used to poke a `TestDaemon` directly, without
/// depending on the production `relay-client` crate (so the two can be
/// tested against each other).
pub struct TestClient {
    stream: UnixStream,
    decoder: FrameDecoder,
    pub session_id: String,
    pub resume_token: String,
}

impl TestClient {
    async fn handshake(mut stream: UnixStream, agent: &str) -> anyhow::Result<Self> {
        let hello = Envelope::new(
            EnvelopeType::Hello,
            HelloPayload {
                agent: agent.to_string(),
                entity_type: relay_protocol::EntityType::Agent,
                cli: None,
                capabilities: Capabilities { ack: true, resume: true, max_inflight: None, supports_topics: true, codec: Some("json".into()) },
                session: None,
                is_system_component: false,
            },
        )
        .with_from(agent);
        stream.write_all(&encode_frame(&hello, FrameMode::Current(Codec::Json))?).await?;

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        let welcome = loop {
            if let Some(env) = decoder.next_envelope()? {
                break env;
            }
            let n = stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "daemon closed connection during handshake");
            decoder.feed(&buf[..n]);
        };
        anyhow::ensure!(welcome.typ == EnvelopeType::Welcome, "expected WELCOME, got {:?}", welcome.typ);
        let payload: relay_protocol::WelcomePayload = welcome.payload_as()?;

        Ok(Self { stream, decoder, session_id: payload.session_id, resume_token: payload.resume_token })
    }

    pub async fn send(&mut self, env: &Envelope) -> anyhow::Result<()> {
        self.stream.write_all(&encode_frame(env, FrameMode::Current(Codec::Json))?).await?;
        Ok(())
    }

    /// Read the next envelope, blocking on socket reads as needed.
    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(env) = self.decoder.next_envelope()? {
                return Ok(env);
            }
            let n = self.stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "connection closed");
            self.decoder.feed(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::SendPayload;

    #[tokio::test]
    async fn handshake_and_message_round_trip() {
        let daemon = TestDaemon::start().await.unwrap();
        let mut alice = daemon.connect("Alice").await.unwrap();
        let mut bob = daemon.connect("Bob").await.unwrap();

        let send = Envelope::new(EnvelopeType::Send, SendPayload::message("hi"))
            .with_from("Alice")
            .with_to("Bob");
        alice.send(&send).await.unwrap();

        let deliver = bob.recv().await.unwrap();
        assert_eq!(deliver.typ, EnvelopeType::Deliver);
        let payload: SendPayload = deliver.payload_as().unwrap();
        assert_eq!(payload.body, "hi");
    }
}
