//! Loopback end-to-end tests for the TCP reference listener: INIT
//! registration, the task pump, EXFIL streams, and the failure path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use umbra_c2::crypto;
use umbra_c2::database::Storage;
use umbra_c2::extender::{AgentInfo, Extender, ListenerInfo};
use umbra_c2::modules::beacon::{BeaconInfo, BeaconModule, ReplyBatch, TaskBatch, WireReply};
use umbra_c2::modules::tcp::{TcpListenerModule, TcpProfile};
use umbra_c2::protocol::{
    recv_frame, send_frame, Envelope, InitPack, StreamPack, EXFIL_PACK, INIT_PACK,
};
use umbra_c2::server::agent::OsKind;
use umbra_c2::tasks::{TaskData, TaskType};
use umbra_c2::Teamserver;

const LISTENER_SEED: &[u8] = b"listener-secret";
const WATERMARK: &str = "11223344";
const AGENT_ID: &str = "0a0b0c0d";

struct Harness {
    ts: Arc<Teamserver>,
    tcp: Arc<TcpListenerModule>,
    listener_key: [u8; 32],
    beacon_key: [u8; 32],
    _state_dir: tempfile::TempDir,
}

fn build_harness(banner: &str) -> Harness {
    let state_dir = tempfile::tempdir().unwrap();

    let mut extender = Extender::load(&[], &HashMap::new(), Path::new("/tmp"));
    extender.register_agent(
        AgentInfo {
            name: "beacon".to_string(),
            watermark: WATERMARK.to_string(),
            ax: String::new(),
            listeners: vec!["tcp".to_string()],
        },
        Arc::new(BeaconModule::new(WATERMARK)),
    );
    let tcp = TcpListenerModule::new(state_dir.path());
    extender.register_listener(
        ListenerInfo {
            name: "umbra-tcp".to_string(),
            listener_type: "tcp".to_string(),
            protocol: "mtls".to_string(),
            ax: String::new(),
        },
        tcp.clone(),
    );

    let ts = Arc::new(Teamserver::new(extender, Storage::null()));

    let listener_key = crypto::derive_key(LISTENER_SEED);
    let key_hex: String = listener_key.iter().map(|b| format!("{:02x}", b)).collect();
    let profile = TcpProfile {
        host_bind: "127.0.0.1".to_string(),
        port_bind: 0,
        ssl: false,
        ca_cert: String::new(),
        server_cert: String::new(),
        server_key: String::new(),
        client_cert: String::new(),
        client_key: String::new(),
        tcp_banner: banner.to_string(),
        error_answer: "ERR".to_string(),
        timeout: 5,
        protocol: "tcp-aesgcm".to_string(),
        encrypt_key: key_hex,
    };
    Arc::clone(&ts)
        .ts_listener_start("tcp1", "tcp/mtls/umbra-tcp", &serde_json::to_vec(&profile).unwrap())
        .unwrap();

    Harness {
        ts,
        tcp,
        listener_key,
        beacon_key: crypto::derive_key(WATERMARK.as_bytes()),
        _state_dir: state_dir,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn send_init(harness: &Harness, stream: &mut TcpStream) {
    let beacon = rmp_serde::to_vec_named(&BeaconInfo {
        computer: "ws01".to_string(),
        username: "alice".to_string(),
        os: 2,
    })
    .unwrap();
    let init = InitPack {
        id: 0x0a0b0c0d,
        agent_type: 0x11223344,
        data: Bytes::from(beacon),
    };
    let envelope = Envelope {
        id: INIT_PACK,
        data: Bytes::from(init.to_msgpack().unwrap()),
    };
    let ciphertext = crypto::encrypt_data(&harness.listener_key, &envelope.to_msgpack().unwrap())
        .unwrap();
    send_frame(stream, &ciphertext).await.unwrap();
}

async fn recv_batch(harness: &Harness, stream: &mut TcpStream) -> TaskBatch {
    let frame = timeout(Duration::from_secs(5), recv_frame(stream))
        .await
        .unwrap()
        .unwrap();
    let plain = crypto::decrypt_data(&harness.beacon_key, &frame).unwrap();
    rmp_serde::from_slice(&plain).unwrap()
}

async fn send_replies(harness: &Harness, stream: &mut TcpStream, replies: Vec<WireReply>) {
    let encoded = rmp_serde::to_vec_named(&ReplyBatch { replies }).unwrap();
    let ciphertext = crypto::encrypt_data(&harness.beacon_key, &encoded).unwrap();
    send_frame(stream, &ciphertext).await.unwrap();
}

#[tokio::test]
async fn init_pump_and_disconnect() {
    let harness = build_harness("");
    let addr = harness.tcp.local_addr("tcp1").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_init(&harness, &mut stream).await;

    let ts = harness.ts.clone();
    wait_until(move || ts.ts_agent_is_exists(AGENT_ID)).await;

    let data = harness.ts.agent_data(AGENT_ID).unwrap();
    assert_eq!(data.computer, "ws01");
    assert_eq!(data.username, "alice");
    assert_eq!(data.os, OsKind::Linux);
    assert_eq!(data.listener, "tcp1");
    assert_eq!(data.external_ip, "127.0.0.1");

    let mut task = TaskData::with_type(TaskType::Task);
    task.task_id = "cafe1234".to_string();
    task.sync = true;
    task.data = b"payload".to_vec();
    harness.ts.task_create(AGENT_ID, "pwd", "op1", task);

    let batch = recv_batch(&harness, &mut stream).await;
    assert_eq!(batch.tasks.len(), 1);
    assert_eq!(batch.tasks[0].id, "cafe1234");
    assert_eq!(batch.tasks[0].data.as_ref(), b"payload");

    send_replies(
        &harness,
        &mut stream,
        vec![WireReply {
            task_id: "cafe1234".to_string(),
            message_type: 1,
            message: "done".to_string(),
            clear_text: String::new(),
            completed: true,
        }],
    )
    .await;

    let ts = harness.ts.clone();
    wait_until(move || {
        ts.ts_task_list(AGENT_ID)
            .map(|l| l.completed.len() == 1)
            .unwrap_or(false)
    })
    .await;
    let listing = harness.ts.ts_task_list(AGENT_ID).unwrap();
    assert_eq!(listing.completed[0].message, "done");
    assert!(listing.running.is_empty());

    // Stopping the listener cancels the pump, closes the socket and marks
    // the agent.
    harness.ts.ts_listener_stop("tcp1").unwrap();
    let ts = harness.ts.clone();
    wait_until(move || !ts.ts_agent_is_active(AGENT_ID).unwrap()).await;
    assert_eq!(harness.ts.ts_agent_mark(AGENT_ID).unwrap(), "Disconnect");

    let eof = timeout(Duration::from_secs(5), recv_frame(&mut stream)).await;
    assert!(matches!(eof, Ok(Err(_))));
}

#[tokio::test]
async fn exfil_stream_feeds_running_job() {
    let harness = build_harness("");
    let addr = harness.tcp.local_addr("tcp1").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_init(&harness, &mut stream).await;
    let ts = harness.ts.clone();
    wait_until(move || ts.ts_agent_is_exists(AGENT_ID)).await;

    let mut job = TaskData::with_type(TaskType::Job);
    job.task_id = "feed0001".to_string();
    job.sync = true;
    job.data = b"job-spec".to_vec();
    harness.ts.task_create(AGENT_ID, "shell tail", "op1", job);

    // Drain the batch on the agent connection and keep the pump alive with
    // an empty reply.
    let batch = recv_batch(&harness, &mut stream).await;
    assert_eq!(batch.tasks[0].id, "feed0001");
    send_replies(&harness, &mut stream, Vec::new()).await;

    let ts = harness.ts.clone();
    wait_until(move || ts.task_running_exists(AGENT_ID, "feed0001")).await;

    // Dedicated EXFIL connection for the job output.
    let mut exfil = TcpStream::connect(addr).await.unwrap();
    let pack = StreamPack {
        id: 0x0a0b0c0d,
        task: "feed0001".to_string(),
    };
    let envelope = Envelope {
        id: EXFIL_PACK,
        data: Bytes::from(pack.to_msgpack().unwrap()),
    };
    let ciphertext = crypto::encrypt_data(&harness.listener_key, &envelope.to_msgpack().unwrap())
        .unwrap();
    send_frame(&mut exfil, &ciphertext).await.unwrap();

    let encoded = rmp_serde::to_vec_named(&ReplyBatch {
        replies: vec![WireReply {
            task_id: "feed0001".to_string(),
            message_type: 0,
            message: String::new(),
            clear_text: "chunk".to_string(),
            completed: false,
        }],
    })
    .unwrap();
    let frame = crypto::encrypt_data(&harness.beacon_key, &encoded).unwrap();
    send_frame(&mut exfil, &frame).await.unwrap();

    let ts = harness.ts.clone();
    wait_until(move || {
        ts.ts_task_list(AGENT_ID)
            .map(|l| l.running.iter().any(|t| t.clear_text == "chunk"))
            .unwrap_or(false)
    })
    .await;

    harness.ts.ts_listener_stop("tcp1").unwrap();
}

#[tokio::test]
async fn exfil_for_unknown_task_is_refused() {
    let harness = build_harness("");
    let addr = harness.tcp.local_addr("tcp1").unwrap();

    let mut exfil = TcpStream::connect(addr).await.unwrap();
    let pack = StreamPack {
        id: 0x0a0b0c0d,
        task: "no-such-task".to_string(),
    };
    let envelope = Envelope {
        id: EXFIL_PACK,
        data: Bytes::from(pack.to_msgpack().unwrap()),
    };
    let ciphertext = crypto::encrypt_data(&harness.listener_key, &envelope.to_msgpack().unwrap())
        .unwrap();
    send_frame(&mut exfil, &ciphertext).await.unwrap();

    let mut answer = [0u8; 3];
    timeout(Duration::from_secs(5), exfil.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer, b"ERR");

    harness.ts.ts_listener_stop("tcp1").unwrap();
}

#[tokio::test]
async fn banner_then_garbage_gets_error_answer() {
    let harness = build_harness("HELLO");
    let addr = harness.tcp.local_addr("tcp1").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut banner = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut banner))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&banner, b"HELLO");

    // Framed but not encrypted with the listener key.
    send_frame(&mut stream, b"definitely not ciphertext")
        .await
        .unwrap();

    let mut answer = [0u8; 3];
    timeout(Duration::from_secs(5), stream.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer, b"ERR");

    harness.ts.ts_listener_stop("tcp1").unwrap();
}

#[tokio::test]
async fn reconnect_clears_disconnect_mark() {
    let harness = build_harness("");
    let addr = harness.tcp.local_addr("tcp1").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_init(&harness, &mut stream).await;
    let ts = harness.ts.clone();
    wait_until(move || ts.ts_agent_is_exists(AGENT_ID)).await;

    drop(stream);
    let ts = harness.ts.clone();
    wait_until(move || !ts.ts_agent_is_active(AGENT_ID).unwrap()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_init(&harness, &mut stream).await;
    let ts = harness.ts.clone();
    wait_until(move || ts.ts_agent_is_active(AGENT_ID).unwrap()).await;
    assert!(harness.ts.ts_agent_mark(AGENT_ID).unwrap().is_empty());

    harness.ts.ts_listener_stop("tcp1").unwrap();
}
