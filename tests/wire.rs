//! Wire-level properties: framing, envelope encoding, and the AES-GCM layer
//! composed the way the reference listener uses them.

use bytes::Bytes;
use umbra_c2::crypto;
use umbra_c2::protocol::{recv_frame, send_frame, Envelope, InitPack, INIT_PACK};

#[tokio::test]
async fn framed_encrypted_envelope_roundtrip() {
    let key = crypto::derive_key(b"listener-secret");

    let init = InitPack {
        id: 0x0a0b0c0d,
        agent_type: 0x11223344,
        data: Bytes::from_static(b"beacon-blob"),
    };
    let envelope = Envelope {
        id: INIT_PACK,
        data: Bytes::from(init.to_msgpack().unwrap()),
    };

    let ciphertext = crypto::encrypt_data(&key, &envelope.to_msgpack().unwrap()).unwrap();

    let (mut client, mut server) = tokio::io::duplex(4096);
    send_frame(&mut client, &ciphertext).await.unwrap();

    let frame = recv_frame(&mut server).await.unwrap();
    let plain = crypto::decrypt_data(&key, &frame).unwrap();
    let decoded = Envelope::from_msgpack(&plain).unwrap();
    assert_eq!(decoded.id, INIT_PACK);

    let inner = InitPack::from_msgpack(&decoded.data).unwrap();
    assert_eq!(format!("{:08x}", inner.id), "0a0b0c0d");
    assert_eq!(format!("{:08x}", inner.agent_type), "11223344");
    assert_eq!(inner.data.as_ref(), b"beacon-blob");
}

#[tokio::test]
async fn tampered_frame_fails_decrypt() {
    let key = crypto::derive_key(b"listener-secret");
    let mut ciphertext = crypto::encrypt_data(&key, b"payload").unwrap();
    ciphertext[20] ^= 0xff;

    let (mut client, mut server) = tokio::io::duplex(1024);
    send_frame(&mut client, &ciphertext).await.unwrap();
    let frame = recv_frame(&mut server).await.unwrap();
    assert!(crypto::decrypt_data(&key, &frame).is_err());
}

#[test]
fn nonces_are_unique_per_message() {
    let key = crypto::derive_key(b"listener-secret");
    let a = crypto::encrypt_data(&key, b"same plaintext").unwrap();
    let b = crypto::encrypt_data(&key, b"same plaintext").unwrap();
    assert_ne!(a, b);
    assert_ne!(&a[..12], &b[..12]);
}
