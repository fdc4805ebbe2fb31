//! Handshake state machine and encrypted channel, driven message-by-message
//! between two in-memory endpoints.

use bitarmor::crypto::secp::{generate_privkey, pubkey_from_privkey};
use bitarmor::crypto::SecureBytes;
use bitarmor::error::WalletError;
use bitarmor::transport::{
    identity_fingerprint, HandshakeMessage, HandshakeState, IdentityConfig, PeerSession, Role,
};

struct Identity {
    privkey: SecureBytes,
    pubkey: Vec<u8>,
}

fn identity() -> Identity {
    let privkey = generate_privkey();
    let pubkey = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
    Identity { privkey, pubkey }
}

fn config(own: &Identity, peers: Vec<Vec<u8>>, one_way: bool) -> IdentityConfig {
    IdentityConfig {
        identity_privkey: own.privkey.to_owned_secret(),
        identity_pubkey: own.pubkey.clone(),
        known_peers: peers,
        one_way,
    }
}

/// Shuttle messages between the two endpoints until both go quiet.
fn pump(client: &mut PeerSession, server: &mut PeerSession) -> Result<(), WalletError> {
    let mut to_server = vec![client.start()?];

    loop {
        let mut to_client = Vec::new();
        for message in to_server.drain(..) {
            to_client.extend(server.process(message)?);
        }
        server.messages_sent()?;
        if to_client.is_empty() {
            break;
        }

        let mut next_to_server = Vec::new();
        for message in to_client {
            next_to_server.extend(client.process(message)?);
        }
        client.messages_sent()?;
        if next_to_server.is_empty() {
            break;
        }
        to_server = next_to_server;
    }
    Ok(())
}

fn mutual_pair() -> (PeerSession, PeerSession) {
    let client_id = identity();
    let server_id = identity();
    let client = PeerSession::new(
        Role::Client,
        config(&client_id, vec![server_id.pubkey.clone()], false),
    );
    let server = PeerSession::new(
        Role::Server,
        config(&server_id, vec![client_id.pubkey.clone()], false),
    );
    (client, server)
}

// Scenario: two mutually authorised parties complete the handshake, then
// exchange one encrypted ping; a flipped ciphertext byte is fatal.
#[test]
fn mutual_handshake_and_ping() {
    let (mut client, mut server) = mutual_pair();
    pump(&mut client, &mut server).unwrap();
    assert_eq!(client.state(), HandshakeState::Success);
    assert_eq!(server.state(), HandshakeState::Success);

    // ping round trip over the established channel
    let ping = client.outbound.as_mut().unwrap().encrypt_frame(b"ping").unwrap();
    let received = server.inbound.as_mut().unwrap().decrypt_whole_frame(&ping).unwrap();
    assert_eq!(received, b"ping");

    let pong = server.outbound.as_mut().unwrap().encrypt_frame(b"pong").unwrap();
    let received = client.inbound.as_mut().unwrap().decrypt_whole_frame(&pong).unwrap();
    assert_eq!(received, b"pong");

    // flip the last ciphertext byte: MAC failure, session dead
    let mut tampered = client.outbound.as_mut().unwrap().encrypt_frame(b"ping").unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    let err = server
        .inbound
        .as_mut()
        .unwrap()
        .decrypt_whole_frame(&tampered)
        .unwrap_err();
    assert!(matches!(err, WalletError::IntegrityFailure(_)));
}

#[test]
fn unknown_server_identity_is_rejected() {
    let client_id = identity();
    let server_id = identity();
    let stranger = identity();

    // client expects a different server
    let mut client = PeerSession::new(
        Role::Client,
        config(&client_id, vec![stranger.pubkey.clone()], false),
    );
    let mut server = PeerSession::new(
        Role::Server,
        config(&server_id, vec![client_id.pubkey.clone()], false),
    );

    let err = pump(&mut client, &mut server).unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
    assert_eq!(client.state(), HandshakeState::Error);
}

#[test]
fn unknown_client_rejected_in_mutual_mode() {
    let client_id = identity();
    let server_id = identity();

    let mut client = PeerSession::new(
        Role::Client,
        config(&client_id, vec![server_id.pubkey.clone()], false),
    );
    // server has nobody authorised
    let mut server = PeerSession::new(Role::Server, config(&server_id, Vec::new(), false));

    let err = pump(&mut client, &mut server).unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
    assert_eq!(server.state(), HandshakeState::Error);
}

#[test]
fn one_way_mode_accepts_anonymous_client() {
    let client_id = identity();
    let server_id = identity();

    let mut client = PeerSession::new(
        Role::Client,
        config(&client_id, vec![server_id.pubkey.clone()], true),
    );
    let mut server = PeerSession::new(Role::Server, config(&server_id, Vec::new(), true));

    pump(&mut client, &mut server).unwrap();
    assert!(client.is_established());
    assert!(server.is_established());

    // channel still works and is authenticated against the server identity
    let frame = client.outbound.as_mut().unwrap().encrypt_frame(b"hello").unwrap();
    assert_eq!(
        server.inbound.as_mut().unwrap().decrypt_whole_frame(&frame).unwrap(),
        b"hello"
    );
}

#[test]
fn out_of_order_message_is_terminal() {
    let (mut client, mut server) = mutual_pair();

    // server receives a Challenge1 before any EncInit
    let err = server.process(HandshakeMessage::Challenge1([0u8; 32])).unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
    assert_eq!(server.state(), HandshakeState::Error);

    // every subsequent message is rejected outright
    let init = client.start().unwrap();
    let err = server.process(init).unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
    assert_eq!(server.state(), HandshakeState::Error);
}

#[test]
fn replayed_success_is_rejected() {
    let (mut client, mut server) = mutual_pair();
    pump(&mut client, &mut server).unwrap();

    let err = client.process(HandshakeMessage::Success).unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
    assert_eq!(client.state(), HandshakeState::Error);
}

#[test]
fn session_rekey_keeps_channel_alive() {
    let (mut client, mut server) = mutual_pair();
    pump(&mut client, &mut server).unwrap();

    // a few frames, then an explicit rekey from the client side
    for _ in 0..3 {
        let frame = client.outbound.as_mut().unwrap().encrypt_frame(b"data").unwrap();
        server.inbound.as_mut().unwrap().decrypt_whole_frame(&frame).unwrap();
    }

    let rekey = client.initiate_rekey().unwrap();
    server.process(rekey).unwrap();

    let frame = client.outbound.as_mut().unwrap().encrypt_frame(b"fresh").unwrap();
    assert_eq!(
        server.inbound.as_mut().unwrap().decrypt_whole_frame(&frame).unwrap(),
        b"fresh"
    );
    // counters restarted with the new key
    assert_eq!(client.outbound.as_ref().unwrap().sequence(), 1);
}

#[test]
fn fingerprints_differ_per_identity() {
    let a = identity();
    let b = identity();
    assert_ne!(
        identity_fingerprint(&a.pubkey).unwrap(),
        identity_fingerprint(&b.pubkey).unwrap()
    );
}
