//! Two-stage session setup: an ECDH key agreement that encrypts each
//! direction of the connection, then an optional mutual-identity
//! challenge/response bound to the channel through the session ids.
//!
//! Every state transition is explicit; any out-of-order or malformed
//! message lands in `Error`, which is terminal for the connection.

use tracing::debug;

use crate::crypto::hash::{hmac256, sha256};
use crate::crypto::secp::{
    ecdh_mul, generate_privkey, pubkey_from_privkey, sign_det, verify, PUBKEY_COMPRESSED_LEN,
};
use crate::crypto::SecureBytes;
use crate::error::{Result, WalletError};
use crate::transport::frame::DirectionState;

pub const CIPHER_SUITE_CHACHA20POLY1305: u8 = 0x01;

const CHALLENGE_LEN: usize = 32;
const SIG_LEN: usize = 64;

/// Handshake wire messages. The first `EncInit`/`EncAck` of each direction
/// travel in plaintext; everything after rides inside encrypted frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    EncInit { pubkey: Vec<u8>, cipher_suite: u8 },
    EncAck { pubkey: Vec<u8> },
    /// Mid-session rekey: a fresh `EncAck` inside the stream.
    Rekey { pubkey: Vec<u8> },
    Challenge1([u8; CHALLENGE_LEN]),
    Reply1([u8; SIG_LEN]),
    Propose([u8; CHALLENGE_LEN]),
    Challenge2([u8; CHALLENGE_LEN]),
    Reply2Signature([u8; SIG_LEN]),
    Reply2Anonymous(Vec<u8>),
    Success,
}

/// Progress of one connection's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Inactive,
    EncInit1,
    EncAck1,
    EncInit2,
    EncAck2,
    Challenge1,
    Reply1,
    Propose,
    Challenge2,
    Reply2,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Long-lived identity keys plus the peers we will talk to.
pub struct IdentityConfig {
    pub identity_privkey: SecureBytes,
    pub identity_pubkey: Vec<u8>,
    /// Identity pubkeys of authorised peers.
    pub known_peers: Vec<Vec<u8>>,
    /// Accept anonymous clients (server side) / stay anonymous (client).
    pub one_way: bool,
}

impl IdentityConfig {
    pub fn generate(known_peers: Vec<Vec<u8>>, one_way: bool) -> Result<Self> {
        let identity_privkey = generate_privkey();
        let identity_pubkey = pubkey_from_privkey(identity_privkey.as_slice(), true)?;
        Ok(IdentityConfig { identity_privkey, identity_pubkey, known_peers, one_way })
    }
}

/// One direction's ECDH material, kept so the direction can be rekeyed.
struct ChannelKeys {
    my_privkey: SecureBytes,
    peer_pubkey: Vec<u8>,
    session_id: [u8; 32],
}

impl ChannelKeys {
    fn agree(my_privkey: &SecureBytes, peer_pubkey: &[u8], init_pub: &[u8], ack_pub: &[u8]) -> Result<(SecureBytes, [u8; 32])> {
        let shared = ecdh_mul(peer_pubkey, my_privkey.as_slice())?;
        let key = SecureBytes::from_slice(&sha256(&shared));

        let mut transcript = Vec::with_capacity(init_pub.len() + ack_pub.len());
        transcript.extend_from_slice(init_pub);
        transcript.extend_from_slice(ack_pub);
        Ok((key, sha256(&transcript)))
    }
}

/// One endpoint of the handshake. Drive it with [`PeerSession::start`] and
/// [`PeerSession::process`]; once both report `Success` the direction
/// states carry application traffic.
pub struct PeerSession {
    role: Role,
    state: HandshakeState,
    identity: IdentityConfig,

    outbound_keys: Option<ChannelKeys>,
    inbound_keys: Option<ChannelKeys>,
    pub outbound: Option<DirectionState>,
    pub inbound: Option<DirectionState>,

    /// Client identity pinned by a matched Propose (server side).
    authenticated_peer: Option<Vec<u8>>,
    pending_challenge1: Option<[u8; CHALLENGE_LEN]>,
    pending_challenge2: Option<[u8; CHALLENGE_LEN]>,
    /// Set when `Success` is queued: the completion rekey must wait until
    /// that frame is on the wire.
    completion_rekey_pending: bool,
}

impl PeerSession {
    pub fn new(role: Role, identity: IdentityConfig) -> Self {
        PeerSession {
            role,
            state: HandshakeState::Inactive,
            identity,
            outbound_keys: None,
            inbound_keys: None,
            outbound: None,
            inbound: None,
            authenticated_peer: None,
            pending_challenge1: None,
            pending_challenge2: None,
            completion_rekey_pending: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Success
    }

    fn fail(&mut self, why: &str) -> WalletError {
        self.state = HandshakeState::Error;
        debug!(role = ?self.role, why, "handshake failed");
        WalletError::PermissionDenied(format!("handshake: {why}"))
    }

    fn outbound_session_id(&self) -> Result<[u8; 32]> {
        self.outbound_keys
            .as_ref()
            .map(|c| c.session_id)
            .ok_or_else(|| WalletError::Conflict("outbound channel not established".into()))
    }

    fn inbound_session_id(&self) -> Result<[u8; 32]> {
        self.inbound_keys
            .as_ref()
            .map(|c| c.session_id)
            .ok_or_else(|| WalletError::Conflict("inbound channel not established".into()))
    }

    /// Client entry point: open the outbound direction.
    pub fn start(&mut self) -> Result<HandshakeMessage> {
        if self.role != Role::Client || self.state != HandshakeState::Inactive {
            return Err(self.fail("start from a bad state"));
        }

        let my_privkey = generate_privkey();
        let my_pubkey = pubkey_from_privkey(my_privkey.as_slice(), true)?;
        self.outbound_keys = Some(ChannelKeys {
            my_privkey,
            peer_pubkey: Vec::new(),
            session_id: [0; 32],
        });
        self.state = HandshakeState::EncInit1;
        Ok(HandshakeMessage::EncInit {
            pubkey: my_pubkey,
            cipher_suite: CIPHER_SUITE_CHACHA20POLY1305,
        })
    }

    fn check_pubkey_len(&mut self, pubkey: &[u8]) -> Result<()> {
        if pubkey.len() != PUBKEY_COMPRESSED_LEN {
            return Err(self.fail("bad pubkey length"));
        }
        Ok(())
    }

    /// Feed one incoming message; returns the messages to send back.
    pub fn process(&mut self, message: HandshakeMessage) -> Result<Vec<HandshakeMessage>> {
        if self.state == HandshakeState::Error {
            return Err(WalletError::PermissionDenied(
                "handshake already failed; connection is dead".into(),
            ));
        }

        match (self.role, self.state, message) {
            // server receives the client's EncInit: that direction becomes
            // the server's inbound; server acks then opens its own outbound
            (Role::Server, HandshakeState::Inactive, HandshakeMessage::EncInit { pubkey, cipher_suite }) => {
                self.check_pubkey_len(&pubkey)?;
                if cipher_suite != CIPHER_SUITE_CHACHA20POLY1305 {
                    return Err(self.fail("unknown cipher suite"));
                }

                let my_privkey = generate_privkey();
                let my_pubkey = pubkey_from_privkey(my_privkey.as_slice(), true)?;
                let (key, session_id) =
                    ChannelKeys::agree(&my_privkey, &pubkey, &pubkey, &my_pubkey)?;
                self.inbound_keys =
                    Some(ChannelKeys { my_privkey, peer_pubkey: pubkey, session_id });
                self.inbound =
                    Some(DirectionState::new(key, session_id[..4].try_into().unwrap()));

                // open our outbound direction in the same round
                let out_privkey = generate_privkey();
                let out_pubkey = pubkey_from_privkey(out_privkey.as_slice(), true)?;
                self.outbound_keys = Some(ChannelKeys {
                    my_privkey: out_privkey,
                    peer_pubkey: Vec::new(),
                    session_id: [0; 32],
                });

                self.state = HandshakeState::EncInit2;
                Ok(vec![
                    HandshakeMessage::EncAck { pubkey: my_pubkey },
                    HandshakeMessage::EncInit {
                        pubkey: out_pubkey,
                        cipher_suite: CIPHER_SUITE_CHACHA20POLY1305,
                    },
                ])
            }

            // client receives the ack for its outbound direction
            (Role::Client, HandshakeState::EncInit1, HandshakeMessage::EncAck { pubkey }) => {
                self.check_pubkey_len(&pubkey)?;
                let keys = self.outbound_keys.as_mut().expect("set by start");
                let my_pubkey = pubkey_from_privkey(keys.my_privkey.as_slice(), true)?;
                let (key, session_id) =
                    ChannelKeys::agree(&keys.my_privkey, &pubkey, &my_pubkey, &pubkey)?;
                keys.peer_pubkey = pubkey;
                keys.session_id = session_id;
                self.outbound =
                    Some(DirectionState::new(key, session_id[..4].try_into().unwrap()));
                self.state = HandshakeState::EncAck1;
                Ok(Vec::new())
            }

            // client receives the server's EncInit for the reverse direction
            (Role::Client, HandshakeState::EncAck1, HandshakeMessage::EncInit { pubkey, cipher_suite }) => {
                self.check_pubkey_len(&pubkey)?;
                if cipher_suite != CIPHER_SUITE_CHACHA20POLY1305 {
                    return Err(self.fail("unknown cipher suite"));
                }

                let my_privkey = generate_privkey();
                let my_pubkey = pubkey_from_privkey(my_privkey.as_slice(), true)?;
                let (key, session_id) =
                    ChannelKeys::agree(&my_privkey, &pubkey, &pubkey, &my_pubkey)?;
                self.inbound_keys =
                    Some(ChannelKeys { my_privkey, peer_pubkey: pubkey, session_id });
                self.inbound =
                    Some(DirectionState::new(key, session_id[..4].try_into().unwrap()));

                self.state = HandshakeState::EncAck2;

                // both directions up: issue the identity challenge
                let challenge = hmac256(&self.identity.identity_pubkey, &{
                    let mut msg = b"i".to_vec();
                    msg.extend_from_slice(&self.outbound_session_id()?);
                    msg
                });
                self.pending_challenge1 = Some(challenge);
                self.state = HandshakeState::Challenge1;
                Ok(vec![
                    HandshakeMessage::EncAck { pubkey: my_pubkey },
                    HandshakeMessage::Challenge1(challenge),
                ])
            }

            // server receives the ack for its outbound direction
            (Role::Server, HandshakeState::EncInit2, HandshakeMessage::EncAck { pubkey }) => {
                self.check_pubkey_len(&pubkey)?;
                let keys = self.outbound_keys.as_mut().expect("set on EncInit");
                let my_pubkey = pubkey_from_privkey(keys.my_privkey.as_slice(), true)?;
                let (key, session_id) =
                    ChannelKeys::agree(&keys.my_privkey, &pubkey, &my_pubkey, &pubkey)?;
                keys.peer_pubkey = pubkey;
                keys.session_id = session_id;
                self.outbound =
                    Some(DirectionState::new(key, session_id[..4].try_into().unwrap()));
                self.state = HandshakeState::EncAck2;
                Ok(Vec::new())
            }

            // server: the client challenges us to prove our identity
            (Role::Server, HandshakeState::EncAck2, HandshakeMessage::Challenge1(challenge)) => {
                let signature = sign_det(&challenge, self.identity.identity_privkey.as_slice())?;
                self.state = HandshakeState::Reply1;
                Ok(vec![HandshakeMessage::Reply1(signature)])
            }

            // client: verify the server's signature against the expected
            // identity, then propose our own
            (Role::Client, HandshakeState::Challenge1, HandshakeMessage::Reply1(signature)) => {
                let challenge = self.pending_challenge1.take().expect("set with Challenge1");
                let server_identity = self
                    .identity
                    .known_peers
                    .iter()
                    .find(|peer| verify(&challenge, &signature, peer))
                    .cloned();
                let Some(server_identity) = server_identity else {
                    return Err(self.fail("server identity not recognised"));
                };
                self.authenticated_peer = Some(server_identity);

                let mut msg = b"p".to_vec();
                msg.extend_from_slice(&self.inbound_session_id()?);
                msg.extend_from_slice(&self.outbound_session_id()?);
                let propose = hmac256(&self.identity.identity_pubkey, &msg);
                self.state = HandshakeState::Propose;
                Ok(vec![HandshakeMessage::Propose(propose)])
            }

            // server: match the propose against the authorised peer set
            (Role::Server, HandshakeState::Reply1, HandshakeMessage::Propose(propose)) => {
                // the client's inbound is our outbound and vice versa
                let mut msg = b"p".to_vec();
                msg.extend_from_slice(&self.outbound_session_id()?);
                msg.extend_from_slice(&self.inbound_session_id()?);

                let matched = self
                    .identity
                    .known_peers
                    .iter()
                    .find(|peer| hmac256(peer, &msg) == propose)
                    .cloned();

                let challenge_key = match (&matched, self.identity.one_way) {
                    (Some(peer), _) => {
                        self.authenticated_peer = Some(peer.clone());
                        peer.clone()
                    }
                    // anonymous client: key the challenge with our own
                    // identity, which both ends know
                    (None, true) => self.identity.identity_pubkey.clone(),
                    (None, false) => return Err(self.fail("client proposal not recognised")),
                };

                let mut msg = b"c".to_vec();
                msg.extend_from_slice(&self.outbound_session_id()?);
                msg.extend_from_slice(&self.inbound_session_id()?);
                let challenge = hmac256(&challenge_key, &msg);
                self.pending_challenge2 = Some(challenge);
                self.state = HandshakeState::Challenge2;
                Ok(vec![HandshakeMessage::Challenge2(challenge)])
            }

            // client: answer the identity challenge. The server keyed it
            // with our identity if it recognised us, or with its own in
            // anonymous mode; which one tells us how to reply.
            (Role::Client, HandshakeState::Propose, HandshakeMessage::Challenge2(challenge)) => {
                let mut msg = b"c".to_vec();
                msg.extend_from_slice(&self.inbound_session_id()?);
                msg.extend_from_slice(&self.outbound_session_id()?);

                let recognised = hmac256(&self.identity.identity_pubkey, &msg) == challenge;
                let anonymous = !recognised
                    && self.identity.one_way
                    && self
                        .authenticated_peer
                        .as_deref()
                        .is_some_and(|server| hmac256(server, &msg) == challenge);
                if !recognised && !anonymous {
                    return Err(self.fail("challenge does not match this session"));
                }

                self.state = HandshakeState::Reply2;
                if anonymous {
                    Ok(vec![HandshakeMessage::Reply2Anonymous(
                        self.identity.identity_pubkey.clone(),
                    )])
                } else {
                    let signature =
                        sign_det(&challenge, self.identity.identity_privkey.as_slice())?;
                    Ok(vec![HandshakeMessage::Reply2Signature(signature)])
                }
            }

            // server: verify the client's reply and close the handshake
            (Role::Server, HandshakeState::Challenge2, reply) => {
                let challenge = self.pending_challenge2.take().expect("set with Challenge2");
                match reply {
                    HandshakeMessage::Reply2Signature(signature) => {
                        let Some(peer) = self.authenticated_peer.clone() else {
                            return Err(self.fail("signature from an anonymous client"));
                        };
                        if !verify(&challenge, &signature, &peer) {
                            return Err(self.fail("client signature rejected"));
                        }
                    }
                    HandshakeMessage::Reply2Anonymous(pubkey) => {
                        if !self.identity.one_way {
                            return Err(self.fail("anonymous reply in mutual mode"));
                        }
                        self.check_pubkey_len(&pubkey)?;
                        self.authenticated_peer = Some(pubkey);
                    }
                    _ => return Err(self.fail("unexpected reply to challenge")),
                }

                // Success must leave under the pre-rekey key; the caller
                // runs messages_sent() once it is on the wire
                self.state = HandshakeState::Success;
                self.completion_rekey_pending = true;
                Ok(vec![HandshakeMessage::Success])
            }

            // client: server confirmed; mix identities into the keys
            (Role::Client, HandshakeState::Reply2, HandshakeMessage::Success) => {
                self.finish_with_rekey()?;
                Ok(Vec::new())
            }

            // explicit mid-session rekey of our inbound direction
            (_, HandshakeState::Success, HandshakeMessage::Rekey { pubkey }) => {
                self.check_pubkey_len(&pubkey)?;
                let keys = self
                    .inbound_keys
                    .as_mut()
                    .ok_or_else(|| WalletError::Conflict("no inbound channel".into()))?;
                let shared = ecdh_mul(&pubkey, keys.my_privkey.as_slice())?;
                keys.peer_pubkey = pubkey;
                self.inbound
                    .as_mut()
                    .expect("established with keys")
                    .rekey(SecureBytes::from_slice(&sha256(&shared)));
                Ok(Vec::new())
            }

            // anything else is a protocol violation and kills the session
            (_, _, message) => {
                Err(self.fail(&format!("unexpected message {message:?}")))
            }
        }
    }

    /// Hook for the transport layer: call after the replies returned by
    /// [`process`](Self::process) have been written out. Runs the deferred
    /// handshake-completion rekey when one is pending.
    pub fn messages_sent(&mut self) -> Result<()> {
        if self.completion_rekey_pending {
            self.completion_rekey_pending = false;
            self.finish_with_rekey()?;
        }
        Ok(())
    }

    /// Trigger a rekey of our outbound direction; send the returned message
    /// inside the current encrypted stream.
    pub fn initiate_rekey(&mut self) -> Result<HandshakeMessage> {
        if self.state != HandshakeState::Success {
            return Err(self.fail("rekey before handshake completion"));
        }
        let keys = self
            .outbound_keys
            .as_mut()
            .ok_or_else(|| WalletError::Conflict("no outbound channel".into()))?;

        let fresh_privkey = generate_privkey();
        let fresh_pubkey = pubkey_from_privkey(fresh_privkey.as_slice(), true)?;
        let shared = ecdh_mul(&keys.peer_pubkey, fresh_privkey.as_slice())?;
        keys.my_privkey = fresh_privkey;
        self.outbound
            .as_mut()
            .expect("established with keys")
            .rekey(SecureBytes::from_slice(&sha256(&shared)));
        Ok(HandshakeMessage::Rekey { pubkey: fresh_pubkey })
    }

    /// Handshake-completion rekey: fold both identity pubkeys into each
    /// direction's key so session keys cannot replay across identities.
    fn finish_with_rekey(&mut self) -> Result<()> {
        let peer_identity = self
            .authenticated_peer
            .clone()
            .unwrap_or_else(|| self.identity.identity_pubkey.clone());

        let (client_identity, server_identity) = match self.role {
            Role::Client => (self.identity.identity_pubkey.clone(), peer_identity),
            Role::Server => (peer_identity, self.identity.identity_pubkey.clone()),
        };

        let mix = |direction: &mut DirectionState, keys: &ChannelKeys| {
            let mut material = keys.session_id.to_vec();
            material.extend_from_slice(&client_identity);
            material.extend_from_slice(&server_identity);
            direction.rekey_mixed(&material);
        };

        match (&mut self.outbound, &self.outbound_keys) {
            (Some(direction), Some(keys)) => mix(direction, keys),
            _ => return Err(WalletError::Conflict("outbound channel missing".into())),
        }
        match (&mut self.inbound, &self.inbound_keys) {
            (Some(direction), Some(keys)) => mix(direction, keys),
            _ => return Err(WalletError::Conflict("inbound channel missing".into())),
        }

        self.state = HandshakeState::Success;
        debug!(role = ?self.role, "handshake complete");
        Ok(())
    }
}
