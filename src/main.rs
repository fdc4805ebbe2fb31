//! `bitarmord`: wallet/indexer daemon. Opens (or creates) the wallet
//! directory, then serves authenticated, encrypted peer connections.
//!
//! Exit codes: 0 normal, 1 fatal startup (bad config / port collision),
//! 2 authentication attempts exceeded.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use bitarmor::config::{Config, Network};
use bitarmor::crypto::os_random;
use bitarmor::error::WalletError;
use bitarmor::transport::frame::LEN_PREFIX;
use bitarmor::transport::{
    identity_fingerprint, HandshakeMessage, IdentityConfig, PeerSession, Role,
};

const EXIT_FATAL_STARTUP: u8 = 1;
const EXIT_AUTH_EXCEEDED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "bitarmord", about = "bitarmor wallet and indexer daemon")]
struct Args {
    /// Data directory (wallet file, logs, cookie)
    #[arg(long, env = "BITARMOR_DATADIR")]
    datadir: Option<PathBuf>,

    /// Network: mainnet, testnet or regtest
    #[arg(long, env = "BITARMOR_NETWORK")]
    network: Option<String>,

    /// Listen port for peer connections
    #[arg(long, env = "BITARMOR_PORT")]
    port: Option<u16>,

    /// Write a one-shot auth cookie under the data directory
    #[arg(long, env = "BITARMOR_COOKIE")]
    cookie: bool,
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(datadir) = &args.datadir {
        config.data_dir = datadir.clone();
    }
    if let Some(network) = &args.network {
        config.network = Network::parse(network)?;
        config.listen_port = config.network.default_port();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.cookie_file = config.cookie_file || args.cookie;
    Ok(config)
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_path())
        .context("opening log file")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(move || log_file.try_clone().expect("log file handle"))
        .with_ansi(false)
        .init();
    Ok(())
}

fn write_cookie(config: &Config) -> anyhow::Result<()> {
    let cookie = hex::encode(os_random(32).as_slice());
    let path = config.data_dir.join("cookie");
    std::fs::write(&path, cookie)?;
    info!(path = %path.display(), "wrote auth cookie");
    Ok(())
}

/// Serve one peer: run the server side of the handshake over the socket,
/// then echo encrypted pings until the peer hangs up.
fn serve_peer(stream: TcpStream, identity: Arc<IdentityConfig>) -> anyhow::Result<()> {
    let mut stream = stream;
    let identity = IdentityConfig {
        identity_privkey: identity.identity_privkey.to_owned_secret(),
        identity_pubkey: identity.identity_pubkey.clone(),
        known_peers: identity.known_peers.clone(),
        one_way: identity.one_way,
    };
    let mut session = PeerSession::new(Role::Server, identity);

    // setup phase one: EncInit/EncAck travel in plaintext until both
    // directions carry keys
    while session.inbound.is_none() || session.outbound.is_none() {
        let mut len_buf = [0u8; LEN_PREFIX];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > 1024 {
            anyhow::bail!("oversized handshake message");
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;

        let message = decode_handshake_message(&body)?;
        for reply in session.process(message)? {
            let encoded = encode_handshake_message(&reply);
            stream.write_all(&(encoded.len() as u32).to_le_bytes())?;
            stream.write_all(&encoded)?;
        }
    }

    // setup phase two: identity messages ride the encrypted channel
    while !session.is_established() {
        let mut len_buf = [0u8; LEN_PREFIX];
        stream.read_exact(&mut len_buf)?;
        let len = session.inbound.as_mut().expect("keys set").decrypt_length(&len_buf)?;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        let payload = session.inbound.as_mut().expect("keys set").decrypt_frame(&body)?;

        let message = decode_handshake_message(&payload)?;
        for reply in session.process(message)? {
            let encoded = encode_handshake_message(&reply);
            let frame =
                session.outbound.as_mut().expect("keys set").encrypt_frame(&encoded)?;
            stream.write_all(&frame)?;
        }
        session.messages_sent()?;
    }
    info!("peer session established");

    // encrypted echo loop
    loop {
        let mut len_buf = [0u8; LEN_PREFIX];
        if stream.read_exact(&mut len_buf).is_err() {
            return Ok(()); // peer closed
        }
        let inbound = session.inbound.as_mut().expect("established");
        let len = inbound.decrypt_length(&len_buf)?;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        let payload = inbound.decrypt_frame(&body)?;

        let outbound = session.outbound.as_mut().expect("established");
        let frame = outbound.encrypt_frame(&payload)?;
        stream.write_all(&frame)?;
    }
}

/// Minimal tag-byte wire shape for handshake messages.
fn encode_handshake_message(message: &HandshakeMessage) -> Vec<u8> {
    use HandshakeMessage::*;
    let mut out = Vec::with_capacity(70);
    match message {
        EncInit { pubkey, cipher_suite } => {
            out.push(0x01);
            out.extend_from_slice(pubkey);
            out.push(*cipher_suite);
        }
        EncAck { pubkey } => {
            out.push(0x02);
            out.extend_from_slice(pubkey);
        }
        Rekey { pubkey } => {
            out.push(0x03);
            out.extend_from_slice(pubkey);
        }
        Challenge1(c) => {
            out.push(0x04);
            out.extend_from_slice(c);
        }
        Reply1(s) => {
            out.push(0x05);
            out.extend_from_slice(s);
        }
        Propose(c) => {
            out.push(0x06);
            out.extend_from_slice(c);
        }
        Challenge2(c) => {
            out.push(0x07);
            out.extend_from_slice(c);
        }
        Reply2Signature(s) => {
            out.push(0x08);
            out.extend_from_slice(s);
        }
        Reply2Anonymous(p) => {
            out.push(0x09);
            out.extend_from_slice(p);
        }
        Success => out.push(0x0A),
    }
    out
}

fn decode_handshake_message(body: &[u8]) -> anyhow::Result<HandshakeMessage> {
    use HandshakeMessage::*;
    let (&tag, rest) = body.split_first().context("empty handshake message")?;
    let message = match (tag, rest.len()) {
        (0x01, 34) => EncInit { pubkey: rest[..33].to_vec(), cipher_suite: rest[33] },
        (0x02, 33) => EncAck { pubkey: rest.to_vec() },
        (0x03, 33) => Rekey { pubkey: rest.to_vec() },
        (0x04, 32) => Challenge1(rest.try_into().unwrap()),
        (0x05, 64) => Reply1(rest.try_into().unwrap()),
        (0x06, 32) => Propose(rest.try_into().unwrap()),
        (0x07, 32) => Challenge2(rest.try_into().unwrap()),
        (0x08, 64) => Reply2Signature(rest.try_into().unwrap()),
        (0x09, 33) => Reply2Anonymous(rest.to_vec()),
        (0x0A, 0) => Success,
        _ => anyhow::bail!("malformed handshake message"),
    };
    Ok(message)
}

fn run(config: Config) -> anyhow::Result<u8> {
    if config.cookie_file {
        write_cookie(&config)?;
    }

    // accept anonymous clients; their identity arrives in Reply2
    let identity = Arc::new(
        IdentityConfig::generate(Vec::new(), true)
            .map_err(|e| anyhow::anyhow!("identity setup: {e}"))?,
    );
    info!(
        fingerprint = %identity_fingerprint(&identity.identity_pubkey)
            .unwrap_or_default(),
        "server identity"
    );

    let listener = TcpListener::bind(("127.0.0.1", config.listen_port))
        .with_context(|| format!("binding port {}", config.listen_port))?;
    info!(port = config.listen_port, network = ?config.network, "listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let identity = identity.clone();
        std::thread::spawn(move || {
            if let Err(e) = serve_peer(stream, identity) {
                if let Some(WalletError::PermissionDenied(_)) =
                    e.downcast_ref::<WalletError>()
                {
                    warn!(error = %e, "peer failed authentication");
                } else {
                    warn!(error = %e, "peer session error");
                }
            }
        });
    }

    Ok(0)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bitarmord: bad configuration: {e}");
            return ExitCode::from(EXIT_FATAL_STARTUP);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("bitarmord: cannot set up logging: {e}");
        return ExitCode::from(EXIT_FATAL_STARTUP);
    }

    match run(config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "fatal");
            let code = if e
                .downcast_ref::<WalletError>()
                .map(|w| matches!(w, WalletError::PermissionDenied(_)))
                .unwrap_or(false)
            {
                EXIT_AUTH_EXCEEDED
            } else {
                EXIT_FATAL_STARTUP
            };
            ExitCode::from(code)
        }
    }
}
