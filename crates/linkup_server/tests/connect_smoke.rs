use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use linkup_client_core::{ClientConfig, ClientCoreError, Session};
use linkup_domain::{ErrorKind, UserId};
use linkup_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use linkup_protocol::{ClientFrame, ServerFrame, Welcome};
use quinn::{Endpoint, ServerConfig};
use tokio::sync::oneshot;

const EXPECTED_AUTHORIZATION: &str = "Bearer v1.smoke.token";

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("LINKUP_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn unix_ms_now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

fn make_quic_server(bind_addr: SocketAddr) -> anyhow::Result<Endpoint> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_der = ck.cert.der().to_vec();
	let key_der = ck.signing_key.serialize_der();

	let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
	let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
		.map_err(anyhow::Error::msg)
		.context("parse private key der")?;

	let mut tls_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![b"linkup-v1".to_vec()];

	let server_config = ServerConfig::with_crypto(Arc::new(quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?));
	let endpoint = Endpoint::server(server_config, bind_addr).context("bind quinn endpoint")?;

	Ok(endpoint)
}

async fn send_frame(send: &mut quinn::SendStream, frame: &ServerFrame) -> anyhow::Result<()> {
	let frame = encode_frame(frame, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

async fn read_frame(recv: &mut quinn::RecvStream, buf: &mut BytesMut) -> anyhow::Result<ClientFrame> {
	let mut tmp = [0u8; 8192];

	loop {
		if let Some(frame) = try_decode_frame_from_buffer::<ClientFrame>(buf, DEFAULT_MAX_FRAME_SIZE)? {
			return Ok(frame);
		}

		let n = recv
			.read(&mut tmp)
			.await
			.context("stream read")?
			.ok_or_else(|| anyhow!("stream closed mid-frame"))?;
		buf.extend_from_slice(&tmp[..n]);
	}
}

/// Minimal protocol server: hello/welcome handshake with credential check,
/// then ack the first direct message. Exercises the wire format end to end.
async fn run_minimal_server(endpoint: Endpoint, subject: UserId, ready_tx: oneshot::Sender<SocketAddr>) -> anyhow::Result<()> {
	init_test_logging();

	let local_addr = endpoint.local_addr().context("server local_addr")?;
	let _ = ready_tx.send(local_addr);

	let Some(connecting) = endpoint.accept().await else {
		return Err(anyhow!("server endpoint closed before accept"));
	};
	let connection = connecting.await.context("accept quic connection")?;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept_bi")?;
	let mut buf = BytesMut::with_capacity(16 * 1024);

	let hello = match read_frame(&mut recv, &mut buf).await? {
		ClientFrame::Hello(h) => h,
		other => return Err(anyhow!("expected hello, got {other:?}")),
	};

	if hello.authorization != EXPECTED_AUTHORIZATION {
		send_frame(
			&mut send,
			&ServerFrame::CustomError {
				kind: ErrorKind::ExpiredOrRevokedCredential,
				message: "invalid credential".to_string(),
			},
		)
		.await?;
		let _ = send.finish();
		// Let the error frame flush before the connection drops.
		let _ = tokio::time::timeout(Duration::from_secs(5), connection.closed()).await;
		return Ok(());
	}

	send_frame(
		&mut send,
		&ServerFrame::Welcome(Welcome {
			server_name: "linkup-server-test".to_string(),
			subject_id: subject,
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
		}),
	)
	.await?;

	let (content, send_to) = match read_frame(&mut recv, &mut buf).await? {
		ClientFrame::SendMessage { content, send_to } => (content, send_to),
		other => return Err(anyhow!("expected sendMessage, got {other:?}")),
	};

	send_frame(&mut send, &ServerFrame::SuccessMessage { content: content.clone() }).await?;
	send_frame(
		&mut send,
		&ServerFrame::OnlineUser { user_id: send_to },
	)
	.await?;

	let _ = send.finish();
	let _ = tokio::time::timeout(Duration::from_secs(5), connection.closed()).await;
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_handshake_and_direct_message_ack() -> anyhow::Result<()> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let endpoint = make_quic_server(bind_addr)?;

	let subject = UserId::new_v4();
	let recipient = UserId::new_v4();

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task = tokio::spawn(run_minimal_server(endpoint, subject, ready_tx));

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let cfg = ClientConfig {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		authorization: EXPECTED_AUTHORIZATION.to_string(),
		client_name: "linkup-test-client".to_string(),
		..ClientConfig::default()
	};

	let (mut session, welcome) = Session::connect(cfg).await.context("client connect")?;
	assert_eq!(welcome.subject_id, subject);

	session
		.send(&ClientFrame::SendMessage {
			content: "smoke test message".to_string(),
			send_to: recipient,
		})
		.await
		.context("send message")?;

	let ack = tokio::time::timeout(Duration::from_secs(5), session.next_frame())
		.await
		.context("timeout waiting for ack")?
		.context("read ack")?;
	match ack {
		Some(ServerFrame::SuccessMessage { content }) => assert_eq!(content, "smoke test message"),
		other => panic!("expected successMessage ack, got {other:?}"),
	}

	let presence = tokio::time::timeout(Duration::from_secs(5), session.next_frame())
		.await
		.context("timeout waiting for presence frame")?
		.context("read presence frame")?;
	match presence {
		Some(ServerFrame::OnlineUser { user_id }) => assert_eq!(user_id, recipient),
		other => panic!("expected online_user frame, got {other:?}"),
	}

	session.close(0, "done");

	server_task.await.context("server join")?.context("server run")?;
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_handshake_rejection_maps_to_rejected_error() -> anyhow::Result<()> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let endpoint = make_quic_server(bind_addr)?;

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task = tokio::spawn(run_minimal_server(endpoint, UserId::new_v4(), ready_tx));

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let cfg = ClientConfig {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		authorization: "Bearer not.the.right.token".to_string(),
		client_name: "linkup-test-client".to_string(),
		..ClientConfig::default()
	};

	match Session::connect(cfg).await {
		Err(ClientCoreError::Rejected { kind, .. }) => {
			assert_eq!(kind, ErrorKind::ExpiredOrRevokedCredential);
		}
		Ok(_) => panic!("handshake with a bad credential must be rejected"),
		Err(other) => panic!("expected Rejected, got {other}"),
	}

	server_task.await.context("server join")?.context("server run")?;
	Ok(())
}
