//! SMTP session scenario tests
//!
//! The engine is generic over its transport, so these drive a full session
//! over an in-memory duplex stream and assert on the exact wire replies.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use postbox_rs::config::Config;
use postbox_rs::connection::{Connection, PeerInfo};
use postbox_rs::domain::DomainRegistry;
use postbox_rs::security::FileCredentialStore;
use postbox_rs::smtp::SmtpSession;
use postbox_rs::storage::Queue;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

const TEST_USER: &str = "tim";
const TEST_SECRET: &[u8] = b"tanstaaftanstaaf";

struct TestServer {
    _root: TempDir,
    queue_path: std::path::PathBuf,
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    handle: tokio::task::JoinHandle<postbox_rs::Result<()>>,
}

async fn start_session(with_auth: bool, max_message_size: usize) -> TestServer {
    let root = TempDir::new().unwrap();
    let domain_root = root.path().join("domains");
    let queue_path = root.path().join("queue");

    // One hosted domain "local" with one user "b".
    let registry = DomainRegistry::new(&domain_root);
    let domain = registry.create_domain("local").await.unwrap();
    domain.create_user("b").await.unwrap();

    let mut config = Config::default();
    config.server.hostname = "mail.example.com".to_string();
    config.smtp.max_message_size = max_message_size;

    let queue = Queue::open(&queue_path).await.unwrap();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let conn = Connection::new(server_read, server_write, PeerInfo::default());

    let mut session = SmtpSession::new(conn, &config, registry, queue);
    if with_auth {
        session = session.with_credentials(Box::new(FileCredentialStore::from_pairs([(
            TEST_USER,
            "tanstaaftanstaaf",
        )])));
    }

    let handle = tokio::spawn(async move {
        session.greet().await?;
        session.run().await
    });

    let (client_read, client_write) = tokio::io::split(client);
    TestServer {
        _root: root,
        queue_path,
        reader: BufReader::new(client_read),
        writer: client_write,
        handle,
    }
}

impl TestServer {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    /// Greeting plus EHLO exchange, discarding the capability lines.
    async fn handshake(&mut self) {
        assert!(self.recv().await.starts_with("220 "));
        self.send("EHLO test.client").await;
        loop {
            let line = self.recv().await;
            if line.starts_with("250 ") {
                break;
            }
        }
    }

    async fn queue(&self) -> Queue {
        Queue::open(&self.queue_path).await.unwrap()
    }

    async fn join(&mut self) {
        std::pin::Pin::new(&mut self.handle)
            .await
            .unwrap()
            .unwrap();
    }
}

fn cram_md5_response(challenge_b64: &str, user: &str, secret: &[u8]) -> String {
    let challenge = BASE64.decode(challenge_b64.as_bytes()).unwrap();
    let key = openssl::pkey::PKey::hmac(secret).unwrap();
    let mut signer =
        openssl::sign::Signer::new(openssl::hash::MessageDigest::md5(), &key).unwrap();
    signer.update(&challenge).unwrap();
    let digest: String = signer
        .sign_to_vec()
        .unwrap()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    BASE64.encode(format!("{} {}", user, digest).as_bytes())
}

#[tokio::test]
async fn test_simple_happy_path() {
    let mut s = start_session(false, 0).await;

    assert!(s.recv().await.starts_with("220 mail.example.com"));
    s.send("EHLO c").await;
    assert_eq!(s.recv().await, "250-8BITMIME");
    assert_eq!(s.recv().await, "250-PIPELINING");
    assert_eq!(s.recv().await, "250-AUTH CRAM-MD5");
    assert_eq!(s.recv().await, "250 mail.example.com");
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<b@local>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("DATA").await;
    assert!(s.recv().await.starts_with("354 "));
    s.send("hello").await;
    s.send(".").await;
    assert_eq!(s.recv().await, "250 message accepted for delivery");
    s.send("QUIT").await;
    assert_eq!(s.recv().await, "221 goodbye");
    s.join().await;

    let queue = s.queue().await;
    let names = queue.list().await.unwrap();
    assert_eq!(names.len(), 1);
    let (envelope, body) = queue.read(&names[0]).await.unwrap();
    assert_eq!(envelope.from, "a@ex.com");
    assert!(envelope.sender.is_none());
    assert_eq!(envelope.recipients.len(), 1);
    assert_eq!(envelope.recipients[0].recipient, "b@local");
    assert!(!envelope.recipients[0].delivered);

    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("Received: from"));
    assert!(text.ends_with("hello\n"));
}

#[tokio::test]
async fn test_ehlo_advertises_size_when_limited() {
    let mut s = start_session(false, 1024).await;
    assert!(s.recv().await.starts_with("220 "));
    s.send("EHLO c").await;
    let mut saw_size = false;
    loop {
        let line = s.recv().await;
        if line == "250-SIZE 1024" {
            saw_size = true;
        }
        if line.starts_with("250 ") {
            break;
        }
    }
    assert!(saw_size, "SIZE should be advertised");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_rcpt_before_mail() {
    let mut s = start_session(false, 0).await;
    assert!(s.recv().await.starts_with("220 "));
    s.send("HELO x").await;
    assert_eq!(s.recv().await, "250 mail.example.com");
    s.send("RCPT TO:<b@local>").await;
    assert_eq!(s.recv().await, "503 need MAIL before RCPT");
    s.send("QUIT").await;
    assert_eq!(s.recv().await, "221 goodbye");
}

#[tokio::test]
async fn test_relay_denied_without_auth() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<u@foreign>").await;
    assert_eq!(s.recv().await, "551 We don't relay mail to remote addresses");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_path_traversal_recipient_rejected() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<../etc/passwd@local>").await;
    assert_eq!(s.recv().await, "550 Invalid address");
    s.send("QUIT").await;
    assert_eq!(s.recv().await, "221 goodbye");
    s.join().await;

    assert!(s.queue().await.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<nobody@local>").await;
    assert_eq!(s.recv().await, "550 User does not exist");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_dot_stuffing_reversed() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    s.recv().await;
    s.send("RCPT TO:<b@local>").await;
    s.recv().await;
    s.send("DATA").await;
    s.recv().await;
    s.send("..hello").await;
    s.send(".").await;
    assert_eq!(s.recv().await, "250 message accepted for delivery");
    s.send("QUIT").await;
    s.recv().await;
    s.join().await;

    let queue = s.queue().await;
    let names = queue.list().await.unwrap();
    let (_, body) = queue.read(&names[0]).await.unwrap();
    let text = String::from_utf8(body).unwrap();
    assert!(text.ends_with("\n.hello\n"), "body was {:?}", text);
}

#[tokio::test]
async fn test_pipelined_second_message() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;

    for subject in ["one", "two"] {
        s.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(s.recv().await, "250 OK");
        s.send("RCPT TO:<b@local>").await;
        assert_eq!(s.recv().await, "250 OK");
        s.send("DATA").await;
        assert!(s.recv().await.starts_with("354 "));
        s.send(&format!("Subject: {}", subject)).await;
        s.send(".").await;
        assert_eq!(s.recv().await, "250 message accepted for delivery");
    }
    s.send("QUIT").await;
    assert_eq!(s.recv().await, "221 goodbye");
    s.join().await;

    let names = s.queue().await.list().await.unwrap();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
}

#[tokio::test]
async fn test_rset_clears_transaction() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    s.recv().await;
    s.send("RCPT TO:<b@local>").await;
    s.recv().await;
    s.send("RSET").await;
    assert_eq!(s.recv().await, "250 OK");

    // Both the sender and the recipient list are gone.
    s.send("DATA").await;
    assert_eq!(s.recv().await, "503 need MAIL before DATA");
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_duplicate_mail_from_rejected() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("MAIL FROM:<other@ex.com>").await;
    assert_eq!(s.recv().await, "400 MAIL FROM already sent");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_bounce_mail_from_rejected() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<>").await;
    assert_eq!(s.recv().await, "551 We don't accept mail to that address");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_data_without_recipients() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    s.recv().await;
    s.send("DATA").await;
    assert_eq!(s.recv().await, "503 need RCPT before DATA");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_duplicate_recipient_accepted_once() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    s.recv().await;
    s.send("RCPT TO:<b@local>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<b@local>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("DATA").await;
    s.recv().await;
    s.send("hi").await;
    s.send(".").await;
    s.recv().await;
    s.send("QUIT").await;
    s.recv().await;
    s.join().await;

    let queue = s.queue().await;
    let names = queue.list().await.unwrap();
    let (envelope, _) = queue.read(&names[0]).await.unwrap();
    assert_eq!(envelope.recipients.len(), 1);
}

#[tokio::test]
async fn test_vrfy_noop_and_unknown() {
    let mut s = start_session(false, 0).await;
    s.handshake().await;
    s.send("VRFY b").await;
    assert_eq!(s.recv().await, "500 VRFY not supported");
    s.send("NOOP").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("EXPN list").await;
    assert_eq!(s.recv().await, "500 Unrecognized command");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_oversized_message_rejected() {
    let mut s = start_session(false, 64).await;
    s.handshake().await;
    s.send("MAIL FROM:<a@ex.com>").await;
    s.recv().await;
    s.send("RCPT TO:<b@local>").await;
    s.recv().await;
    s.send("DATA").await;
    assert!(s.recv().await.starts_with("354 "));
    for _ in 0..8 {
        s.send("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").await;
    }
    s.send(".").await;
    assert!(s.recv().await.starts_with("552 "));
    s.send("QUIT").await;
    s.recv().await;
    s.join().await;

    assert!(s.queue().await.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auth_cram_md5_success_enables_relay() {
    let mut s = start_session(true, 0).await;
    s.handshake().await;

    s.send("AUTH CRAM-MD5").await;
    let reply = s.recv().await;
    assert!(reply.starts_with("354 "), "got {}", reply);
    let challenge_b64 = reply["354 ".len()..].to_string();

    s.send(&cram_md5_response(&challenge_b64, TEST_USER, TEST_SECRET))
        .await;
    assert_eq!(s.recv().await, "235 Authentication successful");

    // Relaying to a foreign domain is allowed once authenticated.
    s.send("MAIL FROM:<tim@ex.com>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("RCPT TO:<u@elsewhere.example>").await;
    assert_eq!(s.recv().await, "250 OK");
    s.send("DATA").await;
    assert!(s.recv().await.starts_with("354 "));
    s.send("relayed").await;
    s.send(".").await;
    assert_eq!(s.recv().await, "250 message accepted for delivery");
    s.send("QUIT").await;
    s.recv().await;
    s.join().await;

    let queue = s.queue().await;
    let names = queue.list().await.unwrap();
    let (envelope, _) = queue.read(&names[0]).await.unwrap();
    assert_eq!(envelope.sender.as_deref(), Some(TEST_USER));
}

#[tokio::test]
async fn test_auth_cram_md5_wrong_digest() {
    let mut s = start_session(true, 0).await;
    s.handshake().await;

    s.send("AUTH CRAM-MD5").await;
    assert!(s.recv().await.starts_with("354 "));
    let bogus = BASE64.encode(b"tim 00000000000000000000000000000000");
    s.send(&bogus).await;
    assert_eq!(s.recv().await, "550 Authentication failed");

    // Still unauthenticated, so relay stays denied.
    s.send("MAIL FROM:<tim@ex.com>").await;
    s.recv().await;
    s.send("RCPT TO:<u@foreign>").await;
    assert_eq!(s.recv().await, "551 We don't relay mail to remote addresses");
    s.send("QUIT").await;
}

#[tokio::test]
async fn test_auth_other_mechanism_rejected() {
    let mut s = start_session(true, 0).await;
    s.handshake().await;
    s.send("AUTH PLAIN AGFiYwBkZWY=").await;
    assert_eq!(s.recv().await, "500 Unrecognized command");
    s.send("QUIT").await;
}
