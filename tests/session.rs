//! End-to-end tests driving a real server over TCP, both through the
//! client and through a raw wire helper that asserts literal protocol
//! bytes.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    },
};

use postrider::{
    EnhancedCode, Error, ReplyCode, Result, SmtpError,
    address::{ForwardPath, ReversePath},
    client::{Client, ClientBuilder},
    sasl,
    server::{
        Server, ServerBuilder,
        handler::{AuthHandler, DataHandler, MailHandler},
    },
};

// ----------------------------------------------------------------------
// Test fixtures
// ----------------------------------------------------------------------

struct StoredMessage {
    from: ReversePath,
    to: Vec<ForwardPath>,
    body: Vec<u8>,
}

/// A data handler that keeps everything it is given.
#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<StoredMessage>>,
}

impl Inbox {
    fn take(&self) -> Vec<StoredMessage> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }
}

#[async_trait]
impl DataHandler for Inbox {
    async fn on_data(
        &self,
        from: &ReversePath,
        to: &[ForwardPath],
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;
        self.messages.lock().unwrap().push(StoredMessage {
            from: from.clone(),
            to: to.to_vec(),
            body: buf,
        });
        Ok(())
    }
}

/// Accepts testuser/testpass over every mechanism.
struct Credentials;

#[async_trait]
impl AuthHandler for Credentials {
    async fn authenticate(&self, mechanism: &str, username: &str, password: &str) -> Result<()> {
        let ok = match mechanism {
            "PLAIN" | "LOGIN" => username == "testuser" && password == "testpass",
            "CRAM-MD5" => {
                let (challenge, digest) = password.split_once(':').unwrap_or(("", ""));
                let mut mac =
                    Hmac::<Md5>::new_from_slice(b"testpass").expect("hmac accepts any key length");
                mac.update(challenge.as_bytes());
                let expected: String = mac
                    .finalize()
                    .into_bytes()
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect();
                username == "testuser" && digest == expected
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(Error::Smtp(SmtpError::new(
                ReplyCode::AUTH_FAILED,
                EnhancedCode::new(5, 7, 8),
                "Bad credentials",
            )))
        }
    }
}

/// Rejects every sender with a multi-line policy error.
struct SpamWall;

#[async_trait]
impl MailHandler for SpamWall {
    async fn on_mail(&self, _from: &ReversePath) -> Result<()> {
        Err(Error::Smtp(SmtpError::new(
            ReplyCode::MAILBOX_NOT_FOUND,
            EnhancedCode::new(5, 7, 1),
            "Spam detected\nContact postmaster",
        )))
    }
}

async fn start_server(builder: ServerBuilder) -> (SocketAddr, Arc<Server>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(builder.build().unwrap());

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    (addr, server)
}

fn basic_builder(inbox: &Arc<Inbox>) -> ServerBuilder {
    Server::builder()
        .with_hostname("mail.test")
        .with_max_message_size(10_485_760)
        .with_data_handler(Arc::clone(inbox) as Arc<dyn DataHandler>)
}

// ----------------------------------------------------------------------
// Raw wire helper
// ----------------------------------------------------------------------

struct Wire<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// One reply line, without its CRLF. `None` at EOF.
    async fn line(&mut self) -> Option<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await.unwrap() == 0 {
            return None;
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// All lines of one (possibly multi-line) reply.
    async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await.expect("reply truncated");
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    fn unsplit(self) -> S {
        self.reader.into_inner().unsplit(self.writer)
    }
}

async fn connect(addr: SocketAddr) -> Wire<TcpStream> {
    Wire::new(TcpStream::connect(addr).await.unwrap())
}

// ----------------------------------------------------------------------
// Literal dialogs
// ----------------------------------------------------------------------

#[tokio::test]
async fn simple_send_dialog() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut wire = connect(addr).await;
    assert_eq!(wire.line().await.unwrap(), "220 mail.test ESMTP ready");

    wire.send("EHLO c.test").await;
    assert_eq!(
        wire.reply().await,
        vec![
            "250-mail.test Hello c.test",
            "250-SIZE 10485760",
            "250-PIPELINING",
            "250-8BITMIME",
            "250-ENHANCEDSTATUSCODES",
            "250-DSN",
            "250-SMTPUTF8",
            "250 CHUNKING",
        ]
    );

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.0 Originator ok");

    wire.send("RCPT TO:<b@y>").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.5 Recipient ok");

    wire.send("DATA").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "354 Start mail input; end with <CRLF>.<CRLF>"
    );

    wire.send_raw(b"Hi\r\n.\r\n").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.0.0 Message accepted");

    wire.send("QUIT").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "221 2.0.0 mail.test closing connection"
    );

    let messages = inbox.take();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from.to_string(), "<a@x>");
    assert_eq!(messages[0].to.len(), 1);
    assert_eq!(messages[0].to[0].to_string(), "<b@y>");
    assert_eq!(messages[0].body, b"Hi\r\n");
}

#[tokio::test]
async fn bdat_two_chunks() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    wire.send("MAIL FROM:<a@x>").await;
    wire.line().await.unwrap();
    wire.send("RCPT TO:<b@y>").await;
    wire.line().await.unwrap();

    wire.send_raw(b"BDAT 9\r\nPart one ").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.0.0 9 bytes received");

    wire.send_raw(b"BDAT 8 LAST\r\npart two").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.0.0 Message accepted");

    let messages = inbox.take();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"Part one part two");

    // The transaction reset: a new MAIL is accepted immediately.
    wire.send("MAIL FROM:<c@z>").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.0 Originator ok");
}

#[tokio::test]
async fn state_machine_rejects_out_of_order_commands() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 Send EHLO/HELO first");

    wire.send("EHLO c.test").await;
    wire.reply().await;

    wire.send("RCPT TO:<b@y>").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 Send MAIL first");

    wire.send("DATA").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 Send RCPT first");

    wire.send("MAIL FROM:<a@x>").await;
    wire.line().await.unwrap();
    wire.send("MAIL FROM:<again@x>").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 MAIL already specified");
}

#[tokio::test]
async fn syntax_errors_and_scaffolded_commands() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    wire.send("VRFY someone").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "252 2.0.0 Cannot VRFY user, but will accept message"
    );

    wire.send("EXPN list").await;
    assert_eq!(wire.line().await.unwrap(), "502 5.5.1 EXPN not implemented");

    wire.send("MAIL FROM:<not an address>").await;
    assert_eq!(wire.line().await.unwrap(), "501 5.1.7 Invalid sender address");

    wire.send("MAIL TO:<a@x>").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "501 5.5.2 Syntax: MAIL FROM:<address>"
    );

    // NUL bytes are rejected outright.
    wire.send_raw(b"NO\0OP\r\n").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "500 5.5.1 NUL not allowed in commands"
    );

    // An oversized line is drained without losing stream alignment.
    let long = vec![b'a'; 600];
    wire.send_raw(&long).await;
    wire.send_raw(b"\r\n").await;
    assert_eq!(wire.line().await.unwrap(), "500 5.5.2 Line too long");
    wire.send("NOOP").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.0.0 OK");
}

#[tokio::test]
async fn declared_size_and_recipient_caps() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox).with_max_recipients(2)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    wire.send("MAIL FROM:<a@x> SIZE=20971520").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "552 5.3.4 Declared message size exceeds maximum"
    );

    wire.send("MAIL FROM:<a@x> SIZE=100 BODY=8BITMIME SMTPUTF8").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.0 Originator ok");

    wire.send("RCPT TO:<one@y>").await;
    wire.line().await.unwrap();
    wire.send("RCPT TO:<two@y>").await;
    wire.line().await.unwrap();
    wire.send("RCPT TO:<three@y>").await;
    assert_eq!(wire.line().await.unwrap(), "452 4.5.3 Too many recipients");
}

#[tokio::test]
async fn invalid_command_cap_closes_the_connection() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox).with_max_invalid_commands(3)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();

    wire.send("BOGUS one").await;
    assert_eq!(wire.line().await.unwrap(), "500 5.5.1 Command not recognized");
    wire.send("BOGUS two").await;
    assert_eq!(wire.line().await.unwrap(), "500 5.5.1 Command not recognized");

    // The cap-hitting command gets its 500 and then the closing 421.
    wire.send("BOGUS three").await;
    assert_eq!(wire.line().await.unwrap(), "500 5.5.1 Command not recognized");
    assert_eq!(
        wire.line().await.unwrap(),
        "421 4.4.0 Too many errors, closing connection"
    );
    assert_eq!(wire.line().await, None);
}

#[tokio::test]
async fn connection_cap_answers_421() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox).with_max_connections(1)).await;

    let mut first = connect(addr).await;
    assert_eq!(first.line().await.unwrap(), "220 mail.test ESMTP ready");

    let mut second = connect(addr).await;
    assert_eq!(
        second.line().await.unwrap(),
        "421 4.7.0 Too many connections, try again later"
    );
    assert_eq!(second.line().await, None);

    first.send("QUIT").await;
    first.line().await.unwrap();

    // Once the first session ends its slot frees up.
    let mut accepted = false;
    for _ in 0..100 {
        let mut retry = connect(addr).await;
        if let Some(line) = retry.line().await {
            if line.starts_with("220") {
                accepted = true;
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(accepted, "slot was never released");
}

#[tokio::test]
async fn multi_line_handler_error_repeats_the_enhanced_code() {
    let (addr, _server) = start_server(
        Server::builder()
            .with_hostname("mail.test")
            .with_mail_handler(Arc::new(SpamWall)),
    )
    .await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(
        wire.reply().await,
        vec!["550-5.7.1 Spam detected", "550 5.7.1 Contact postmaster"]
    );
}

#[tokio::test]
async fn graceful_shutdown_delivers_421() {
    let inbox = Arc::new(Inbox::default());
    let (addr, server) = start_server(basic_builder(&inbox)).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    let shutdown = tokio::spawn(async move { server.shutdown(Duration::from_secs(5)).await });

    assert_eq!(
        wire.line().await.unwrap(),
        "421 4.3.0 Server shutting down"
    );
    assert_eq!(wire.line().await, None);
    shutdown.await.unwrap().unwrap();

    // The listener is gone too.
    assert!(TcpStream::connect(addr).await.is_err());
}

// ----------------------------------------------------------------------
// AUTH and submission
// ----------------------------------------------------------------------

#[tokio::test]
async fn auth_plain_inline_initial_response() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) =
        start_server(basic_builder(&inbox).with_auth_handler(Arc::new(Credentials))).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    let ehlo = wire.reply().await;
    assert!(ehlo.contains(&"250 AUTH PLAIN LOGIN CRAM-MD5".to_owned()));

    // base64("\0testuser\0testpass")
    wire.send("AUTH PLAIN AHRlc3R1c2VyAHRlc3RwYXNz").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "235 2.0.0 Authentication successful"
    );

    // AUTH is gone from the refreshed EHLO listing and cannot repeat.
    wire.send("EHLO c.test").await;
    let ehlo = wire.reply().await;
    assert!(!ehlo.iter().any(|line| line.contains("AUTH")));

    wire.send("AUTH PLAIN AHRlc3R1c2VyAHRlc3RwYXNz").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "503 5.5.1 Already authenticated"
    );
}

#[tokio::test]
async fn submission_mode_gates_mail_on_auth() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(
        basic_builder(&inbox)
            .with_auth_handler(Arc::new(Credentials))
            .with_submission_mode(true),
    )
    .await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c").await;
    wire.reply().await;

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(
        wire.line().await.unwrap(),
        "530 5.7.0 Authentication required"
    );

    wire.send("AUTH PLAIN AHRlc3R1c2VyAHRlc3RwYXNz").await;
    wire.line().await.unwrap();

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.0 Originator ok");
}

#[tokio::test]
async fn client_authenticates_with_every_mechanism() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) =
        start_server(basic_builder(&inbox).with_auth_handler(Arc::new(Credentials))).await;

    for mechanism in ["PLAIN", "LOGIN", "CRAM-MD5"] {
        let mut client = Client::dial(&addr.to_string()).await.unwrap();
        let result = match mechanism {
            "PLAIN" => {
                client
                    .auth(&mut sasl::Plain::new("testuser", "testpass"))
                    .await
            }
            "LOGIN" => {
                client
                    .auth(&mut sasl::Login::new("testuser", "testpass"))
                    .await
            }
            _ => {
                client
                    .auth(&mut sasl::CramMd5::new("testuser", "testpass"))
                    .await
            }
        };
        result.unwrap_or_else(|err| panic!("{mechanism} failed: {err}"));
        client.close().await;
    }
}

#[tokio::test]
async fn client_surfaces_rejected_credentials() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) =
        start_server(basic_builder(&inbox).with_auth_handler(Arc::new(Credentials))).await;

    let mut client = Client::dial(&addr.to_string()).await.unwrap();
    let err = client
        .auth(&mut sasl::Plain::new("testuser", "wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(ReplyCode::AUTH_FAILED));
    assert!(!err.is_transient());
    client.close().await;
}

// ----------------------------------------------------------------------
// Client driver behavior
// ----------------------------------------------------------------------

#[tokio::test]
async fn client_sends_two_transactions_without_rset() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut client = ClientBuilder::new()
        .with_local_name("c.test")
        .dial(&addr.to_string())
        .await
        .unwrap();

    assert_eq!(client.server_hostname(), "mail.test ESMTP ready");
    assert_eq!(client.server_max_size(), 10_485_760);

    let from = ReversePath::parse("a@x.test").unwrap();
    let to = [ForwardPath::parse("b@y.test").unwrap()];

    client
        .send_mail(&from, &to, &b"First message\r\n"[..])
        .await
        .unwrap();
    client
        .send_mail(&from, &to, &b"Second message\r\n"[..])
        .await
        .unwrap();
    client.close().await;

    let messages = inbox.take();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body, b"First message\r\n");
    assert_eq!(messages[1].body, b"Second message\r\n");
}

#[tokio::test]
async fn client_bounce_uses_null_reverse_path() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut client = Client::dial(&addr.to_string()).await.unwrap();
    let to = [ForwardPath::parse("victim@y.test").unwrap()];
    client
        .send_mail(&ReversePath::Null, &to, &b"bounced\r\n"[..])
        .await
        .unwrap();
    client.close().await;

    let messages = inbox.take();
    assert!(messages[0].from.is_null());
}

#[tokio::test]
async fn client_falls_back_to_helo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A minimal HELO-only peer.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"220 old.test ready\r\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
            let reply: &[u8] = match verb.as_str() {
                "EHLO" => b"502 5.5.1 Command not implemented\r\n",
                "HELO" => b"250 old.test\r\n",
                "QUIT" => b"221 2.0.0 bye\r\n",
                _ => b"250 2.0.0 ok\r\n",
            };
            write_half.write_all(reply).await.unwrap();
            if verb == "QUIT" {
                break;
            }
        }
    });

    let client = Client::dial(&addr.to_string()).await.unwrap();
    assert!(client.extensions().is_none());
    assert_eq!(client.server_max_size(), 0);
    client.close().await;
}

#[tokio::test]
async fn client_refuses_body_without_354() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) = start_server(basic_builder(&inbox)).await;

    let mut client = Client::dial(&addr.to_string()).await.unwrap();
    // DATA before any transaction: the server answers 503 and the client
    // must not send a body.
    let err = client.data(&b"should not be sent\r\n"[..]).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(ReplyCode::BAD_SEQUENCE));

    // The connection is still usable.
    client.noop().await.unwrap();
    client.close().await;
    assert!(inbox.take().is_empty());
}

// ----------------------------------------------------------------------
// STARTTLS
// ----------------------------------------------------------------------

fn self_signed_server_config() -> Arc<rustls::ServerConfig> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap(),
    )
}

/// Certificate verification disabled; these tests pin nothing.
#[derive(Debug)]
struct TrustAnything;

impl ServerCertVerifier for TrustAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[tokio::test]
async fn client_starttls_round_trip() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) =
        start_server(basic_builder(&inbox).with_tls_config(self_signed_server_config())).await;

    let mut client = ClientBuilder::new()
        .danger_accept_invalid_certs(true)
        .dial(&format!("localhost:{}", addr.port()))
        .await
        .unwrap();

    assert!(client.extensions().unwrap().has("STARTTLS"));
    assert!(!client.is_tls());

    client.starttls().await.unwrap();
    assert!(client.is_tls());
    // The refreshed extension view no longer offers STARTTLS.
    assert!(!client.extensions().unwrap().has("STARTTLS"));

    let from = ReversePath::parse("a@x.test").unwrap();
    let to = [ForwardPath::parse("b@y.test").unwrap()];
    client
        .send_mail(&from, &to, &b"over tls\r\n"[..])
        .await
        .unwrap();
    client.close().await;

    assert_eq!(inbox.take()[0].body, b"over tls\r\n");
}

#[tokio::test]
async fn starttls_discards_pipelined_plaintext_and_resets_state() {
    let inbox = Arc::new(Inbox::default());
    let (addr, _server) =
        start_server(basic_builder(&inbox).with_tls_config(self_signed_server_config())).await;

    let mut wire = connect(addr).await;
    wire.line().await.unwrap();
    wire.send("EHLO c.test").await;
    wire.reply().await;

    // Malicious pipelining: the RSET rides along with STARTTLS and must
    // be thrown away with the plaintext buffers.
    wire.send_raw(b"STARTTLS\r\nRSET\r\n").await;
    assert_eq!(wire.line().await.unwrap(), "220 Ready to start TLS");

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnything))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), wire.unsplit())
        .await
        .unwrap();

    let mut wire = Wire::new(tls);

    // Had the injected RSET been processed, a stray "250 2.0.0 Reset ok"
    // would arrive here. Instead the session is back in its initial
    // state and MAIL is rejected until a fresh EHLO.
    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 Send EHLO/HELO first");

    wire.send("EHLO c.test").await;
    let ehlo = wire.reply().await;
    assert!(!ehlo.iter().any(|line| line.contains("STARTTLS")));

    wire.send("MAIL FROM:<a@x>").await;
    assert_eq!(wire.line().await.unwrap(), "250 2.1.0 Originator ok");

    // A second STARTTLS on the secured channel is a sequence error.
    wire.send("STARTTLS").await;
    assert_eq!(wire.line().await.unwrap(), "503 5.5.1 Already running TLS");
}
