//! Property tests for the dot-stuffing transducers: whatever the writer
//! puts on the wire, the reader gives back, modulo the canonical
//! trailing line ending the writer adds before the terminator.

use proptest::prelude::*;
use tokio::io::AsyncReadExt;

use postrider::textproto::{DotReader, DotWriter};

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
        .block_on(future)
}

async fn stuff(body: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    let mut writer = DotWriter::new(&mut wire);
    writer.write(body).await.expect("write body");
    writer.close().await.expect("close body");
    wire
}

async fn destuff(mut wire: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut body = Vec::new();
    {
        let mut reader = DotReader::new(&mut wire);
        reader.read_to_end(&mut body).await.expect("read body");
    }
    (body, wire.to_vec())
}

/// The body as the receiving side should observe it: the writer
/// finishes a dangling last line with CRLF before the terminator.
fn canonical(body: &[u8]) -> Vec<u8> {
    let mut expected = body.to_vec();
    if !expected.is_empty() && !expected.ends_with(b"\n") {
        expected.extend_from_slice(b"\r\n");
    }
    expected
}

/// Byte soup with the interesting characters heavily overrepresented.
fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    let byte = prop_oneof![
        Just(b'.'),
        Just(b'\r'),
        Just(b'\n'),
        any::<u8>(),
    ];
    prop::collection::vec(byte, 0..512)
}

proptest! {
    #[test]
    fn writer_reader_round_trip(body in body_strategy()) {
        let (read_back, rest) = block_on(async {
            let wire = stuff(&body).await;
            destuff(&wire).await
        });

        prop_assert_eq!(read_back, canonical(&body));
        prop_assert!(rest.is_empty(), "reader consumed past the terminator");
    }

    #[test]
    fn reader_stops_exactly_at_terminator(body in body_strategy(), trailer in prop::collection::vec(any::<u8>(), 0..64)) {
        let (read_back, rest) = block_on(async {
            let mut wire = stuff(&body).await;
            wire.extend_from_slice(&trailer);
            destuff(&wire).await
        });

        prop_assert_eq!(read_back, canonical(&body));
        prop_assert_eq!(rest, trailer);
    }

    #[test]
    fn wire_never_contains_a_bare_terminator_before_the_end(body in body_strategy()) {
        let wire = block_on(stuff(&body));

        // The terminator may appear exactly once, at the very end.
        let terminator = b"\r\n.\r\n";
        let position = wire
            .windows(terminator.len())
            .position(|window| window == terminator);
        if let Some(position) = position {
            prop_assert_eq!(position, wire.len() - terminator.len());
        } else {
            // The body was empty: the wire is just ".\r\n".
            prop_assert_eq!(wire.as_slice(), b".\r\n".as_slice());
        }
    }
}

mod seeds {
    use super::*;

    #[tokio::test]
    async fn empty_body() {
        let wire = stuff(b"").await;
        assert_eq!(wire, b".\r\n");
        let (body, _) = destuff(&wire).await;
        assert_eq!(body, b"");
    }

    #[tokio::test]
    async fn lone_dot_line() {
        let body = b".\r\n";
        let wire = stuff(body).await;
        assert_eq!(wire, b"..\r\n.\r\n");
        let (read_back, _) = destuff(&wire).await;
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn body_that_is_a_crlf_dot_crlf() {
        let body = b"\r\n.\r\n";
        let wire = stuff(body).await;
        assert_eq!(wire, b"\r\n..\r\n.\r\n");
        let (read_back, _) = destuff(&wire).await;
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn leading_double_dot() {
        let body = b"..leading\r\n";
        let wire = stuff(body).await;
        assert_eq!(wire, b"...leading\r\n.\r\n");
        let (read_back, _) = destuff(&wire).await;
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn line_without_trailing_newline() {
        let body = b"half a line";
        let wire = stuff(body).await;
        assert_eq!(wire, b"half a line\r\n.\r\n");
        let (read_back, _) = destuff(&wire).await;
        assert_eq!(read_back, b"half a line\r\n");
    }

    #[tokio::test]
    async fn stuffed_leading_dot_round_trip() {
        // Writer input `.leading\r\n` produces `..leading\r\n.\r\n` on the
        // wire; reading that wire yields `.leading\r\n` again.
        let wire = stuff(b".leading\r\n").await;
        assert_eq!(wire, b"..leading\r\n.\r\n");
        let (read_back, _) = destuff(&wire).await;
        assert_eq!(read_back, b".leading\r\n");
    }
}
