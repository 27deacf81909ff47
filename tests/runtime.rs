//! Full two-endpoint session over loopback connectivity: proof of work,
//! token issuance, spending, posting and replay.

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use token_board::client_tokens::{blind, make_spend, unblind, UnblindedToken};
use token_board::pow;
use token_board::wire::{read_frame, write_frame, Frame};
use token_board::{Acn, ConfigStore, EncryptedGroupMessage, LocalAcn, Server};

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn open(acn: &LocalAcn, onion: &str) -> Conn {
        let stream = acn.connect(onion).await.unwrap();
        let (r, w) = stream.into_split();
        Conn {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, frame: &Frame) {
        write_frame(&mut self.writer, frame).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        read_frame(&mut self.reader).await.unwrap().expect("peer closed")
    }

    /// Answers the connect-time hashcash challenge.
    async fn pow_handshake(&mut self) {
        let Frame::PowChallenge {
            challenge,
            difficulty,
        } = self.recv().await
        else {
            panic!("expected a pow challenge at connect");
        };
        let solution = pow::solve(&challenge, difficulty);
        self.send(&Frame::PowSolution { solution }).await;
        let Frame::PowResult { accepted: true } = self.recv().await else {
            panic!("pow solution rejected");
        };
    }

    async fn issue_token(&mut self, server_public: &[u8]) -> UnblindedToken {
        let (pending, blinded) = blind();
        self.send(&Frame::IssueRequest { blinded }).await;
        let Frame::IssueResponse { signed, proof } = self.recv().await else {
            panic!("expected an issue response");
        };
        unblind(pending, &signed, &proof, server_public).unwrap()
    }
}

fn message(i: u32) -> EncryptedGroupMessage {
    EncryptedGroupMessage {
        signature: format!("signature-{i}").into_bytes(),
        ciphertext: format!("ciphertext-{i}").into_bytes(),
    }
}

#[tokio::test]
async fn full_session_post_and_replay() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::create(dir.path(), None).unwrap();
    let server = Server::new(config).unwrap();
    let acn = LocalAcn::new();
    server.run(&acn).await.unwrap();

    let server_public = {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bundle = server.key_bundle().unwrap();
        STANDARD
            .decode(bundle.key("privacy_pass").unwrap())
            .unwrap()
    };

    // issuance endpoint: two tokens on one connection
    let mut token_conn = Conn::open(&acn, &server.token_onion()).await;
    token_conn.pow_handshake().await;
    let t1 = token_conn.issue_token(&server_public).await;
    let t2 = token_conn.issue_token(&server_public).await;

    // board endpoint: open the channel with one spend, then post
    let mut board = Conn::open(&acn, &server.onion()).await;
    board.pow_handshake().await;
    board
        .send(&Frame::SpendToken {
            token: make_spend(&t1),
        })
        .await;
    let Frame::SpendResult { accepted: true, .. } = board.recv().await else {
        panic!("expected the channel-opening spend to be accepted");
    };

    board
        .send(&Frame::Post {
            message: message(1),
            token: None,
        })
        .await;
    let Frame::PostResult { accepted: true, .. } = board.recv().await else {
        panic!("first post should consume the channel balance");
    };

    board
        .send(&Frame::Post {
            message: message(2),
            token: Some(make_spend(&t2)),
        })
        .await;
    let Frame::PostResult { accepted: true, .. } = board.recv().await else {
        panic!("second post should be paid by its attached token");
    };

    // balance exhausted: a bare post is refused
    board
        .send(&Frame::Post {
            message: message(3),
            token: None,
        })
        .await;
    let Frame::PostResult {
        accepted: false,
        error_code: Some(_),
    } = board.recv().await
    else {
        panic!("post without balance must be refused");
    };

    // a burned token cannot re-open a channel even with a fresh nonce
    board
        .send(&Frame::SpendToken {
            token: make_spend(&t1),
        })
        .await;
    let Frame::SpendResult {
        accepted: false,
        error_code: Some(code),
    } = board.recv().await
    else {
        panic!("double spend must be refused");
    };
    assert_eq!(code, token_board::ErrorCode::ErrTokenAlreadySpent as u16);

    // replay full history
    board
        .send(&Frame::Replay {
            last_seen_signature: None,
        })
        .await;
    let mut replayed = vec![];
    loop {
        match board.recv().await {
            Frame::ReplayStream { message } => replayed.push(message),
            Frame::ReplayEnd {} => break,
            other => panic!("unexpected frame during replay: {:?}", other),
        }
    }
    assert_eq!(replayed, vec![message(1), message(2)]);

    // suffix replay from the last seen signature
    board
        .send(&Frame::Replay {
            last_seen_signature: Some(message(2).signature),
        })
        .await;
    let Frame::ReplayStream { message: m } = board.recv().await else {
        panic!("expected the suffix to start at the resumption point");
    };
    assert_eq!(m, message(2));
    let Frame::ReplayEnd {} = board.recv().await else {
        panic!("expected end of stream");
    };

    let (running, err) = server.check_status().await;
    assert!(running);
    assert!(err.is_none());
    assert_eq!(server.get_statistics().await.total_messages, 2);

    server.shutdown().await;
    assert!(acn.connect(&server.onion()).await.is_err());
}

#[tokio::test]
async fn frames_before_proof_of_work_drop_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::create(dir.path(), None).unwrap();
    let server = Server::new(config).unwrap();
    let acn = LocalAcn::new();
    server.run(&acn).await.unwrap();

    let mut board = Conn::open(&acn, &server.onion()).await;
    let Frame::PowChallenge { .. } = board.recv().await else {
        panic!("expected a pow challenge at connect");
    };
    board
        .send(&Frame::Replay {
            last_seen_signature: None,
        })
        .await;
    let Frame::Error { .. } = board.recv().await else {
        panic!("expected an error frame for a gated request");
    };
    // the server closes the connection after the error
    assert!(read_frame(&mut board.reader).await.unwrap().is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn persisted_history_replays_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let acn = LocalAcn::new();

    {
        let config = ConfigStore::create(dir.path(), None).unwrap();
        let server = Server::new(config).unwrap();
        server.run(&acn).await.unwrap();

        let server_public = {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            STANDARD
                .decode(server.key_bundle().unwrap().key("privacy_pass").unwrap())
                .unwrap()
        };
        let mut token_conn = Conn::open(&acn, &server.token_onion()).await;
        token_conn.pow_handshake().await;
        let t = token_conn.issue_token(&server_public).await;

        let mut board = Conn::open(&acn, &server.onion()).await;
        board.pow_handshake().await;
        board.send(&Frame::SpendToken { token: make_spend(&t) }).await;
        board.recv().await;
        board
            .send(&Frame::Post {
                message: message(7),
                token: None,
            })
            .await;
        board.recv().await;
        server.shutdown().await;
    }

    let config = ConfigStore::load(dir.path(), None).unwrap();
    let server = Server::new(config).unwrap();
    server.run(&acn).await.unwrap();

    let server_public = {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD
            .decode(server.key_bundle().unwrap().key("privacy_pass").unwrap())
            .unwrap()
    };
    let mut token_conn = Conn::open(&acn, &server.token_onion()).await;
    token_conn.pow_handshake().await;
    let t = token_conn.issue_token(&server_public).await;

    let mut board = Conn::open(&acn, &server.onion()).await;
    board.pow_handshake().await;
    board.send(&Frame::SpendToken { token: make_spend(&t) }).await;
    board.recv().await;
    board
        .send(&Frame::Replay {
            last_seen_signature: None,
        })
        .await;
    let Frame::ReplayStream { message: m } = board.recv().await else {
        panic!("expected the pre-restart message");
    };
    assert_eq!(m, message(7));

    server.shutdown().await;
}
