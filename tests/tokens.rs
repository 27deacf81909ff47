use token_board::client_tokens::{blind, make_spend, unblind};
use token_board::errors::ServerError;
use token_board::tokens::{random_scalar, SpentToken, TokenServer};

fn issue_one(server: &TokenServer) -> token_board::client_tokens::UnblindedToken {
    let (pending, blinded) = blind();
    let (signed, proof) = server.issue(&blinded).unwrap();
    unblind(pending, &signed, &proof, &server.y.compress().as_bytes()[..]).unwrap()
}

#[test]
fn token_spends_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = TokenServer::open(random_scalar(), dir.path()).unwrap();

    let spend = make_spend(&issue_one(&server));
    server.spend(&spend).unwrap();
    assert!(matches!(
        server.spend(&spend).unwrap_err(),
        ServerError::TokenAlreadySpent
    ));
}

#[test]
fn spent_set_is_durable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let k = random_scalar();

    let spend = {
        let server = TokenServer::open(k, dir.path()).unwrap();
        let spend = make_spend(&issue_one(&server));
        server.spend(&spend).unwrap();
        server.close();
        spend
    };

    let server = TokenServer::open(k, dir.path()).unwrap();
    assert!(matches!(
        server.spend(&spend).unwrap_err(),
        ServerError::TokenAlreadySpent
    ));
}

#[test]
fn forged_token_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let server = TokenServer::open(random_scalar(), dir.path()).unwrap();

    // a token never issued by this server
    let other_dir = tempfile::tempdir().unwrap();
    let other = TokenServer::open(random_scalar(), other_dir.path()).unwrap();
    let spend = make_spend(&issue_one(&other));

    assert!(matches!(
        server.spend(&spend).unwrap_err(),
        ServerError::TokenInvalid
    ));
}

#[test]
fn garbage_point_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let server = TokenServer::open(random_scalar(), dir.path()).unwrap();
    let spend = SpentToken {
        point: vec![0xff; 32],
        nonce: vec![1; 16],
        mac: vec![2; 32],
    };
    assert!(matches!(
        server.spend(&spend).unwrap_err(),
        ServerError::TokenInvalid
    ));
    assert!(server.issue(&[0xff; 7]).is_err());
}

#[test]
fn two_tokens_have_independent_spends() {
    let dir = tempfile::tempdir().unwrap();
    let server = TokenServer::open(random_scalar(), dir.path()).unwrap();

    let first = make_spend(&issue_one(&server));
    let second = make_spend(&issue_one(&server));
    server.spend(&first).unwrap();
    server.spend(&second).unwrap();
}
