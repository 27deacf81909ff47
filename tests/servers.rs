use token_board::config::ATTR_DESCRIPTION;
use token_board::{Servers, DEFAULT_PASSWORD};

const TEST_SERVER_DESC: &str = "a test server";

#[tokio::test]
async fn create_load_get_round_trip() {
    let root = tempfile::tempdir().unwrap();

    let servers = Servers::new(root.path().to_path_buf());
    let server = servers.create_server(DEFAULT_PASSWORD).unwrap();
    server.set_attribute(ATTR_DESCRIPTION, TEST_SERVER_DESC).unwrap();
    let onion = server.onion();
    let petname = server.hash_name();
    server.shutdown().await;

    let servers2 = Servers::new(root.path().to_path_buf());
    let loaded = servers2.load_servers(DEFAULT_PASSWORD).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0], onion);

    let reloaded = servers2.get_server(&loaded[0]).unwrap();
    assert_eq!(
        reloaded.get_attribute(ATTR_DESCRIPTION).as_deref(),
        Some(TEST_SERVER_DESC)
    );
    // the petname is a pure function of the persisted key
    assert_eq!(reloaded.hash_name(), petname);

    servers2.shutdown().await;
}

#[tokio::test]
async fn wrong_password_skips_server() {
    let root = tempfile::tempdir().unwrap();

    let servers = Servers::new(root.path().to_path_buf());
    let server = servers.create_server("a strong passphrase").unwrap();
    server.shutdown().await;

    let servers2 = Servers::new(root.path().to_path_buf());
    let loaded = servers2.load_servers("not the passphrase").unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn unrelated_directories_are_ignored() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("not-an-onion")).unwrap();

    let servers = Servers::new(root.path().to_path_buf());
    let loaded = servers.load_servers(DEFAULT_PASSWORD).unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn delete_requires_matching_password() {
    let root = tempfile::tempdir().unwrap();

    let servers = Servers::new(root.path().to_path_buf());
    let server = servers.create_server("correct horse").unwrap();
    let onion = server.onion();

    let err = server.delete("battery staple").await.unwrap_err();
    assert!(matches!(err, token_board::ServerError::BadPassword));
    assert!(root
        .path()
        .join(onion.trim_end_matches(".onion"))
        .exists());

    server.delete("correct horse").await.unwrap();
    assert!(!root
        .path()
        .join(onion.trim_end_matches(".onion"))
        .exists());
}
