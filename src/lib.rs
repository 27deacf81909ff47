pub mod applications;
pub mod board;
pub mod client_tokens;
pub mod config;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod petname;
pub mod pow;
pub mod server;
pub mod servers;
pub mod service;
pub mod storage;
pub mod tokens;
pub mod wire;

pub use config::{Config, ConfigStore, Reporting};
pub use errors::{ErrorCode, ServerError};
pub use server::{Server, Statistics};
pub use servers::{Servers, DEFAULT_PASSWORD};
pub use service::{Acn, LocalAcn};
pub use storage::{EncryptedGroupMessage, MessageStore};

#[cfg(test)]
mod tests {
    use crate::*;

    #[tokio::test]
    async fn server_round_trip_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::create(dir.path(), None).unwrap();
        let server = Server::new(config).unwrap();

        let acn = LocalAcn::new();
        server.run(&acn).await.unwrap();
        let (running, err) = server.check_status().await;
        assert!(running);
        assert!(err.is_none());

        // run is idempotent
        server.run(&acn).await.unwrap();

        let bundle = server.key_bundle().unwrap();
        assert!(bundle.verify(&server_public_key(&server)));
        assert!(server.server_bundle().unwrap().starts_with("server:"));
        assert!(server.tofu_bundle().unwrap().starts_with("tofubundle:server:"));
        assert_eq!(server.hash_name().split('-').count(), 8);

        server.shutdown().await;
        let (running, _) = server.check_status().await;
        assert!(!running);
    }

    fn server_public_key(server: &Server) -> [u8; 32] {
        use data_encoding::BASE32_NOPAD;
        let onion = server.onion();
        let hostname = onion.trim_end_matches(".onion");
        let raw = BASE32_NOPAD
            .decode(hostname.to_ascii_uppercase().as_bytes())
            .unwrap();
        raw[..32].try_into().unwrap()
    }
}
