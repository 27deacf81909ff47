//! Composable, capability-gated protocol applications. Each hidden-service
//! endpoint serves a fixed chain of applications; a frame reaches an
//! application only once every capability it requires has been attached to
//! the connection by an earlier stage.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::ServerError;
use crate::pow;
use crate::tokens::TokenServer;
use crate::wire::Frame;

pub type Capability = &'static str;

pub const SUCCESSFUL_PROOF_OF_WORK: Capability = "SuccessfulProofOfWork";
pub const HAS_TOKENS: Capability = "HasTokens";

/// Per-connection state threaded through the application chain.
pub struct ConnectionCtx {
    capabilities: HashSet<Capability>,
    pub token_balance: u64,
    pub pow_challenge: Option<Vec<u8>>,
}

impl ConnectionCtx {
    pub fn new() -> ConnectionCtx {
        ConnectionCtx {
            capabilities: HashSet::new(),
            token_balance: 0,
            pow_challenge: None,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn grant(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }
}

impl Default for ConnectionCtx {
    fn default() -> Self {
        ConnectionCtx::new()
    }
}

#[async_trait]
pub trait Application: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capabilities that must already be attached to the connection before
    /// this application may see a frame.
    fn requires(&self) -> &'static [Capability];

    /// Whether this application handles the given frame kind.
    fn accepts(&self, frame: &Frame) -> bool;

    /// Frames to emit when a connection is established.
    async fn on_connect(&self, _ctx: &mut ConnectionCtx) -> Vec<Frame> {
        vec![]
    }

    async fn handle(
        &self,
        ctx: &mut ConnectionCtx,
        frame: Frame,
    ) -> Result<Vec<Frame>, ServerError>;
}

/// An ordered chain of applications sharing one connection.
pub struct ApplicationChain {
    apps: Vec<Arc<dyn Application>>,
}

impl ApplicationChain {
    pub fn new() -> ApplicationChain {
        ApplicationChain { apps: vec![] }
    }

    pub fn chain(mut self, app: Arc<dyn Application>) -> ApplicationChain {
        self.apps.push(app);
        self
    }

    pub async fn on_connect(&self, ctx: &mut ConnectionCtx) -> Vec<Frame> {
        let mut out = vec![];
        for app in &self.apps {
            out.extend(app.on_connect(ctx).await);
        }
        out
    }

    /// Routes a frame to the first application accepting its kind. A frame
    /// for a stage whose capabilities are not yet attached, or a frame no
    /// stage accepts, is a protocol violation.
    pub async fn dispatch(
        &self,
        ctx: &mut ConnectionCtx,
        frame: Frame,
    ) -> Result<Vec<Frame>, ServerError> {
        for app in &self.apps {
            if !app.accepts(&frame) {
                continue;
            }
            for &cap in app.requires() {
                if !ctx.has(cap) {
                    debug!("{} frame before capability {}", app.name(), cap);
                    return Err(ServerError::MissingCapability(cap));
                }
            }
            return app.handle(ctx, frame).await;
        }
        Err(ServerError::Protocol("unexpected frame"))
    }
}

impl Default for ApplicationChain {
    fn default() -> Self {
        ApplicationChain::new()
    }
}

/// First stage of every chain: a hashcash challenge handed out at connect.
pub struct ProofOfWorkApp {
    difficulty: u32,
}

impl ProofOfWorkApp {
    pub fn new() -> ProofOfWorkApp {
        ProofOfWorkApp {
            difficulty: pow::POW_DIFFICULTY,
        }
    }

    pub fn with_difficulty(difficulty: u32) -> ProofOfWorkApp {
        ProofOfWorkApp { difficulty }
    }
}

impl Default for ProofOfWorkApp {
    fn default() -> Self {
        ProofOfWorkApp::new()
    }
}

#[async_trait]
impl Application for ProofOfWorkApp {
    fn name(&self) -> &'static str {
        "proof-of-work"
    }

    fn requires(&self) -> &'static [Capability] {
        &[]
    }

    fn accepts(&self, frame: &Frame) -> bool {
        matches!(frame, Frame::PowSolution { .. })
    }

    async fn on_connect(&self, ctx: &mut ConnectionCtx) -> Vec<Frame> {
        let challenge = pow::new_challenge();
        ctx.pow_challenge = Some(challenge.clone());
        vec![Frame::PowChallenge {
            challenge,
            difficulty: self.difficulty,
        }]
    }

    async fn handle(
        &self,
        ctx: &mut ConnectionCtx,
        frame: Frame,
    ) -> Result<Vec<Frame>, ServerError> {
        let Frame::PowSolution { solution } = frame else {
            return Err(ServerError::Protocol("unexpected frame"));
        };
        if ctx.has(SUCCESSFUL_PROOF_OF_WORK) {
            return Err(ServerError::Protocol("proof of work already presented"));
        }
        let challenge = ctx
            .pow_challenge
            .as_deref()
            .ok_or(ServerError::Protocol("no challenge outstanding"))?;
        if !pow::check(challenge, solution, self.difficulty) {
            return Err(ServerError::PowInvalid);
        }
        ctx.grant(SUCCESSFUL_PROOF_OF_WORK);
        Ok(vec![Frame::PowResult { accepted: true }])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAppMode {
    /// The issuance endpoint: blind-sign requests.
    Issue,
    /// The board endpoint: spend verification crediting the connection.
    Spend,
}

/// Privacy-pass stage. In issue mode it signs blinded points; in spend mode
/// it burns presented tokens and credits the connection's token balance.
pub struct TokenApp {
    mode: TokenAppMode,
    tokens: Arc<TokenServer>,
}

impl TokenApp {
    pub fn new(mode: TokenAppMode, tokens: Arc<TokenServer>) -> TokenApp {
        TokenApp { mode, tokens }
    }
}

#[async_trait]
impl Application for TokenApp {
    fn name(&self) -> &'static str {
        "tokens"
    }

    fn requires(&self) -> &'static [Capability] {
        &[SUCCESSFUL_PROOF_OF_WORK]
    }

    fn accepts(&self, frame: &Frame) -> bool {
        match self.mode {
            TokenAppMode::Issue => matches!(frame, Frame::IssueRequest { .. }),
            TokenAppMode::Spend => matches!(frame, Frame::SpendToken { .. }),
        }
    }

    async fn handle(
        &self,
        ctx: &mut ConnectionCtx,
        frame: Frame,
    ) -> Result<Vec<Frame>, ServerError> {
        match frame {
            Frame::IssueRequest { blinded } => {
                let (signed, proof) = self.tokens.issue(&blinded)?;
                ctx.grant(HAS_TOKENS);
                Ok(vec![Frame::IssueResponse { signed, proof }])
            }
            Frame::SpendToken { token } => match self.tokens.spend(&token) {
                Ok(()) => {
                    ctx.grant(HAS_TOKENS);
                    ctx.token_balance += 1;
                    Ok(vec![Frame::SpendResult {
                        accepted: true,
                        error_code: None,
                    }])
                }
                Err(e) if e.is_token_failure() => Ok(vec![Frame::SpendResult {
                    accepted: false,
                    error_code: Some(e.code()),
                }]),
                Err(e) => Err(e),
            },
            _ => Err(ServerError::Protocol("unexpected frame")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::random_scalar;

    #[tokio::test]
    async fn chain_rejects_frames_before_capability() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenServer::open(random_scalar(), dir.path()).unwrap());
        let chain = ApplicationChain::new()
            .chain(Arc::new(ProofOfWorkApp::new()))
            .chain(Arc::new(TokenApp::new(TokenAppMode::Issue, tokens)));

        let mut ctx = ConnectionCtx::new();
        let err = chain
            .dispatch(
                &mut ctx,
                Frame::IssueRequest {
                    blinded: vec![0u8; 32],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::MissingCapability(_)));
    }

    #[tokio::test]
    async fn pow_handshake_grants_capability() {
        let chain = ApplicationChain::new().chain(Arc::new(ProofOfWorkApp::with_difficulty(8)));
        let mut ctx = ConnectionCtx::new();
        let greeting = chain.on_connect(&mut ctx).await;
        let Frame::PowChallenge {
            challenge,
            difficulty,
        } = &greeting[0]
        else {
            panic!("expected a challenge frame");
        };

        let solution = pow::solve(challenge, *difficulty);
        let replies = chain
            .dispatch(&mut ctx, Frame::PowSolution { solution })
            .await
            .unwrap();
        assert!(matches!(replies[0], Frame::PowResult { accepted: true }));
        assert!(ctx.has(SUCCESSFUL_PROOF_OF_WORK));
    }

    #[tokio::test]
    async fn bad_pow_solution_is_fatal() {
        let chain = ApplicationChain::new().chain(Arc::new(ProofOfWorkApp::with_difficulty(32)));
        let mut ctx = ConnectionCtx::new();
        chain.on_connect(&mut ctx).await;
        let err = chain
            .dispatch(&mut ctx, Frame::PowSolution { solution: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::PowInvalid));
        assert!(!ctx.has(SUCCESSFUL_PROOF_OF_WORK));
    }
}
