//! The token board application: the final stage of the board endpoint's
//! chain. Accepts posts (each backed by a spent token) and replays the
//! message history to syncing clients.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::applications::{Application, Capability, ConnectionCtx, HAS_TOKENS};
use crate::errors::ServerError;
use crate::storage::MessageStore;
use crate::tokens::TokenServer;
use crate::wire::Frame;

pub struct TokenBoardApp {
    store: Arc<dyn MessageStore>,
    tokens: Arc<TokenServer>,
}

impl TokenBoardApp {
    pub fn new(store: Arc<dyn MessageStore>, tokens: Arc<TokenServer>) -> TokenBoardApp {
        TokenBoardApp { store, tokens }
    }
}

#[async_trait]
impl Application for TokenBoardApp {
    fn name(&self) -> &'static str {
        "token-board"
    }

    fn requires(&self) -> &'static [Capability] {
        &[HAS_TOKENS]
    }

    fn accepts(&self, frame: &Frame) -> bool {
        matches!(frame, Frame::Post { .. } | Frame::Replay { .. })
    }

    async fn handle(
        &self,
        ctx: &mut ConnectionCtx,
        frame: Frame,
    ) -> Result<Vec<Frame>, ServerError> {
        match frame {
            Frame::Post { message, token } => {
                if let Some(token) = token {
                    match self.tokens.spend(&token) {
                        Ok(()) => ctx.token_balance += 1,
                        Err(e) if e.is_token_failure() => {
                            debug!("rejected post token: {}", e);
                            return Ok(vec![Frame::PostResult {
                                accepted: false,
                                error_code: Some(e.code()),
                            }]);
                        }
                        Err(e) => return Err(e),
                    }
                }
                if ctx.token_balance == 0 {
                    let e = ServerError::NoTokenBalance;
                    return Ok(vec![Frame::PostResult {
                        accepted: false,
                        error_code: Some(e.code()),
                    }]);
                }
                ctx.token_balance -= 1;
                self.store.add(message);
                Ok(vec![Frame::PostResult {
                    accepted: true,
                    error_code: None,
                }])
            }
            Frame::Replay {
                last_seen_signature,
            } => {
                let messages = match last_seen_signature {
                    Some(sig) => self.store.fetch_from(&sig),
                    None => self.store.fetch_all(),
                };
                let mut out: Vec<Frame> = messages
                    .into_iter()
                    .map(|message| Frame::ReplayStream { message })
                    .collect();
                out.push(Frame::ReplayEnd {});
                Ok(out)
            }
            _ => Err(ServerError::Protocol("unexpected frame")),
        }
    }
}
