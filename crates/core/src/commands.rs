//! Command handling for the host bridge
//!
//! A host (mobile plugin, CLI, IPC shim) sends an action name plus a JSON
//! argument array and gets back either a JSON value or a coded error.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::actions;
use crate::crypto::{KeyManager, KeyPairStatus};
use crate::error::SignatureError;
use crate::signature::{Payload, SignatureEngine};

/// Error code for actions the dispatcher does not know
pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";

/// Represents the result of executing a command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(Value),
    Error { code: String, message: String },
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Bridge envelope: `{"ok": value}` or `{"error": {"code", "message"}}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(value) => json!({ "ok": value }),
            Self::Error { code, message } => json!({ "error": { "code": code, "message": message } }),
        }
    }
}

impl From<SignatureError> for CommandResult {
    fn from(error: SignatureError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Available bridge commands
#[derive(Debug, Clone, PartialEq)]
pub enum KeysignCommand {
    Sign {
        uid: String,
        payload: Payload,
        last_modified: i64,
    },
    Verify {
        /// Packet object or its serialized text, decoded after the key
        packet: Value,
        public_key_text: String,
        expected_signer_id: String,
    },
    GenKeyPairIfNecessary {
        uid: String,
    },
    GetPublicKey {
        uid: String,
    },
}

impl KeysignCommand {
    /// Parse an action name and its positional arguments.
    ///
    /// Returns `None` for an unknown action.
    pub fn parse(action: &str, args: &[Value]) -> Option<Result<Self, SignatureError>> {
        let command = match action {
            actions::SIGN => expect_arity(action, args, 3).and_then(|_| {
                Ok(Self::Sign {
                    uid: string_arg(action, args, 0)?,
                    payload: Payload::from_json(&args[1])?,
                    last_modified: args[2].as_i64().ok_or_else(|| {
                        invalid(action, "argument 3 (lastModified) must be an integer of milliseconds")
                    })?,
                })
            }),
            actions::VERIFY => expect_arity(action, args, 3).and_then(|_| {
                Ok(Self::Verify {
                    packet: packet_arg(&args[0])?,
                    public_key_text: string_arg(action, args, 1)?,
                    expected_signer_id: string_arg(action, args, 2)?,
                })
            }),
            actions::GEN_KEY_PAIR_IF_NECESSARY => expect_arity(action, args, 1).and_then(|_| {
                Ok(Self::GenKeyPairIfNecessary {
                    uid: string_arg(action, args, 0)?,
                })
            }),
            actions::GET_PUBLIC_KEY => expect_arity(action, args, 1).and_then(|_| {
                Ok(Self::GetPublicKey {
                    uid: string_arg(action, args, 0)?,
                })
            }),
            _ => return None,
        };
        Some(command)
    }

    /// Get help text for all actions
    pub fn help_text() -> String {
        r#"
Keysign Actions:

  sign                   [uid, payload, lastModified]        -> signature packet
  verify                 [packet, publicKeyText, signerID]   -> true | false
  genKeyPairIfNecessary  [uid]                               -> "generated" | "valid"
  getPublicKey           [uid]                               -> PEM text

Payload values may be strings, integers, booleans or {"$bytes": "<base64>"}.
        "#
        .to_string()
    }
}

fn invalid(action: &str, reason: &str) -> SignatureError {
    SignatureError::InvalidArgument(format!("{}: {}", action, reason))
}

fn expect_arity(action: &str, args: &[Value], expected: usize) -> Result<(), SignatureError> {
    if args.len() != expected {
        return Err(invalid(
            action,
            &format!("expected {} argument(s), got {}", expected, args.len()),
        ));
    }
    Ok(())
}

fn string_arg(action: &str, args: &[Value], index: usize) -> Result<String, SignatureError> {
    args[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(action, &format!("argument {} must be a string", index + 1)))
}

/// Packets arrive either as a JSON object or as its serialized text.
fn packet_arg(value: &Value) -> Result<Value, SignatureError> {
    match value {
        Value::String(_) | Value::Object(_) => Ok(value.clone()),
        _ => Err(invalid(actions::VERIFY, "argument 1 must be a signature packet")),
    }
}

/// Dispatches bridge commands to the key manager and signature engine
#[derive(Clone)]
pub struct CommandDispatcher {
    key_manager: Arc<KeyManager>,
    engine: SignatureEngine,
}

impl CommandDispatcher {
    pub fn new(key_manager: Arc<KeyManager>, engine: SignatureEngine) -> Self {
        Self { key_manager, engine }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    /// Run `action` synchronously. May block on the key store.
    pub fn execute(&self, action: &str, args: &[Value]) -> CommandResult {
        debug!("Executing {} with {} argument(s)", action, args.len());

        let result = match KeysignCommand::parse(action, args) {
            None => {
                warn!("Unknown action: {}", action);
                return CommandResult::Error {
                    code: UNKNOWN_ACTION.to_string(),
                    message: format!("Unknown action: {}", action),
                };
            }
            Some(Err(e)) => Err(e),
            Some(Ok(command)) => self.execute_command(command),
        };

        match result {
            Ok(value) => CommandResult::Success(value),
            Err(e) => {
                warn!("{} failed: {}", action, e);
                e.into()
            }
        }
    }

    /// Run `action` on tokio's blocking pool.
    pub async fn execute_async(&self, action: String, args: Vec<Value>) -> CommandResult {
        let dispatcher = self.clone();
        match tokio::task::spawn_blocking(move || dispatcher.execute(&action, &args)).await {
            Ok(result) => result,
            Err(e) => CommandResult::from(SignatureError::Store(format!("command task failed: {}", e))),
        }
    }

    /// Execute a parsed command
    pub fn execute_command(&self, command: KeysignCommand) -> Result<Value, SignatureError> {
        match command {
            KeysignCommand::Sign {
                uid,
                payload,
                last_modified,
            } => {
                let key = self.key_manager.private_key_ref(&uid)?;
                let packet = self.engine.sign(payload, &key, &uid, last_modified)?;
                packet.to_json()
            }

            KeysignCommand::Verify {
                packet,
                public_key_text,
                expected_signer_id,
            } => {
                let valid = self.engine.verify_json(&packet, &public_key_text, &expected_signer_id)?;
                Ok(Value::Bool(valid))
            }

            KeysignCommand::GenKeyPairIfNecessary { uid } => match self.key_manager.generate_key_pair_if_necessary(&uid) {
                KeyPairStatus::Failed(reason) => Err(SignatureError::KeyGenerationFailed { uid, reason }),
                status => Ok(Value::String(status.as_str().to_string())),
            },

            KeysignCommand::GetPublicKey { uid } => Ok(Value::String(self.key_manager.public_key(&uid)?)),
        }
    }
}
