//! Operator prompts as an injected capability.
//!
//! Sessions never read the terminal directly; they go through a
//! [`PromptGate`]. [`TerminalPrompt`] is the interactive implementation,
//! [`ScriptedPrompt`] answers from a fixed script.

use crate::codec::Method;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allow this request only.
    AllowOnce,
    /// Reject this request.
    Deny,
    /// Allow and remember the grant.
    AllowAlways,
}

/// Parses an operator answer. `None` means ask again.
///
/// # Examples
///
/// ```
/// use nkcli::prompt::{parse_decision, Decision};
///
/// assert_eq!(parse_decision(" A\n"), Some(Decision::AllowAlways));
/// assert_eq!(parse_decision("maybe"), None);
/// ```
#[must_use]
pub fn parse_decision(input: &str) -> Option<Decision> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Decision::AllowOnce),
        "n" | "no" => Some(Decision::Deny),
        "a" | "always" => Some(Decision::AllowAlways),
        _ => None,
    }
}

/// What the operator is asked to approve.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    /// Application display name.
    pub app_name: String,
    /// Application public key (hex).
    pub app_id: String,
    /// Requested method.
    pub method: Method,
    /// Human-readable arguments, if any.
    pub detail: Option<String>,
}

/// Source of passphrases and permission decisions.
#[async_trait]
pub trait PromptGate: Send + Sync {
    /// Asks for the passphrase of key `pubkey` (hex). `None` when the
    /// operator gives up or input is closed.
    async fn ask_unlock(&self, pubkey: &str) -> Option<Zeroizing<String>>;

    /// Asks whether to allow `request`. Must return one of the three
    /// decisions; implementations loop on unrecognized input.
    async fn ask_permission(&self, request: &PermissionRequest) -> Decision;
}

/// Interactive prompts on stdin/stdout.
///
/// Prompts are serialized so concurrent sessions never interleave their
/// questions. Each question blocks a thread from the runtime's blocking
/// pool until a line arrives. A prompt still open at shutdown keeps that
/// thread reading, so the binary shuts its runtime down with a timeout
/// instead of waiting for it.
#[derive(Debug, Default)]
pub struct TerminalPrompt {
    lock: tokio::sync::Mutex<()>,
}

impl TerminalPrompt {
    /// Creates a terminal prompt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Prints `question` and reads one line. `None` on EOF or read error.
pub fn read_line(question: &str) -> Option<String> {
    print!("{question}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Prints `question` and reads a secret without echoing it. Falls back to
/// a plain line when stdin is not a terminal. `None` on EOF or read error.
pub fn read_secret(question: &str) -> Option<Zeroizing<String>> {
    if !std::io::stdin().is_terminal() {
        return read_line(question).map(Zeroizing::new);
    }
    rpassword::prompt_password(question).ok().map(Zeroizing::new)
}

#[async_trait]
impl PromptGate for TerminalPrompt {
    async fn ask_unlock(&self, pubkey: &str) -> Option<Zeroizing<String>> {
        let _guard = self.lock.lock().await;
        let question = format!("\n  Passphrase for {pubkey}: ");
        tokio::task::spawn_blocking(move || read_secret(&question))
            .await
            .ok()
            .flatten()
    }

    async fn ask_permission(&self, request: &PermissionRequest) -> Decision {
        let _guard = self.lock.lock().await;
        let mut banner = format!(
            "\n  {} ({}) requests {}\n",
            request.app_name, request.app_id, request.method
        );
        if let Some(detail) = &request.detail {
            banner.push_str(detail);
            banner.push('\n');
        }
        tokio::task::spawn_blocking(move || {
            println!("{banner}");
            loop {
                match read_line("  Allow? [y]es once / [n]o / [a]lways: ") {
                    None => return Decision::Deny,
                    Some(answer) => {
                        if let Some(decision) = parse_decision(&answer) {
                            return decision;
                        }
                    }
                }
            }
        })
        .await
        .unwrap_or(Decision::Deny)
    }
}

/// Answers prompts from a script and counts how often it was asked.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPrompt {
    inner: Arc<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    passphrase: Option<String>,
    decisions: Mutex<VecDeque<Decision>>,
    unlock_asks: AtomicUsize,
    permission_asks: AtomicUsize,
}

impl ScriptedPrompt {
    /// Script that unlocks with `passphrase` (or refuses if `None`) and
    /// answers permission prompts with `decisions` in order, then denies.
    #[must_use]
    pub fn new(passphrase: Option<&str>, decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            inner: Arc::new(ScriptState {
                passphrase: passphrase.map(str::to_owned),
                decisions: Mutex::new(decisions.into_iter().collect()),
                unlock_asks: AtomicUsize::new(0),
                permission_asks: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of unlock prompts so far.
    #[must_use]
    pub fn unlock_asks(&self) -> usize {
        self.inner.unlock_asks.load(Ordering::SeqCst)
    }

    /// Number of permission prompts so far.
    #[must_use]
    pub fn permission_asks(&self) -> usize {
        self.inner.permission_asks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PromptGate for ScriptedPrompt {
    async fn ask_unlock(&self, _pubkey: &str) -> Option<Zeroizing<String>> {
        self.inner.unlock_asks.fetch_add(1, Ordering::SeqCst);
        self.inner.passphrase.clone().map(Zeroizing::new)
    }

    async fn ask_permission(&self, _request: &PermissionRequest) -> Decision {
        self.inner.permission_asks.fetch_add(1, Ordering::SeqCst);
        let mut queue = match self.inner.decisions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front().unwrap_or(Decision::Deny)
    }
}
