use crate::broker::DeviceAttribute;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Longest operator-entered name kept.
pub const LOCAL_USER_MAX_CHARS: usize = 31;

/// Resolves the active user for both sinks.
///
/// An operator-entered name wins over the broker attribute and is never
/// replaced by it.
#[derive(Debug, Clone)]
pub struct Identity {
    local: Arc<RwLock<Option<String>>>,
    remote: watch::Receiver<DeviceAttribute>,
}

impl Identity {
    pub fn new(remote: watch::Receiver<DeviceAttribute>) -> Self {
        Self {
            local: Arc::new(RwLock::new(None)),
            remote,
        }
    }

    /// Identity with no broker behind it.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(DeviceAttribute::default());
        Self::new(rx)
    }

    /// Apply a console line (`USER <name>`, `USER:<name>` or a bare name).
    /// Returns the stored name, or `None` when nothing usable was entered.
    pub fn apply_command(&self, line: &str) -> Option<String> {
        let name = parse_user_command(line)?;
        self.set_local(&name);
        Some(name)
    }

    pub fn set_local(&self, name: &str) {
        let name: String = name.chars().take(LOCAL_USER_MAX_CHARS).collect();
        tracing::info!(user = %name, "local user set");
        *self.local.write() = Some(name);
    }

    pub fn has_local(&self) -> bool {
        self.local.read().is_some()
    }

    /// Local override if set, else the broker value if known, else empty.
    pub fn active_user(&self) -> String {
        if let Some(local) = self.local.read().as_ref() {
            return local.clone();
        }
        let remote = self.remote.borrow();
        if remote.known {
            remote.value.clone()
        } else {
            String::new()
        }
    }
}

/// Parse an identity command. The `USER` prefix is matched case-insensitively
/// and may be followed by spaces or a colon. Input stops at CR/LF, is capped
/// at 31 characters and has trailing whitespace trimmed.
pub fn parse_user_command(line: &str) -> Option<String> {
    let mut rest = line.trim_start();
    if rest.len() >= 4 && rest.is_char_boundary(4) && rest[..4].eq_ignore_ascii_case("user") {
        rest = rest[4..].trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    }
    let name: String = rest
        .chars()
        .take_while(|c| *c != '\r' && *c != '\n')
        .take(LOCAL_USER_MAX_CHARS)
        .collect();
    let name = name.trim_end();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
