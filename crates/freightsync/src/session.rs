//! Persisted authentication session.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::ids;

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Server id.
    #[serde(deserialize_with = "ids::string")]
    pub id: String,
    /// Login email.
    pub email: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Company the user belongs to.
    #[serde(default)]
    pub company_code: Option<String>,
}

/// An access token with its expiry and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token sent with every request.
    pub access_token: String,
    /// When the token stops being accepted; `None` if unknown.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// The signed-in user, once known.
    #[serde(default)]
    pub user: Option<UserInfo>,
}

impl Session {
    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Holds the current session, optionally persisted as a JSON file.
#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    current: Mutex<Option<Session>>,
}

impl SessionStore {
    /// Open the session file at `path`. A missing file means signed out.
    ///
    /// An unreadable or corrupt file is logged and treated as signed out.
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let current = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt session file");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read session file");
                None
            }
        };
        Self {
            path: Some(path),
            current: Mutex::new(current),
        }
    }

    /// A session store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    /// The backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn guard(&self) -> Result<MutexGuard<'_, Option<Session>>> {
        self.current
            .lock()
            .map_err(|_| Error::internal("session lock poisoned"))
    }

    /// The stored session, expired or not.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.guard().ok().and_then(|session| session.clone())
    }

    /// The access token, unless missing or expired.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.current()
            .filter(|session| !session.is_expired(Utc::now()))
            .map(|session| session.access_token)
    }

    /// Whether a usable token is present.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Replace the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be written.
    pub fn save(&self, session: Session) -> Result<()> {
        let mut current = self.guard()?;
        if let Some(path) = &self.path {
            write_session_file(path, &session)?;
        }
        debug!(user = ?session.user.as_ref().map(|u| &u.email), "Session saved");
        *current = Some(session);
        Ok(())
    }

    /// Attach user details to the current session.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no session or the file cannot be written.
    pub fn set_user(&self, user: UserInfo) -> Result<()> {
        let mut session = self.current().ok_or(Error::SessionExpired)?;
        session.user = Some(user);
        self.save(session)
    }

    /// Sign out. Removes the session file.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        let mut current = self.guard()?;
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if current.take().is_some() {
            debug!("Session cleared");
        }
        Ok(())
    }
}

fn write_session_file(path: &Path, session: &Session) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(session)?)?;
    restrict_permissions(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
