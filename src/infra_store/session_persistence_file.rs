use crate::application_port::SessionError;
use crate::domain_model::Session;
use crate::domain_port::SessionPersistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    version: u32,
    saved_at: DateTime<Utc>,
    session: Session,
}

/// Keeps the session in a JSON file. Writes go to a randomly named temp file
/// in the same directory, are synced, and then renamed over the target, so
/// readers never see a torn pair.
pub struct FileSessionPersistence {
    path: PathBuf,
}

impl FileSessionPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

fn persistence_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::Persistence(e.to_string())
}

impl SessionPersistence for FileSessionPersistence {
    fn load(&self) -> Result<Option<Session>, SessionError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence_error(e)),
        };

        let record: SessionRecord =
            serde_json::from_str(&data).map_err(|e| SessionError::Malformed(e.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(SessionError::Malformed(format!(
                "unsupported session record version {}",
                record.version
            )));
        }
        Ok(Some(record.session))
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        let dir = self.dir();
        std::fs::create_dir_all(dir).map_err(persistence_error)?;

        let record = SessionRecord {
            version: RECORD_VERSION,
            saved_at: Utc::now(),
            session: session.clone(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(persistence_error)?;

        // random name opened with O_EXCL, so nothing planted next to the
        // session file can redirect the write
        let mut temp = NamedTempFile::new_in(dir).map_err(persistence_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(persistence_error)?;
        }

        temp.as_file_mut()
            .write_all(&json)
            .map_err(persistence_error)?;
        temp.as_file().sync_all().map_err(persistence_error)?;
        temp.persist(&self.path)
            .map_err(|e| persistence_error(e.error))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_model::{Role, TokenPair};

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FileSessionPersistence::new(dir.path().join("session.json"));
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn saved_session_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let session = Session::from_pair(TokenPair::new("A1", "R1"), Role::Manager);

        FileSessionPersistence::new(&path).save(&session).unwrap();

        let reloaded = FileSessionPersistence::new(&path).load().unwrap();
        assert_eq!(reloaded, Some(session));
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[test]
    fn planted_temp_symlink_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, "untouched").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("session.json.tmp")).unwrap();

        let session = Session::from_pair(TokenPair::new("A1", "R1"), Role::User);
        FileSessionPersistence::new(&path).save(&session).unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "untouched");
        assert_eq!(FileSessionPersistence::new(&path).load().unwrap(), Some(session));
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        FileSessionPersistence::new(&path)
            .save(&Session::from_pair(TokenPair::new("A1", "R1"), Role::User))
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FileSessionPersistence::new(dir.path().join("session.json"));
        persistence
            .save(&Session::from_pair(TokenPair::new("A1", "R1"), Role::User))
            .unwrap();

        persistence.clear().unwrap();
        persistence.clear().unwrap();
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn garbage_file_is_reported_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = FileSessionPersistence::new(&path).load();
        assert!(matches!(result, Err(SessionError::Malformed(_))));
    }
}
