//! Person and admin directory backed by SQLite.
//!
//! All statements run on tokio-rusqlite's connection thread; callers only
//! ever see owned values.

use lobby_core::Person;
use rand::RngCore;
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS person (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    title       TEXT NOT NULL DEFAULT '',
    image       BLOB,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS admin (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    salt           BLOB NOT NULL,
    password_hash  BLOB NOT NULL
);
";

const DEFAULT_ADMIN_ID: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "1234";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// A person's stored reference photo.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub person_id: String,
    pub name: String,
    pub title: String,
    pub image: Vec<u8>,
}

/// Admin login result. Bad credentials are an answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthOutcome {
    Success { name: String },
    WrongPassword,
    UnknownId,
}

impl AuthOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            AuthOutcome::Success { .. } => "Login Success",
            AuthOutcome::WrongPassword => "Wrong password",
            AuthOutcome::UnknownId => "Id not found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialChangeRequest {
    pub current_id: String,
    pub current_password: String,
    pub new_id: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialChange {
    Updated,
    ConfirmMismatch,
    BadCredentials,
    /// The new id belongs to another admin.
    IdTaken,
    EmptyField,
}

impl CredentialChange {
    pub fn message(&self) -> &'static str {
        match self {
            CredentialChange::Updated => "Admin id and password updated",
            CredentialChange::ConfirmMismatch => "Confirm password does not match",
            CredentialChange::BadCredentials => "Current admin id or password does not match",
            CredentialChange::IdTaken => "New admin id is already in use",
            CredentialChange::EmptyField => "Admin id and password must not be empty",
        }
    }
}

pub struct Directory {
    conn: Connection,
}

impl Directory {
    pub async fn open(path: &Path) -> Result<Self, DirectoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        let directory = Self { conn };
        directory.init().await?;
        tracing::info!(path = %path.display(), "directory opened");
        Ok(directory)
    }

    pub async fn open_in_memory() -> Result<Self, DirectoryError> {
        let conn = Connection::open_in_memory().await?;
        let directory = Self { conn };
        directory.init().await?;
        Ok(directory)
    }

    async fn init(&self) -> Result<(), DirectoryError> {
        let seeded = self
            .conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                let admins: i64 = conn.query_row("SELECT COUNT(*) FROM admin", [], |row| row.get(0))?;
                if admins > 0 {
                    return Ok(false);
                }
                let (salt, hash) = hash_new_password(DEFAULT_ADMIN_PASSWORD);
                conn.execute(
                    "INSERT INTO admin (id, name, salt, password_hash) VALUES (?1, ?2, ?3, ?4)",
                    params![DEFAULT_ADMIN_ID, "Administrator", salt, hash],
                )?;
                Ok(true)
            })
            .await?;

        if seeded {
            tracing::warn!(
                admin = DEFAULT_ADMIN_ID,
                "seeded default admin credentials; change them before deployment"
            );
        }
        Ok(())
    }

    pub async fn insert_person(
        &self,
        id: &str,
        name: &str,
        title: &str,
        image: Option<Vec<u8>>,
    ) -> Result<InsertOutcome, DirectoryError> {
        let (id, name, title) = (id.to_string(), name.to_string(), title.to_string());
        let created_at = chrono::Utc::now().to_rfc3339();

        let outcome = self
            .conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO person (id, name, title, image, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, name, title, image, created_at],
                );
                match inserted {
                    Ok(_) => Ok(InsertOutcome::Inserted),
                    Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                        Ok(InsertOutcome::Duplicate)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        Ok(outcome)
    }

    pub async fn get_person(&self, id: &str) -> Result<Option<Person>, DirectoryError> {
        let id = id.to_string();
        let person = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, title, image IS NOT NULL FROM person WHERE id = ?1",
                        params![id],
                        person_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(person)
    }

    /// Everyone, in enrollment order.
    pub async fn list_people(&self) -> Result<Vec<Person>, DirectoryError> {
        let people = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, title, image IS NOT NULL FROM person ORDER BY rowid")?;
                let rows = stmt.query_map([], person_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(people)
    }

    pub async fn list_person_ids(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.list_people().await?.into_iter().map(|p| p.id).collect())
    }

    pub async fn count_people(&self) -> Result<usize, DirectoryError> {
        let count = self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM person", [], |row| row.get::<_, i64>(0))?))
            .await?;
        Ok(count as usize)
    }

    /// True if a row was removed.
    pub async fn delete_person(&self, id: &str) -> Result<bool, DirectoryError> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM person WHERE id = ?1", params![id])?))
            .await?;
        Ok(removed > 0)
    }

    /// Every stored reference photo, in enrollment order.
    pub async fn reference_images(&self) -> Result<Vec<ReferenceImage>, DirectoryError> {
        let images = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, title, image FROM person WHERE image IS NOT NULL ORDER BY rowid",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ReferenceImage {
                        person_id: row.get(0)?,
                        name: row.get(1)?,
                        title: row.get(2)?,
                        image: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(images)
    }

    pub async fn authenticate_admin(&self, id: &str, password: &str) -> Result<AuthOutcome, DirectoryError> {
        let (id, password) = (id.to_string(), password.to_string());
        let outcome = self
            .conn
            .call(move |conn| Ok(check_admin(conn, &id, &password)?))
            .await?;
        Ok(outcome)
    }

    pub async fn change_admin_credentials(
        &self,
        request: CredentialChangeRequest,
    ) -> Result<CredentialChange, DirectoryError> {
        if request.new_id.trim().is_empty() || request.new_password.is_empty() {
            return Ok(CredentialChange::EmptyField);
        }

        let outcome = self
            .conn
            .call(move |conn| {
                let name = match check_admin(conn, &request.current_id, &request.current_password)? {
                    AuthOutcome::Success { name } => name,
                    _ => return Ok(CredentialChange::BadCredentials),
                };
                if request.new_password != request.confirm_password {
                    return Ok(CredentialChange::ConfirmMismatch);
                }

                let tx = conn.transaction()?;
                tx.execute("DELETE FROM admin WHERE id = ?1", params![request.current_id])?;
                let (salt, hash) = hash_new_password(&request.new_password);
                let inserted = tx.execute(
                    "INSERT INTO admin (id, name, salt, password_hash) VALUES (?1, ?2, ?3, ?4)",
                    params![request.new_id, name, salt, hash],
                );
                match inserted {
                    Ok(_) => {
                        tx.commit()?;
                        Ok(CredentialChange::Updated)
                    }
                    // Dropping the transaction rolls back the delete.
                    Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                        Ok(CredentialChange::IdTaken)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        tracing::info!(outcome = ?outcome, "admin credential change");
        Ok(outcome)
    }
}

fn person_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        title: row.get(2)?,
        has_reference_image: row.get(3)?,
    })
}

fn check_admin(conn: &rusqlite::Connection, id: &str, password: &str) -> rusqlite::Result<AuthOutcome> {
    let row = conn
        .query_row(
            "SELECT name, salt, password_hash FROM admin WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, Vec<u8>>(2)?)),
        )
        .optional()?;

    Ok(match row {
        None => AuthOutcome::UnknownId,
        Some((name, salt, hash)) if hash_password(&salt, password) == hash => AuthOutcome::Success { name },
        Some(_) => AuthOutcome::WrongPassword,
    })
}

fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

fn hash_new_password(password: &str) -> (Vec<u8>, Vec<u8>) {
    let mut salt = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = hash_password(&salt, password);
    (salt, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_list_delete() {
        let dir = Directory::open_in_memory().await.unwrap();
        assert_eq!(
            dir.insert_person("p1", "Alice", "Engineer", Some(vec![1, 2, 3])).await.unwrap(),
            InsertOutcome::Inserted
        );
        dir.insert_person("p2", "Bob", "", None).await.unwrap();

        let people = dir.list_people().await.unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].name, "Alice");
        assert!(people[0].has_reference_image);
        assert!(!people[1].has_reference_image);
        assert_eq!(dir.list_person_ids().await.unwrap(), vec!["p1", "p2"]);

        let images = dir.reference_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image, vec![1, 2, 3]);

        assert!(dir.delete_person("p1").await.unwrap());
        assert!(!dir.delete_person("p1").await.unwrap());
        assert_eq!(dir.count_people().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id() {
        let dir = Directory::open_in_memory().await.unwrap();
        dir.insert_person("p1", "Alice", "", None).await.unwrap();
        assert_eq!(
            dir.insert_person("p1", "Other", "", None).await.unwrap(),
            InsertOutcome::Duplicate
        );
        let alice = dir.get_person("p1").await.unwrap().unwrap();
        assert_eq!(alice.name, "Alice");
        assert!(dir.get_person("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_admin_login() {
        let dir = Directory::open_in_memory().await.unwrap();
        assert!(matches!(
            dir.authenticate_admin("admin", "1234").await.unwrap(),
            AuthOutcome::Success { .. }
        ));
        assert_eq!(dir.authenticate_admin("admin", "nope").await.unwrap(), AuthOutcome::WrongPassword);
        assert_eq!(dir.authenticate_admin("root", "1234").await.unwrap(), AuthOutcome::UnknownId);
    }

    #[tokio::test]
    async fn test_change_credentials() {
        let dir = Directory::open_in_memory().await.unwrap();
        let request = |current: &str, new_pw: &str, confirm: &str| CredentialChangeRequest {
            current_id: "admin".into(),
            current_password: current.into(),
            new_id: "boss".into(),
            new_password: new_pw.into(),
            confirm_password: confirm.into(),
        };

        assert_eq!(
            dir.change_admin_credentials(request("bad", "s3cret", "s3cret")).await.unwrap(),
            CredentialChange::BadCredentials
        );
        assert_eq!(
            dir.change_admin_credentials(request("1234", "s3cret", "other")).await.unwrap(),
            CredentialChange::ConfirmMismatch
        );
        assert_eq!(
            dir.change_admin_credentials(request("1234", "s3cret", "s3cret")).await.unwrap(),
            CredentialChange::Updated
        );

        assert_eq!(dir.authenticate_admin("admin", "1234").await.unwrap(), AuthOutcome::UnknownId);
        assert!(matches!(
            dir.authenticate_admin("boss", "s3cret").await.unwrap(),
            AuthOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data/lobby.db");
        {
            let dir = Directory::open(&path).await.unwrap();
            dir.insert_person("p1", "Alice", "", None).await.unwrap();
        }
        let dir = Directory::open(&path).await.unwrap();
        assert_eq!(dir.count_people().await.unwrap(), 1);
    }
}
