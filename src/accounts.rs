//! User accounts and login sessions.
//!
//! Passwords are stored as an iterated, salted SHA-256 digest. Sessions are
//! random 256-bit tokens kept in the `sessions` table; the HTTP layer reads
//! them from a cookie or a bearer header.

use anyhow::Result;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub user: User,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Please provide a username and password.")]
    MissingCredentials,
    #[error("Username already taken. Try login.")]
    UsernameTaken,
    #[error("Invalid username or password")]
    InvalidCredentials,
}

/// Create a user and open a session for them.
///
/// The outer `Result` carries storage failures; the inner one carries
/// rejections the user can fix.
pub fn signup(
    conn: &Connection,
    username: &str,
    password: &str,
    iterations: u32,
) -> Result<Result<Session, AuthError>> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Ok(Err(AuthError::MissingCredentials));
    }

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
        params![username],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(Err(AuthError::UsernameTaken));
    }

    let salt = random_hex(16);
    let hash = hash_password(password, &salt, iterations);
    let now = chrono::Local::now().naive_local().to_string();
    conn.execute(
        "INSERT INTO users (username, password_hash, password_salt, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![username, hash, salt, now],
    )?;
    let user = User {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
    };
    tracing::info!(user_id = user.id, "user registered");

    Ok(Ok(open_session(conn, user)?))
}

/// Verify credentials and open a new session.
pub fn login(
    conn: &Connection,
    username: &str,
    password: &str,
    iterations: u32,
) -> Result<Result<Session, AuthError>> {
    let row: Option<(i64, String, String, String)> = conn
        .query_row(
            "SELECT id, username, password_hash, password_salt FROM users WHERE username = ?1",
            params![username.trim()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((id, username, stored_hash, salt)) = row else {
        return Ok(Err(AuthError::InvalidCredentials));
    };

    if !constant_time_eq(hash_password(password, &salt, iterations).as_bytes(), stored_hash.as_bytes()) {
        tracing::debug!(user_id = id, "password mismatch");
        return Ok(Err(AuthError::InvalidCredentials));
    }

    Ok(Ok(open_session(conn, User { id, username })?))
}

pub fn logout(conn: &Connection, token: &str) -> Result<()> {
    conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
    Ok(())
}

/// Look up the user owning a session token.
pub fn resolve_session(conn: &Connection, token: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT u.id, u.username FROM sessions s JOIN users u ON u.id = s.user_id WHERE s.token = ?1",
            params![token],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn find_user(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

/// Remember the OAuth `state` issued to this session.
pub fn set_oauth_state(conn: &Connection, token: &str, state: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET oauth_state = ?1 WHERE token = ?2",
        params![state, token],
    )?;
    Ok(())
}

pub fn oauth_state(conn: &Connection, token: &str) -> Result<Option<String>> {
    let state: Option<Option<String>> = conn
        .query_row(
            "SELECT oauth_state FROM sessions WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(state.flatten())
}

fn open_session(conn: &Connection, user: User) -> Result<Session> {
    let token = random_hex(32);
    let now = chrono::Local::now().naive_local().to_string();
    conn.execute(
        "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
        params![token, user.id, now],
    )?;
    Ok(Session { token, user })
}

fn hash_password(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..iterations.max(1) {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(salt.as_bytes())
            .finalize();
    }
    hex::encode(digest)
}

/// Random bytes rendered as lowercase hex.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const ITER: u32 = 10;

    #[test]
    fn signup_then_login() {
        let conn = db::open_memory_database().unwrap();
        let session = signup(&conn, "asha", "s3cret", ITER).unwrap().unwrap();
        assert_eq!(session.user.username, "asha");
        assert_eq!(session.token.len(), 64);

        let again = login(&conn, "asha", "s3cret", ITER).unwrap().unwrap();
        assert_eq!(again.user, session.user);
        assert_ne!(again.token, session.token);
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let conn = db::open_memory_database().unwrap();
        signup(&conn, "asha", "pw", ITER).unwrap().unwrap();
        let err = signup(&conn, "asha", "other", ITER).unwrap().unwrap_err();
        assert_eq!(err, AuthError::UsernameTaken);
    }

    #[test]
    fn wrong_password_and_unknown_user_look_the_same() {
        let conn = db::open_memory_database().unwrap();
        signup(&conn, "asha", "pw", ITER).unwrap().unwrap();
        assert_eq!(
            login(&conn, "asha", "nope", ITER).unwrap().unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            login(&conn, "ghost", "pw", ITER).unwrap().unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[test]
    fn empty_fields_are_rejected() {
        let conn = db::open_memory_database().unwrap();
        assert_eq!(
            signup(&conn, "  ", "pw", ITER).unwrap().unwrap_err(),
            AuthError::MissingCredentials
        );
    }

    #[test]
    fn logout_invalidates_session() {
        let conn = db::open_memory_database().unwrap();
        let session = signup(&conn, "asha", "pw", ITER).unwrap().unwrap();
        assert!(resolve_session(&conn, &session.token).unwrap().is_some());
        logout(&conn, &session.token).unwrap();
        assert!(resolve_session(&conn, &session.token).unwrap().is_none());
    }

    #[test]
    fn oauth_state_round_trips_on_session() {
        let conn = db::open_memory_database().unwrap();
        let session = signup(&conn, "asha", "pw", ITER).unwrap().unwrap();
        assert!(oauth_state(&conn, &session.token).unwrap().is_none());
        set_oauth_state(&conn, &session.token, Some("abc")).unwrap();
        assert_eq!(oauth_state(&conn, &session.token).unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn digests_and_tokens_are_lowercase_hex() {
        assert_eq!(
            hash_password("abc", "", 1),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let token = random_hex(16);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
