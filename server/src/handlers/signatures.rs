//! Technician signature images.
//!
//! A signature is an ordinary `signatures` row keyed by the username, so
//! uploads and removals reach every device through the normal pull.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use verisync_engine::{timestamp, EntityDescriptor, SyncRecord};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

const SIGNATURES: &str = "signatures";
const ADMIN_ROLE: &str = "admin";

/// Store (or with `None`, clear) the signature image of `username`.
pub async fn store_signature(
    state: &AppState,
    user: &AuthUser,
    username: &str,
    image: Option<Vec<u8>>,
) -> Result<SyncRecord> {
    authorize_write(state, user, username)?;
    let (entity, uuid) = signature_row(state, username)?;

    let data = match image {
        Some(bytes) if bytes.is_empty() => {
            return Err(AppError::BadRequest("empty signature image".into()))
        }
        Some(bytes) => Value::String(STANDARD.encode(bytes)),
        None => Value::Null,
    };
    let record = SyncRecord::new(uuid, timestamp::now())
        .with_field("username", json!(username.trim()))
        .with_field("signature_data", data);

    let stored = state
        .backend
        .write_stamped(&state.schema, entity, record, timestamp::now())
        .await?;

    tracing::info!(
        user = %user.username,
        target = %username,
        cleared = stored.field("signature_data").is_null(),
        last_modified = %timestamp::format(&stored.last_modified),
        "Stored signature"
    );
    Ok(stored)
}

/// The signature image of `username`, if one has been uploaded.
pub async fn load_signature(state: &AppState, username: &str) -> Result<Vec<u8>> {
    let (entity, uuid) = signature_row(state, username)?;
    let missing = || AppError::NotFound(format!("no signature for {}", username));

    let record = state
        .backend
        .read_live(entity, &uuid)
        .await?
        .ok_or_else(missing)?;
    match record.field("signature_data") {
        Value::String(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| AppError::Internal(format!("corrupt signature for {}: {}", username, e))),
        _ => Err(missing()),
    }
}

/// Admins may manage any signature; technicians only their own. Without an
/// auth secret the server is in development mode and everyone may write.
fn authorize_write(state: &AppState, user: &AuthUser, username: &str) -> Result<()> {
    if state.config.auth_secret.is_none() {
        return Ok(());
    }
    let is_admin = user.role.as_deref() == Some(ADMIN_ROLE);
    let is_owner = user.username.eq_ignore_ascii_case(username.trim());
    if is_admin || is_owner {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "{} may not change the signature of {}",
            user.username, username
        )))
    }
}

fn signature_row<'a>(state: &'a AppState, username: &str) -> Result<(&'a EntityDescriptor, String)> {
    let entity = state
        .schema
        .entity(SIGNATURES)
        .ok_or_else(|| AppError::Internal("schema has no signatures table".into()))?;
    let uuid = entity
        .derive_uuid(&json!(username))
        .ok_or_else(|| AppError::BadRequest("username must not be empty".into()))?;
    Ok((entity, uuid))
}
