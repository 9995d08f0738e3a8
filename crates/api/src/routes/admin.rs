//! Admin-only endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde_json::json;
use uuid::Uuid;

use super::{success, ClientContext};
use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Force-logout a user everywhere
pub async fn revoke_user_sessions(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    admin: AuthUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Response> {
    let sessions_revoked = state.auth_service.logout_all(user_id, &ctx).await?;

    tracing::info!(
        admin_id = %admin.user_id,
        target_user_id = %user_id,
        sessions_revoked,
        "Admin revoked user sessions"
    );

    Ok(success(
        StatusCode::OK,
        "User sessions revoked",
        json!({ "user_id": user_id, "sessions_revoked": sessions_revoked }),
    ))
}
