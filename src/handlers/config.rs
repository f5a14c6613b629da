//! Runtime configuration endpoints. Updates apply to new connections;
//! already-open sockets keep the knobs they were created with.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;

    #[test]
    fn partial_update_keeps_other_sections() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"usage": {"quota_recheck_secs": 5}}"#)
            .unwrap();
        assert_eq!(config.usage.quota_recheck_secs, 5);
        assert_eq!(config.streaming.partial_throttle_ms, 300);
    }
}
