use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Show a credential only as "set" or "missing".
fn redact(secret: &str) -> &'static str {
    if secret.trim().is_empty() {
        "missing"
    } else {
        "set"
    }
}

fn config_json(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "deepgram": {
            "api_key": redact(&config.deepgram.api_key),
            "url": config.deepgram.url,
            "model": config.deepgram.model,
            "language": config.deepgram.language,
            "interim_results": config.deepgram.interim_results,
            "punctuate": config.deepgram.punctuate,
            "keepalive": config.deepgram.keepalive,
            "keepalive_interval_secs": config.deepgram.keepalive_interval_secs,
            "keepalive_timeout_secs": config.deepgram.keepalive_timeout_secs,
            "connect_timeout_secs": config.deepgram.connect_timeout_secs,
            "finish_timeout_secs": config.deepgram.finish_timeout_secs
        },
        "relay": {
            "log_sample_every": config.relay.log_sample_every,
            "frame_queue_capacity": config.relay.frame_queue_capacity
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_json(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to transcription sessions started from now on",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_json(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_get_config_redacts_api_key() {
        let (state, _) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["deepgram"]["api_key"], "set");
        assert!(!body.to_string().contains("test-key"));
        assert_eq!(body["config"]["deepgram"]["model"], "nova-3");
    }

    #[actix_web::test]
    async fn test_update_config_applies_to_next_start() {
        let (state, _) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"deepgram": {"language": "es"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.upstream_options().language, "es");
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_value() {
        let (state, _) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"deepgram": {"keepalive_interval_secs": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().deepgram.keepalive_interval_secs, 5);
    }
}
