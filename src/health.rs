use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let stats = state.relay_stats();
    let clients = state.connected_clients();
    let upstreams = state.active_upstreams();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "transcript-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "connected_clients": clients,
            "active_upstreams": upstreams,
            "idle_clients": clients.saturating_sub(upstreams),
            "by_state": state.session_states()
        },
        "relay": {
            "frames_relayed": stats.frames_relayed,
            "frames_dropped": stats.frames_dropped,
            "drop_rate": if stats.frames_relayed + stats.frames_dropped > 0 {
                stats.frames_dropped as f64 / (stats.frames_relayed + stats.frames_dropped) as f64
            } else {
                0.0
            }
        },
        "upstream": {
            "provider": "deepgram",
            "model": config.deepgram.model,
            "language": config.deepgram.language
        }
    }))
}
