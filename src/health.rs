use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Share of total queue capacity above which a load warning is reported.
const BACKLOG_WARN_RATIO: f64 = 0.8;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let registry = state.registry();
    let active_sessions = registry.active_session_count();
    let backlog = registry.total_backlog();

    let queue_status = get_queue_status(active_sessions, backlog, config.playback.max_queue_depth);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "backend": {
            "name": state.backend_name,
            "esl_enabled": config.esl.enabled,
            "fork_enabled": config.fork.enabled
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_connections": metrics.active_connections
        },
        "playback": {
            "active_sessions": active_sessions,
            "queued_items": backlog,
            "stats": state.playback_stats()
        },
        "memory": get_memory_info(),
        "queues": queue_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<serde_json::Value> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_connections": metrics.active_connections,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "playback": state.playback_stats(),
        "sessions": state.registry().list_sessions(),
        "memory": get_memory_info()
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_queue_status(active_sessions: usize, backlog: usize, max_queue_depth: usize) -> serde_json::Value {
    let capacity = active_sessions * max_queue_depth;
    let usage = if capacity > 0 {
        backlog as f64 / capacity as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "saturated"
    } else if usage > 0.7 {
        "backlogged"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "usage_percent": (usage * 100.0).round(),
        "capacity": capacity,
        "queued_items": backlog,
        "load_warnings": if usage > BACKLOG_WARN_RATIO {
            vec!["Queues are near capacity; the oldest items are being dropped"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_levels() {
        assert_eq!(get_queue_status(0, 0, 10)["status"], "normal");
        assert_eq!(get_queue_status(2, 15, 10)["status"], "backlogged");
        let saturated = get_queue_status(1, 10, 10);
        assert_eq!(saturated["status"], "saturated");
        assert_eq!(saturated["load_warnings"].as_array().map(Vec::len), Some(1));
    }
}
