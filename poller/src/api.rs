//! HTTP API of the poller, consumed by the DNS driver and the web UI.

use std::collections::HashMap;

use aprs2_model::{FullStatus, ServerStatus, SnapshotEntry};
use aprs2_store::Db;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;

pub fn router(db: Db) -> axum::Router {
    axum::Router::new()
        .route("/api/full", get(api_full))
        .route("/healthz", get(|| async { "" }))
        .with_state(db)
}

/// The full per-server status snapshot: every server's config plus its
/// latest poll result.
async fn api_full(State(db): State<Db>) -> Result<Json<FullStatus>, StatusCode> {
    let servers = db
        .servers()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let mut statuses: HashMap<String, ServerStatus> = db
        .server_statuses()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let mut ids: Vec<&String> = servers.keys().collect();
    ids.sort();

    let entries = ids
        .into_iter()
        .filter_map(|id| {
            let status = statuses.remove(id)?;
            Some(SnapshotEntry {
                config: servers[id].clone(),
                status,
            })
        })
        .collect();

    Ok(Json(FullStatus {
        result: "full".to_owned(),
        servers: entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprs2_model::{Props, Server, ServerState};
    use aprs2_store::MemStore;
    use std::sync::Arc;

    async fn serve(db: Db) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(db)).await.unwrap() });

        format!("http://{addr}")
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_owned(),
            host: Some("x".to_owned()),
            domain: Some("aprs2.net".to_owned()),
            ipv4: Some("192.0.2.1".parse().unwrap()),
            ipv6: None,
            member: vec![],
            deleted: false,
            out_of_service: false,
            email: None,
            email_alerts: false,
        }
    }

    fn status(clients: i64) -> ServerStatus {
        ServerStatus {
            status: ServerState::Ok,
            last_test: 1000,
            last_change: 900,
            props: Some(Props {
                clients: Some(clients),
                ..Props::default()
            }),
            errors: vec![],
            avail_3: None,
            avail_30: None,
        }
    }

    #[tokio::test]
    async fn full_snapshot_lists_polled_servers_sorted() {
        let db = Db::new(Arc::new(MemStore::new()));
        db.store_server(&server("T2B")).await.unwrap();
        db.store_server(&server("T2A")).await.unwrap();
        db.store_server(&server("T2UNPOLLED")).await.unwrap();
        db.set_server_status("T2B", &status(2)).await.unwrap();
        db.set_server_status("T2A", &status(1)).await.unwrap();

        let base = serve(db).await;
        let full: FullStatus = reqwest::get(format!("{base}/api/full"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(full.result, "full");
        let ids: Vec<&str> = full.servers.iter().map(|s| s.config.id.as_str()).collect();
        // Sorted, and the never-polled server is absent.
        assert_eq!(ids, vec!["T2A", "T2B"]);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let db = Db::new(Arc::new(MemStore::new()));
        let base = serve(db).await;

        let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert!(response.status().is_success());
    }
}
