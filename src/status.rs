//! Read-only HTTP endpoints for inspecting a running node.

use crate::log::{LogStatus, TransactionLog};
use crate::mapping::Mapping;
use crate::types::{ContentHash, LogDocument, TxKind};
use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use walkdir::WalkDir;

pub struct StatusState {
    pub log: TransactionLog,
    pub mapping: Arc<Mapping>,
}

#[derive(Debug, Serialize)]
struct DebugLogResponse {
    status: LogStatus,
    entries: LogDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Match,
    Mismatch,
    Untracked,
    MissingOnDisk,
}

#[derive(Debug, Serialize)]
pub struct FileReport {
    pub key: String,
    pub size: Option<u64>,
    pub log_type: Option<TxKind>,
    pub status: MatchStatus,
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/debug/log", get(handle_debug_log))
        .route("/debug/files", get(handle_debug_files))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<StatusState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_debug_log(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let response = {
        let log = state.log.read();
        DebugLogResponse {
            status: log.status(),
            entries: log.snapshot(),
        }
    };
    (StatusCode::OK, Json(response))
}

async fn handle_debug_files(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || file_reports(&state.log.snapshot(), &state.mapping))
        .await
    {
        Ok(files) => (StatusCode::OK, Json(files)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Compare every mapped directory against the log.
pub fn file_reports(entries: &LogDocument, mapping: &Mapping) -> Vec<FileReport> {
    let mut files = BTreeMap::new();

    for dir in mapping.directories() {
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = mapping.sync_key(entry.path()) else {
                continue;
            };
            let size = entry.metadata().ok().map(|m| m.len());
            let tx = entries.get(&key);
            let status = match tx.and_then(|tx| tx.content_hash.as_ref()) {
                None => MatchStatus::Untracked,
                Some(expected) => match ContentHash::of_file(entry.path()) {
                    Ok(actual) if &actual == expected => MatchStatus::Match,
                    _ => MatchStatus::Mismatch,
                },
            };
            files.insert(
                key.clone(),
                FileReport {
                    key,
                    size,
                    log_type: tx.map(|tx| tx.kind),
                    status,
                },
            );
        }
    }

    for (key, tx) in entries {
        if tx.is_deleted() || files.contains_key(key) || !mapping.is_local_key(key) {
            continue;
        }
        files.insert(
            key.clone(),
            FileReport {
                key: key.clone(),
                size: None,
                log_type: Some(tx.kind),
                status: MatchStatus::MissingOnDisk,
            },
        );
    }

    files.into_values().collect()
}
